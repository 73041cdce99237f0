//! Binary, symbol and source introspection.
//!
//! The contracts here are the seams between the index task and the file formats it
//! reads. The defaults understand PE images, MSF 7.0 PDBs and plain-text sources.
//! Anything else falls back to content digests.

pub mod pdb;
pub mod pe;
pub mod srcsrv;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use log::debug;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Write};
use std::sync::Arc;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};
use crate::processor::package::{Package, PackageEntry};

pub use srcsrv::SrcSrvSection;

const BINARY_EXTENSIONS: [&str; 3] = ["dll", "exe", "winmd"];
const SYMBOL_EXTENSION: &str = "pdb";

const SOURCE_EXTENSIONS: [&str; 16] = [
    "cs", "vb", "fs", "fsi", "c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx", "inl", "asm",
    "s", "idl",
];
const MIN_PATH_LENGTH: usize = 4;

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// GUID in "N" form: 32 uppercase hex digits, first three fields little-endian.
pub(crate) fn format_guid(guid: &[u8]) -> String {
    let data1 = read_u32(guid, 0).unwrap_or(0);
    let data2 = read_u16(guid, 4).unwrap_or(0);
    let data3 = read_u16(guid, 6).unwrap_or(0);
    let data4 = guid.get(8..16).map(hex::encode_upper).unwrap_or_default();
    format!("{:08X}{:04X}{:04X}{}", data1, data2, data3, data4)
}

fn md5_hex(content: &[u8]) -> String {
    hex::encode_upper(md5::compute(content).0)
}

pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Splits a path into (directory + stem, extension without the dot).
fn split_extension(path: &str) -> Option<(&str, &str)> {
    let name = file_name(path);
    let dot = name.rfind('.')?;
    let cut = path.len() - name.len() + dot;
    Some((&path[..cut], &path[cut + 1..]))
}

pub trait BinaryStoreManager: Send + Sync {
    fn read_binary_hash(&self, content: &[u8]) -> Result<String>;

    /// Key of the symbol file the binary was built with, when it records one
    fn read_pdb_hash(&self, content: &[u8]) -> Result<Option<String>>;
}

pub trait SymbolStoreManager: Send + Sync {
    fn read_hash(&self, content: &[u8]) -> Result<String>;
}

pub trait SourceExtractor: Send + Sync {
    /// Original source paths referenced by a symbol file, distinct, in file order
    fn read_sources(&self, content: &[u8]) -> Result<Vec<String>>;
}

pub trait SourceStoreManager: Send + Sync {
    fn read_hash(&self, content: &[u8]) -> Result<String>;
}

pub trait PdbStoreManager: Send + Sync {
    fn read_srcsrv(&self, content: &[u8]) -> Result<Option<SrcSrvSection>>;

    /// Returns the symbol file with `section` replacing any existing one
    fn write_srcsrv(&self, content: &[u8], section: &SrcSrvSection) -> Result<Bytes>;
}

pub trait FileCompressor: Send + Sync {
    fn compress(&self, file_name: &str, content: &[u8]) -> Result<Bytes>;
}

#[derive(Debug, Default, Clone)]
pub struct PeBinaryStoreManager;

impl BinaryStoreManager for PeBinaryStoreManager {
    fn read_binary_hash(&self, content: &[u8]) -> Result<String> {
        Ok(pe::PeImage::parse(content)
            .map(|image| image.image_hash())
            .unwrap_or_else(|| md5_hex(content)))
    }

    fn read_pdb_hash(&self, content: &[u8]) -> Result<Option<String>> {
        Ok(pe::PeImage::parse(content).and_then(|image| image.symbol_hash()))
    }
}

#[derive(Debug, Default, Clone)]
pub struct MsfSymbolStoreManager;

impl SymbolStoreManager for MsfSymbolStoreManager {
    fn read_hash(&self, content: &[u8]) -> Result<String> {
        Ok(pdb::symbol_hash(content).unwrap_or_else(|| md5_hex(content)))
    }
}

/// Finds absolute source paths among the printable runs of a symbol file.
#[derive(Debug, Default, Clone)]
pub struct ScanSourceExtractor;

impl ScanSourceExtractor {
    fn is_source_path(candidate: &str) -> bool {
        let bytes = candidate.as_bytes();
        let absolute = candidate.starts_with('/')
            || (bytes.len() > 3
                && bytes[0].is_ascii_alphabetic()
                && bytes[1] == b':'
                && (bytes[2] == b'\\' || bytes[2] == b'/'));

        absolute
            && candidate.len() >= MIN_PATH_LENGTH
            && split_extension(candidate).map_or(false, |(_, extension)| {
                SOURCE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(extension))
            })
    }
}

impl SourceExtractor for ScanSourceExtractor {
    fn read_sources(&self, content: &[u8]) -> Result<Vec<String>> {
        let mut sources: Vec<String> = Vec::new();

        let end = srcsrv::find_section(content).unwrap_or(content.len());
        for run in content[..end].split(|b| !(0x20..0x7f).contains(b)) {
            if run.len() < MIN_PATH_LENGTH {
                continue;
            }
            let candidate = String::from_utf8_lossy(run);
            let candidate = candidate.trim();
            if Self::is_source_path(candidate) && !sources.iter().any(|s| s == candidate) {
                sources.push(candidate.to_string());
            }
        }

        Ok(sources)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Sha256SourceStoreManager;

impl SourceStoreManager for Sha256SourceStoreManager {
    fn read_hash(&self, content: &[u8]) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(content)))
    }
}

/// Keeps the section as trailing text after the symbol file content.
#[derive(Debug, Default, Clone)]
pub struct TrailingPdbStoreManager;

impl PdbStoreManager for TrailingPdbStoreManager {
    fn read_srcsrv(&self, content: &[u8]) -> Result<Option<SrcSrvSection>> {
        Ok(srcsrv::find_section(content)
            .map(|start| SrcSrvSection::parse(&String::from_utf8_lossy(&content[start..]))))
    }

    fn write_srcsrv(&self, content: &[u8], section: &SrcSrvSection) -> Result<Bytes> {
        let end = srcsrv::find_section(content).unwrap_or(content.len());
        let text = section.to_string();
        let mut output = Vec::with_capacity(end + text.len());
        output.extend_from_slice(&content[..end]);
        output.extend_from_slice(text.as_bytes());
        Ok(Bytes::from(output))
    }
}

/// Single-entry deflate zip.
#[derive(Debug, Default, Clone)]
pub struct ZipFileCompressor;

impl FileCompressor for ZipFileCompressor {
    fn compress(&self, file_name: &str, content: &[u8]) -> Result<Bytes> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.start_file(file_name, options)?;
        writer.write_all(content)?;
        Ok(Bytes::from(writer.finish()?.into_inner()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub original_path: String,
    pub hash: String,
    pub file: PackageEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub hash: String,
    pub file: PackageEntry,
    pub source_infos: Vec<SourceInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryInfo {
    pub name: String,
    pub hash: String,
    /// Symbol key recorded in the binary itself
    pub symbol_hash: Option<String>,
    pub file: PackageEntry,
    pub symbol_info: Option<SymbolInfo>,
}

/// Matches source paths recorded in a symbol file to package entries by their
/// longest common trailing run of path segments.
pub struct SourceDiscover {
    extractor: Arc<dyn SourceExtractor>,
    source_store: Arc<dyn SourceStoreManager>,
}

fn split_path(path: &str) -> Vec<String> {
    path.to_lowercase()
        .split(['\\', '/'])
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn compute_level(original: &[String], proposition: &[String]) -> usize {
    original
        .iter()
        .rev()
        .zip(proposition.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
}

impl SourceDiscover {
    pub fn new(extractor: Arc<dyn SourceExtractor>, source_store: Arc<dyn SourceStoreManager>) -> Self {
        Self {
            extractor,
            source_store,
        }
    }

    pub fn find_sources(&self, entries: &[PackageEntry], symbol: &PackageEntry) -> Result<Vec<SourceInfo>> {
        let original_paths = self.extractor.read_sources(&symbol.content)?;
        let files: Vec<(Vec<String>, &PackageEntry)> = entries
            .iter()
            .map(|entry| (split_path(&entry.path), entry))
            .collect();

        let mut sources = Vec::new();
        for original_path in original_paths {
            let path = split_path(&original_path);

            let mut best: Option<(usize, &PackageEntry)> = None;
            for (split, entry) in &files {
                let level = compute_level(&path, split);
                if level > 0 && best.map_or(true, |(best_level, _)| level > best_level) {
                    best = Some((level, *entry));
                }
            }

            match best {
                Some((level, entry)) => {
                    debug!("Matched {} to {} at level {}", original_path, entry.path, level);
                    sources.push(SourceInfo {
                        hash: self.source_store.read_hash(&entry.content)?,
                        original_path,
                        file: entry.clone(),
                    });
                }
                None => debug!("No package entry matches {}", original_path),
            }
        }

        Ok(sources)
    }
}

/// Builds [`BinaryInfo`] for every binary in a package.
pub struct AddInfoBuilder {
    binary_store: Arc<dyn BinaryStoreManager>,
    symbol_store: Arc<dyn SymbolStoreManager>,
    source_discover: SourceDiscover,
}

impl AddInfoBuilder {
    pub fn new(
        binary_store: Arc<dyn BinaryStoreManager>,
        symbol_store: Arc<dyn SymbolStoreManager>,
        source_discover: SourceDiscover,
    ) -> Self {
        Self {
            binary_store,
            symbol_store,
            source_discover,
        }
    }

    fn is_binary(path: &str) -> bool {
        split_extension(path).map_or(false, |(_, extension)| {
            BINARY_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(extension))
        })
    }

    pub fn build(&self, package: &Package) -> Result<Vec<BinaryInfo>> {
        let entries = package.entries();
        entries
            .iter()
            .filter(|entry| Self::is_binary(&entry.path))
            .map(|entry| self.build_binary_info(entries, entry))
            .collect()
    }

    fn build_binary_info(&self, entries: &[PackageEntry], binary: &PackageEntry) -> Result<BinaryInfo> {
        let (base, _) = split_extension(&binary.path).ok_or_else(|| {
            Error::Introspection(format!("binary without extension: {}", binary.path))
        })?;
        let name = file_name(base).to_string();

        let hash = self.binary_store.read_binary_hash(&binary.content)?;
        let symbol_hash = self.binary_store.read_pdb_hash(&binary.content)?;

        let symbol_path = format!("{}.{}", base, SYMBOL_EXTENSION);
        let symbol_info = match entries.iter().find(|entry| entry.path == symbol_path) {
            Some(symbol) => Some(SymbolInfo {
                hash: self.symbol_store.read_hash(&symbol.content)?,
                source_infos: self.source_discover.find_sources(entries, symbol)?,
                file: symbol.clone(),
            }),
            None => None,
        };

        Ok(BinaryInfo {
            name,
            hash,
            symbol_hash,
            file: binary.clone(),
            symbol_info,
        })
    }
}

/// The set of introspection implementations a processor runs with.
#[derive(Clone)]
pub struct Introspection {
    pub binary_store: Arc<dyn BinaryStoreManager>,
    pub symbol_store: Arc<dyn SymbolStoreManager>,
    pub source_extractor: Arc<dyn SourceExtractor>,
    pub source_store: Arc<dyn SourceStoreManager>,
    pub pdb_store: Arc<dyn PdbStoreManager>,
    pub compressor: Arc<dyn FileCompressor>,
}

impl Default for Introspection {
    fn default() -> Self {
        Self {
            binary_store: Arc::new(PeBinaryStoreManager),
            symbol_store: Arc::new(MsfSymbolStoreManager),
            source_extractor: Arc::new(ScanSourceExtractor),
            source_store: Arc::new(Sha256SourceStoreManager),
            pdb_store: Arc::new(TrailingPdbStoreManager),
            compressor: Arc::new(ZipFileCompressor),
        }
    }
}

impl Introspection {
    pub fn add_info_builder(&self) -> AddInfoBuilder {
        AddInfoBuilder::new(
            self.binary_store.clone(),
            self.symbol_store.clone(),
            SourceDiscover::new(self.source_extractor.clone(), self.source_store.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PackageName;
    use crate::processor::package::PackageBuilder;
    use std::io::Read;

    fn entry(path: &str, content: &[u8]) -> PackageEntry {
        PackageEntry {
            path: path.to_string(),
            content: Bytes::copy_from_slice(content),
        }
    }

    fn package(files: Vec<PackageEntry>) -> Package {
        let mut builder = PackageBuilder::new(&PackageName::new("Lib", "1.0"));
        for file in files {
            builder.add_file(file.path, file.content);
        }
        Package::read(&builder.build().unwrap()).unwrap()
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("lib/net45/Lib.dll"), Some(("lib/net45/Lib", "dll")));
        assert_eq!(split_extension("lib/v1.0/README"), None);
        assert_eq!(file_name(r"c:\a\b.cs"), "b.cs");
    }

    #[test]
    fn test_compute_level() {
        let original = split_path(r"c:\work\Lib\Class1.cs");
        assert_eq!(compute_level(&original, &split_path("src/Lib/Class1.cs")), 2);
        assert_eq!(compute_level(&original, &split_path("src/Other/Class1.cs")), 1);
        assert_eq!(compute_level(&original, &split_path("src/Lib/Class2.cs")), 0);
    }

    #[test]
    fn test_scan_extractor_finds_distinct_absolute_paths() {
        let mut pdb = b"\x00\x01c:\\work\\Lib\\Class1.cs\x00junk\x00/home/u/lib/x.cpp\x00".to_vec();
        pdb.extend_from_slice(b"relative\\path.cs\x00c:\\work\\Lib\\Class1.cs\x00c:\\work\\notes.txt\x00");
        let sources = ScanSourceExtractor.read_sources(&pdb).unwrap();
        assert_eq!(sources, vec![r"c:\work\Lib\Class1.cs", "/home/u/lib/x.cpp"]);
    }

    #[test]
    fn test_source_hash_is_url_safe_sha256() {
        let hash = Sha256SourceStoreManager.read_hash(b"hello").unwrap();
        assert_eq!(hash, "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ");
    }

    #[test]
    fn test_fallback_hashes_for_foreign_content() {
        let binary = PeBinaryStoreManager;
        assert_eq!(
            binary.read_binary_hash(b"abc").unwrap(),
            "900150983CD24FB0D6963F7D28E17F72"
        );
        assert_eq!(binary.read_pdb_hash(b"abc").unwrap(), None);
        assert_eq!(
            MsfSymbolStoreManager.read_hash(b"abc").unwrap(),
            "900150983CD24FB0D6963F7D28E17F72"
        );
    }

    #[test]
    fn test_write_srcsrv_replaces_existing_section() {
        let store = TrailingPdbStoreManager;
        let mut first = SrcSrvSection::for_server("http://a");
        first.add_source("/a.cs", "1");
        let written = store.write_srcsrv(b"PDBDATA", &first).unwrap();

        let mut second = SrcSrvSection::for_server("http://b");
        second.add_source("/b.cs", "2");
        let rewritten = store.write_srcsrv(&written, &second).unwrap();

        assert!(rewritten.starts_with(b"PDBDATA"));
        assert_eq!(store.read_srcsrv(&rewritten).unwrap(), Some(second));
        assert_eq!(store.read_srcsrv(b"PDBDATA").unwrap(), None);
    }

    #[test]
    fn test_compressor_writes_single_named_entry() {
        let compressed = ZipFileCompressor.compress("Lib.pdb", b"symbols").unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(compressed.to_vec())).unwrap();
        assert_eq!(archive.len(), 1);
        let mut file = archive.by_name("Lib.pdb").unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"symbols");
    }

    #[test]
    fn test_add_info_builder_links_binary_symbol_and_sources() {
        let pdb = pdb::tests::build_pdb([7; 16], 1, b"\x00c:\\build\\Lib\\Class1.cs\x00c:\\build\\Lib\\Gone.cs\x00");
        let package = package(vec![
            entry("lib/net45/Lib.dll", &pe::tests::build_image(0x4B4B41A1, 0x1A000, None)),
            entry("lib/net45/Lib.pdb", &pdb),
            entry("src/Lib/Class1.cs", b"class Class1 {}"),
            entry("src/Other/Class1.cs", b"class Other {}"),
            entry("lib/net45/Tool.EXE", b"not really a binary"),
            entry("readme.txt", b"hi"),
        ]);

        let binaries = Introspection::default()
            .add_info_builder()
            .build(&package)
            .unwrap();
        assert_eq!(binaries.len(), 2);

        let lib = &binaries[0];
        assert_eq!(lib.name, "Lib");
        assert_eq!(lib.hash, "4B4B41A11A000");
        let symbol = lib.symbol_info.as_ref().unwrap();
        assert_eq!(symbol.hash, format!("{}1", "07070707070707070707070707070707"));
        assert_eq!(symbol.source_infos.len(), 1);
        assert_eq!(symbol.source_infos[0].original_path, r"c:\build\Lib\Class1.cs");
        assert_eq!(symbol.source_infos[0].file.path, "src/Lib/Class1.cs");
        assert_eq!(
            symbol.source_infos[0].hash,
            Sha256SourceStoreManager.read_hash(b"class Class1 {}").unwrap()
        );

        let tool = &binaries[1];
        assert_eq!(tool.name, "Tool");
        assert!(tool.symbol_info.is_none());
    }
}
