//! Package archives: reading uploaded nupkg files and building status packages.

use bytes::Bytes;
use serde::Serialize;
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::model::PackageName;

/// Longest version written into a package manifest
pub const MAX_VERSION_LENGTH: usize = 20;

/// Largest uncompressed entry accepted from an uploaded package
pub const MAX_ENTRY_SIZE: u64 = 1 << 30;

/// One file inside a package
#[derive(Debug, Clone, PartialEq)]
pub struct PackageEntry {
    pub path: String,
    pub content: Bytes,
}

/// A parsed package: manifest identity plus its payload files.
#[derive(Debug, Clone)]
pub struct Package {
    pub id: String,
    pub version: String,
    entries: Vec<PackageEntry>,
}

fn is_packaging_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    (lower.ends_with(".nuspec") && !lower.contains('/'))
        || lower.starts_with("_rels/")
        || lower.starts_with("package/")
        || lower == "[content_types].xml"
}

/// Text of the first `<tag>...</tag>` element, attributes allowed on the opening tag.
fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let mut search = 0;

    while let Some(found) = xml[search..].find(&open) {
        let start = search + found;
        let after_name = start + open.len();
        let rest = &xml[after_name..];
        if rest.starts_with('>') || rest.starts_with(char::is_whitespace) {
            let body_start = after_name + rest.find('>')? + 1;
            let close = format!("</{}>", tag);
            let body_end = body_start + xml[body_start..].find(&close)?;
            return Some(xml[body_start..body_end].trim());
        }
        search = after_name;
    }

    None
}

impl Package {
    pub fn read(content: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(content))
            .map_err(|e| Error::CorruptedPackage(format!("not a package archive: {}", e)))?;

        let mut manifest: Option<String> = None;
        let mut entries = Vec::new();

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }

            let path = file.name().to_string();
            if file.size() > MAX_ENTRY_SIZE {
                return Err(Error::CorruptedPackage(format!(
                    "entry {} declares {} bytes",
                    path,
                    file.size()
                )));
            }

            // the declared size is untrusted, so it only caps the read
            let mut buffer = Vec::new();
            (&mut file).take(MAX_ENTRY_SIZE + 1).read_to_end(&mut buffer)?;
            if buffer.len() as u64 > MAX_ENTRY_SIZE {
                return Err(Error::CorruptedPackage(format!("entry {} is too large", path)));
            }

            if is_packaging_file(&path) {
                if path.to_lowercase().ends_with(".nuspec") && manifest.is_none() {
                    manifest = Some(String::from_utf8_lossy(&buffer).to_string());
                }
                continue;
            }

            entries.push(PackageEntry {
                path,
                content: Bytes::from(buffer),
            });
        }

        let manifest =
            manifest.ok_or_else(|| Error::CorruptedPackage("missing manifest".to_string()))?;
        let id = element_text(&manifest, "id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::CorruptedPackage("manifest has no id".to_string()))?;
        let version = element_text(&manifest, "version")
            .filter(|version| !version.is_empty())
            .ok_or_else(|| Error::CorruptedPackage("manifest has no version".to_string()))?;

        Ok(Self {
            id: id.to_string(),
            version: version.to_string(),
            entries,
        })
    }

    pub fn name(&self) -> PackageName {
        PackageName::new(self.id.clone(), self.version.clone())
    }

    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    pub fn entry(&self, path: &str) -> Option<&PackageEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Builds a package with a minimal manifest.
#[derive(Debug)]
pub struct PackageBuilder {
    id: String,
    version: String,
    files: Vec<PackageEntry>,
}

impl PackageBuilder {
    pub fn new(package_name: &PackageName) -> Self {
        Self {
            id: package_name.id.clone(),
            version: package_name
                .version
                .chars()
                .take(MAX_VERSION_LENGTH)
                .collect(),
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<Bytes>) {
        self.files.push(PackageEntry {
            path: path.into(),
            content: content.into(),
        });
    }

    /// Adds `value` as pretty-printed JSON
    pub fn add_json<T: Serialize>(&mut self, path: impl Into<String>, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value)?;
        self.add_file(path, content);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[PackageEntry] {
        &self.files
    }

    pub fn build(&self) -> Result<Bytes> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        writer.start_file(format!("{}.nuspec", self.id), options)?;
        write!(
            writer,
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <package>\n  <metadata>\n    <id>{}</id>\n    <version>{}</version>\n  </metadata>\n</package>\n",
            escape_xml(&self.id),
            escape_xml(&self.version)
        )?;

        for file in &self.files {
            writer.start_file(file.path.as_str(), options)?;
            writer.write_all(&file.content)?;
        }

        Ok(Bytes::from(writer.finish()?.into_inner()))
    }
}
