//! Minimal PE reader: image timestamp, image size and CodeView (RSDS) record.

use super::{format_guid, read_u16, read_u32};

const DEBUG_DIRECTORY_INDEX: usize = 6;
const DEBUG_TYPE_CODEVIEW: u32 = 2;
const SECTION_HEADER_SIZE: usize = 40;
const DEBUG_ENTRY_SIZE: usize = 28;

struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_pointer: u32,
}

pub struct PeImage<'a> {
    data: &'a [u8],
    time_date_stamp: u32,
    size_of_image: u32,
    debug_directory: Option<(u32, u32)>,
    sections: Vec<Section>,
}

impl<'a> PeImage<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.get(0..2)? != b"MZ" {
            return None;
        }

        let pe = read_u32(data, 0x3C)? as usize;
        if data.get(pe..pe + 4)? != b"PE\0\0" {
            return None;
        }

        let coff = pe + 4;
        let number_of_sections = read_u16(data, coff + 2)? as usize;
        let time_date_stamp = read_u32(data, coff + 4)?;
        let size_of_optional_header = read_u16(data, coff + 16)? as usize;

        let optional = coff + 20;
        let directories = match read_u16(data, optional)? {
            0x10b => optional + 96,
            0x20b => optional + 112,
            _ => return None,
        };
        let size_of_image = read_u32(data, optional + 56)?;

        let debug_entry = directories + DEBUG_DIRECTORY_INDEX * 8;
        let debug_directory = if debug_entry + 8 <= optional + size_of_optional_header {
            match (read_u32(data, debug_entry), read_u32(data, debug_entry + 4)) {
                (Some(rva), Some(size)) if rva != 0 && size != 0 => Some((rva, size)),
                _ => None,
            }
        } else {
            None
        };

        let table = optional + size_of_optional_header;
        let mut sections = Vec::with_capacity(number_of_sections);
        for index in 0..number_of_sections {
            let header = table + index * SECTION_HEADER_SIZE;
            sections.push(Section {
                virtual_size: read_u32(data, header + 8)?,
                virtual_address: read_u32(data, header + 12)?,
                raw_size: read_u32(data, header + 16)?,
                raw_pointer: read_u32(data, header + 20)?,
            });
        }

        Some(Self {
            data,
            time_date_stamp,
            size_of_image,
            debug_directory,
            sections,
        })
    }

    /// Symbol-server key of the image: timestamp then size, uppercase hex
    pub fn image_hash(&self) -> String {
        format!("{:08X}{:X}", self.time_date_stamp, self.size_of_image)
    }

    fn file_offset(&self, rva: u32) -> Option<usize> {
        self.sections.iter().find_map(|section| {
            let extent = section.virtual_size.max(section.raw_size);
            (rva >= section.virtual_address && rva < section.virtual_address + extent)
                .then(|| (rva - section.virtual_address + section.raw_pointer) as usize)
        })
    }

    /// Symbol-server key of the matching pdb, from the first RSDS record
    pub fn symbol_hash(&self) -> Option<String> {
        let (rva, size) = self.debug_directory?;
        let start = self.file_offset(rva)?;
        let count = size as usize / DEBUG_ENTRY_SIZE;

        (0..count).find_map(|index| {
            let entry = start + index * DEBUG_ENTRY_SIZE;
            if read_u32(self.data, entry + 12)? != DEBUG_TYPE_CODEVIEW {
                return None;
            }
            let record = read_u32(self.data, entry + 24)? as usize;
            if self.data.get(record..record + 4)? != b"RSDS" {
                return None;
            }
            let guid = self.data.get(record + 4..record + 20)?;
            let age = read_u32(self.data, record + 20)?;
            Some(format!("{}{:X}", format_guid(guid), age))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A PE32 image with one section holding a CodeView debug record.
    pub(crate) fn build_image(time_date_stamp: u32, size_of_image: u32, rsds: Option<([u8; 16], u32)>) -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        data[0..2].copy_from_slice(b"MZ");
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());

        let pe = 0x80;
        data[pe..pe + 4].copy_from_slice(b"PE\0\0");
        let coff = pe + 4;
        data[coff + 2..coff + 4].copy_from_slice(&1u16.to_le_bytes());
        data[coff + 4..coff + 8].copy_from_slice(&time_date_stamp.to_le_bytes());
        data[coff + 16..coff + 18].copy_from_slice(&224u16.to_le_bytes());

        let optional = coff + 20;
        data[optional..optional + 2].copy_from_slice(&0x10bu16.to_le_bytes());
        data[optional + 56..optional + 60].copy_from_slice(&size_of_image.to_le_bytes());

        let section = optional + 224;
        data[section + 8..section + 12].copy_from_slice(&0x200u32.to_le_bytes());
        data[section + 12..section + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        data[section + 16..section + 20].copy_from_slice(&0x200u32.to_le_bytes());
        data[section + 20..section + 24].copy_from_slice(&0x200u32.to_le_bytes());

        if let Some((guid, age)) = rsds {
            let debug = optional + 96 + DEBUG_DIRECTORY_INDEX * 8;
            data[debug..debug + 4].copy_from_slice(&0x1000u32.to_le_bytes());
            data[debug + 4..debug + 8].copy_from_slice(&(DEBUG_ENTRY_SIZE as u32).to_le_bytes());

            let entry = 0x200;
            data[entry + 12..entry + 16].copy_from_slice(&DEBUG_TYPE_CODEVIEW.to_le_bytes());
            data[entry + 24..entry + 28].copy_from_slice(&0x240u32.to_le_bytes());

            let record = 0x240;
            data[record..record + 4].copy_from_slice(b"RSDS");
            data[record + 4..record + 20].copy_from_slice(&guid);
            data[record + 20..record + 24].copy_from_slice(&age.to_le_bytes());
        }

        data
    }

    #[test]
    fn test_image_hash() {
        let data = build_image(0x4B4B41A1, 0x1A000, None);
        let image = PeImage::parse(&data).unwrap();
        assert_eq!(image.image_hash(), "4B4B41A11A000");
        assert_eq!(image.symbol_hash(), None);
    }

    #[test]
    fn test_symbol_hash_from_rsds() {
        let guid = [
            0x6D, 0x49, 0xD5, 0x74, 0xE6, 0x80, 0xD5, 0x4E, 0xA8, 0x7D, 0x02, 0x02, 0x28, 0xAC,
            0xB5, 0x71,
        ];
        let data = build_image(1, 2, Some((guid, 1)));
        let image = PeImage::parse(&data).unwrap();
        assert_eq!(
            image.symbol_hash(),
            Some("74D5496D80E64ED5A87D020228ACB5711".to_string())
        );
    }

    #[test]
    fn test_non_pe_content() {
        assert!(PeImage::parse(b"not an image").is_none());
        assert!(PeImage::parse(b"MZ").is_none());
    }
}
