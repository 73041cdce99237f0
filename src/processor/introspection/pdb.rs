//! Minimal MSF 7.0 reader for the PDB info stream.

use super::{format_guid, read_u32};

const MSF_MAGIC: &[u8] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";
const INFO_STREAM: usize = 1;
const NIL_STREAM_SIZE: u32 = u32::MAX;

/// Reads stream 1 (version, signature, age, guid) and formats the symbol-server key.
pub fn symbol_hash(data: &[u8]) -> Option<String> {
    let info = read_stream(data, INFO_STREAM)?;
    let age = read_u32(&info, 8)?;
    let guid = info.get(12..28)?;
    Some(format!("{}{:X}", format_guid(guid), age))
}

fn read_stream(data: &[u8], index: usize) -> Option<Vec<u8>> {
    if data.get(..MSF_MAGIC.len())? != MSF_MAGIC {
        return None;
    }

    let block_size = read_u32(data, 32)? as usize;
    if block_size == 0 {
        return None;
    }
    let directory_size = read_u32(data, 44)? as usize;
    let block_map = read_u32(data, 52)? as usize;

    let directory_blocks = (0..directory_size.div_ceil(block_size))
        .map(|i| read_u32(data, block_map * block_size + i * 4).map(|b| b as usize))
        .collect::<Option<Vec<_>>>()?;
    let directory = gather(data, block_size, &directory_blocks, directory_size)?;

    let stream_count = read_u32(&directory, 0)? as usize;
    if index >= stream_count {
        return None;
    }

    let sizes = (0..stream_count)
        .map(|i| {
            read_u32(&directory, 4 + i * 4).map(|size| match size {
                NIL_STREAM_SIZE => 0,
                size => size as usize,
            })
        })
        .collect::<Option<Vec<_>>>()?;

    let mut offset = 4 + stream_count * 4;
    for size in &sizes[..index] {
        offset += size.div_ceil(block_size) * 4;
    }

    let size = sizes[index];
    let blocks = (0..size.div_ceil(block_size))
        .map(|i| read_u32(&directory, offset + i * 4).map(|b| b as usize))
        .collect::<Option<Vec<_>>>()?;

    gather(data, block_size, &blocks, size)
}

fn gather(data: &[u8], block_size: usize, blocks: &[usize], size: usize) -> Option<Vec<u8>> {
    let mut buffer = Vec::with_capacity(blocks.len() * block_size);
    for block in blocks {
        let start = block * block_size;
        buffer.extend_from_slice(data.get(start..start + block_size)?);
    }
    buffer.truncate(size);
    Some(buffer)
}
