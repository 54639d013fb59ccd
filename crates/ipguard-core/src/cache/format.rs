//! Binary on-disk layout for a [`super::CacheRecord`].
//!
//! ```text
//! magic:u32 | version:u16 | content_md5:[u8;16] | entry_count:u32
//! repeated entry_count times:
//!   addr_len:u16 | addr:[u8;addr_len] | count:u32 | country:[u8;2]
//! ```
//!
//! `country` is `[0,0]` when absent. A magic number and version field
//! guard against misinterpreting a cache file written by a future,
//! incompatible format.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::error::CacheError;

pub(super) const MAGIC: u32 = 0x4950_4743; // "IPGC"
pub(super) const VERSION: u16 = 1;

pub(super) fn encode(
    content_md5: &[u8; 16],
    entries: &BTreeMap<String, (u32, Option<String>)>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + entries.len() * 24);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(content_md5);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (addr, (count, country)) in entries {
        let addr_bytes = addr.as_bytes();
        buf.extend_from_slice(&(addr_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(addr_bytes);
        buf.extend_from_slice(&count.to_le_bytes());
        let mut code = [0u8; 2];
        if let Some(c) = country {
            let cb = c.as_bytes();
            if cb.len() == 2 {
                code.copy_from_slice(cb);
            }
        }
        buf.extend_from_slice(&code);
    }
    buf
}

pub(super) fn decode(
    path: &std::path::Path,
    mut bytes: &[u8],
) -> Result<([u8; 16], BTreeMap<String, (u32, Option<String>)>), CacheError> {
    let err_io = |e: io::Error| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    };

    let magic = read_u32(&mut bytes).map_err(err_io)?;
    if magic != MAGIC {
        return Err(CacheError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let version = read_u16(&mut bytes).map_err(err_io)?;
    if version != VERSION {
        return Err(CacheError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let mut content_md5 = [0u8; 16];
    bytes.read_exact(&mut content_md5).map_err(|_| {
        CacheError::Malformed {
            path: path.to_path_buf(),
            reason: "truncated header",
        }
    })?;
    let entry_count = read_u32(&mut bytes).map_err(err_io)?;

    let mut entries = BTreeMap::new();
    for _ in 0..entry_count {
        let addr_len = read_u16(&mut bytes).map_err(err_io)? as usize;
        if bytes.len() < addr_len + 4 + 2 {
            return Err(CacheError::Malformed {
                path: path.to_path_buf(),
                reason: "truncated entry",
            });
        }
        let mut addr_buf = vec![0u8; addr_len];
        bytes.read_exact(&mut addr_buf).map_err(err_io)?;
        let addr = String::from_utf8(addr_buf).map_err(|_| CacheError::Malformed {
            path: path.to_path_buf(),
            reason: "address is not valid utf-8",
        })?;
        let count = read_u32(&mut bytes).map_err(err_io)?;
        let mut code = [0u8; 2];
        bytes.read_exact(&mut code).map_err(err_io)?;
        let country = if code == [0, 0] {
            None
        } else {
            Some(String::from_utf8_lossy(&code).into_owned())
        };
        entries.insert(addr, (count, country));
    }

    Ok((content_md5, entries))
}

fn read_u32(bytes: &mut &[u8]) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    bytes.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u16(bytes: &mut &[u8]) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    bytes.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(super) fn write_all(mut w: impl Write, bytes: &[u8]) -> io::Result<()> {
    w.write_all(bytes)
}
