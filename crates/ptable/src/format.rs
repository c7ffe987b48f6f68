//! Index table binary format constants and header/footer/entry codecs.
//!
//! ```text
//! [HEADER 16 B]  magic u32 "IXTB" | version u8 | reserved [u8; 11]
//! [ENTRIES]      entry_count × entry_size
//! [FOOTER 16 B]  entry_count u64 | flags u32 | magic u32 "IXTF"
//! [DIGEST 16 B]  MD5 of every preceding byte (zeroed if not computed)
//! ```
//!
//! The file size is therefore always
//! `HEADER_BYTES + entry_count * entry_size + FOOTER_BYTES + DIGEST_BYTES`,
//! which the reader checks before trusting any offset.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::entry::{IndexEntry, TableVersion};

/// Magic number at the start of every table (ASCII "IXTB").
pub const TABLE_MAGIC: u32 = 0x4254_5849;

/// Magic number closing the footer (ASCII "IXTF").
pub const FOOTER_MAGIC: u32 = 0x4654_5849;

/// Size of the header: 4 (magic) + 1 (version) + 11 (reserved).
pub const HEADER_BYTES: u64 = 16;

/// Size of the footer: 8 (entry_count) + 4 (flags) + 4 (magic).
pub const FOOTER_BYTES: u64 = 8 + 4 + 4;

/// Size of the trailing MD5 digest.
pub const DIGEST_BYTES: u64 = 16;

/// Footer flag: the trailing digest was computed and can be verified.
pub const FLAG_HAS_DIGEST: u32 = 0x1;

/// Parsed table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: TableVersion,
}

/// Parsed table footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub entry_count: u64,
    pub flags: u32,
}

impl Footer {
    #[must_use]
    pub fn has_digest(&self) -> bool {
        self.flags & FLAG_HAS_DIGEST != 0
    }
}

/// Total file size implied by a version and entry count.
#[must_use]
pub fn expected_file_size(version: TableVersion, entry_count: u64) -> u64 {
    HEADER_BYTES + entry_count * version.entry_size() + FOOTER_BYTES + DIGEST_BYTES
}

/// Byte offset of entry `index`.
#[must_use]
pub fn entry_offset(version: TableVersion, index: u64) -> u64 {
    HEADER_BYTES + index * version.entry_size()
}

pub fn write_header<W: Write>(w: &mut W, version: TableVersion) -> io::Result<()> {
    w.write_u32::<LittleEndian>(TABLE_MAGIC)?;
    w.write_u8(version.as_byte())?;
    w.write_all(&[0u8; 11])?;
    Ok(())
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<Header> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != TABLE_MAGIC {
        return Err(invalid(format!("unknown table magic: {:#x}", magic)));
    }
    let raw_version = r.read_u8()?;
    let version = TableVersion::from_byte(raw_version)
        .ok_or_else(|| invalid(format!("unsupported table version {}", raw_version)))?;
    let mut reserved = [0u8; 11];
    r.read_exact(&mut reserved)?;
    Ok(Header { version })
}

pub fn write_footer<W: Write>(w: &mut W, footer: &Footer) -> io::Result<()> {
    w.write_u64::<LittleEndian>(footer.entry_count)?;
    w.write_u32::<LittleEndian>(footer.flags)?;
    w.write_u32::<LittleEndian>(FOOTER_MAGIC)?;
    Ok(())
}

pub fn read_footer<R: Read>(r: &mut R) -> io::Result<Footer> {
    let entry_count = r.read_u64::<LittleEndian>()?;
    let flags = r.read_u32::<LittleEndian>()?;
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != FOOTER_MAGIC {
        return Err(invalid(format!("unknown footer magic: {:#x}", magic)));
    }
    Ok(Footer { entry_count, flags })
}

/// Encodes `entry` in the fixed-width layout of `version`.
///
/// The caller must have checked the entry with
/// [`TableVersion::check_representable`]; v1 fields are truncated otherwise.
pub fn write_entry<W: Write>(w: &mut W, version: TableVersion, entry: &IndexEntry) -> io::Result<()> {
    match version {
        TableVersion::V1 => {
            w.write_u32::<LittleEndian>(entry.stream_hash as u32)?;
            w.write_i32::<LittleEndian>(entry.event_number as i32)?;
        }
        TableVersion::V2 => {
            w.write_u64::<LittleEndian>(entry.stream_hash)?;
            w.write_i64::<LittleEndian>(entry.event_number)?;
        }
    }
    w.write_i64::<LittleEndian>(entry.log_position)?;
    Ok(())
}

pub fn read_entry<R: Read>(r: &mut R, version: TableVersion) -> io::Result<IndexEntry> {
    let (stream_hash, event_number) = match version {
        TableVersion::V1 => (
            u64::from(r.read_u32::<LittleEndian>()?),
            i64::from(r.read_i32::<LittleEndian>()?),
        ),
        TableVersion::V2 => (r.read_u64::<LittleEndian>()?, r.read_i64::<LittleEndian>()?),
    };
    let log_position = r.read_i64::<LittleEndian>()?;
    Ok(IndexEntry {
        stream_hash,
        event_number,
        log_position,
    })
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
