//! Tar block layout, header decoding and header construction.
//!
//! Only the subset of the ustar format that base backups use is handled:
//! regular files, directories and symbolic links with names of at most 100
//! bytes. All headers are 512 bytes; the fields we care about are:
//!
//! | Offset | Size | Field     |
//! |--------|------|-----------|
//! | 0      | 100  | name      |
//! | 100    | 8    | mode      |
//! | 108    | 8    | uid       |
//! | 116    | 8    | gid       |
//! | 124    | 12   | size      |
//! | 136    | 12   | mtime     |
//! | 148    | 8    | checksum  |
//! | 156    | 1    | typeflag  |
//! | 157    | 100  | linkname  |
//! | 257    | 6    | magic     |
//!
//! Numeric fields are octal ASCII, or GNU base-256 (big-endian binary with
//! the high bit of the first byte set) when the value does not fit.

use std::fmt;

use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::streamer::Member;

mod archiver;
mod parser;
mod terminator;

pub use archiver::TarArchiver;
pub use parser::TarParser;
pub use terminator::TarTerminator;

/// Size of a tar block in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Magic string for ustar headers ("ustar\0").
pub const USTAR_MAGIC: &[u8; 6] = b"ustar\0";

/// Version field for ustar headers ("00").
pub const USTAR_VERSION: &[u8; 2] = b"00";

const TYPE_REGULAR: u8 = b'0';
const TYPE_SYMLINK: u8 = b'2';
const TYPE_DIRECTORY: u8 = b'5';

/// Errors from decoding or building a header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("invalid number in tar header field {field}: {bytes:?}")]
    InvalidNumber { field: &'static str, bytes: Vec<u8> },

    #[error("file name too long for tar format: \"{0}\"")]
    NameTooLong(String),

    #[error("symbolic link target too long for tar format: file name \"{0}\", target \"{1}\"")]
    SymlinkTooLong(String, String),
}

pub type Result<T> = std::result::Result<T, HeaderError>;

/// A ustar header block with named fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UstarHeader {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub checksum: [u8; 8],
    pub typeflag: u8,
    pub linkname: [u8; 100],
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub uname: [u8; 32],
    pub gname: [u8; 32],
    pub devmajor: [u8; 8],
    pub devminor: [u8; 8],
    pub prefix: [u8; 155],
    pub pad: [u8; 12],
}

impl UstarHeader {
    /// Views a 512-byte block as a header.
    pub fn from_block(block: &[u8; BLOCK_SIZE]) -> &UstarHeader {
        // Every field is a byte array, so any 512 bytes are a valid header.
        match UstarHeader::ref_from_bytes(block) {
            Ok(header) => header,
            Err(_) => unreachable!("UstarHeader is exactly one block"),
        }
    }

    /// Extracts the descriptor of the member this header introduces.
    ///
    /// The name may come back empty; rejecting that is left to the caller so
    /// it can report it in its own terms.
    pub fn member(&self) -> Result<Member> {
        let is_directory = self.typeflag == TYPE_DIRECTORY;
        let is_link = self.typeflag == TYPE_SYMLINK;

        Ok(Member {
            pathname: String::from_utf8_lossy(truncate_null(&self.name)).into_owned(),
            size: parse_numeric("size", &self.size)?,
            mode: (parse_numeric("mode", &self.mode)? & 0o7777) as u32,
            uid: parse_numeric("uid", &self.uid)?,
            gid: parse_numeric("gid", &self.gid)?,
            is_directory,
            is_link,
            linktarget: if is_link {
                String::from_utf8_lossy(truncate_null(&self.linkname)).into_owned()
            } else {
                String::new()
            },
        })
    }

    /// Computes the header checksum.
    ///
    /// This is the unsigned sum of all header bytes with the checksum field
    /// itself counted as eight ASCII spaces.
    pub fn compute_checksum(&self) -> u64 {
        let mut header = *self;
        header.checksum = [b' '; 8];
        header.as_bytes().iter().map(|&b| u64::from(b)).sum()
    }

    /// Checks the stored checksum against the computed one.
    pub fn checksum_matches(&self) -> bool {
        parse_octal("checksum", &self.checksum).ok() == Some(self.compute_checksum())
    }

    /// Fills in the checksum field: six octal digits, a NUL and a space.
    fn set_checksum(&mut self) {
        let sum = self.compute_checksum();
        let digits = format!("{:06o}", sum & 0o777777);
        self.checksum[..6].copy_from_slice(digits.as_bytes());
        self.checksum[6] = 0;
        self.checksum[7] = b' ';
    }
}

impl fmt::Debug for UstarHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UstarHeader")
            .field("name", &String::from_utf8_lossy(truncate_null(&self.name)))
            .field("mode", &String::from_utf8_lossy(truncate_null(&self.mode)))
            .field("typeflag", &self.typeflag)
            .finish_non_exhaustive()
    }
}

/// Builds a ustar header for `member`.
///
/// Directories and symlinks get a trailing slash on their name and a size of
/// zero. Names and link targets must fit in 99 bytes.
pub fn create_header(member: &Member, mtime: u64) -> Result<[u8; BLOCK_SIZE]> {
    if member.pathname.len() > 99 {
        return Err(HeaderError::NameTooLong(member.pathname.clone()));
    }
    if member.is_link && member.linktarget.len() > 99 {
        return Err(HeaderError::SymlinkTooLong(
            member.pathname.clone(),
            member.linktarget.clone(),
        ));
    }

    let mut header = UstarHeader::new_zeroed();

    let name = member.pathname.as_bytes();
    header.name[..name.len()].copy_from_slice(name);
    if (member.is_link || member.is_directory) && !name.ends_with(b"/") {
        header.name[name.len()] = b'/';
    }

    format_numeric(&mut header.mode, u64::from(member.mode & 0o7777));
    format_numeric(&mut header.uid, member.uid);
    format_numeric(&mut header.gid, member.gid);
    format_numeric(
        &mut header.size,
        if member.is_regular() { member.size } else { 0 },
    );
    format_numeric(&mut header.mtime, mtime);

    header.typeflag = if member.is_link {
        let target = member.linktarget.as_bytes();
        header.linkname[..target.len()].copy_from_slice(target);
        TYPE_SYMLINK
    } else if member.is_directory {
        TYPE_DIRECTORY
    } else {
        TYPE_REGULAR
    };

    header.magic.copy_from_slice(USTAR_MAGIC);
    header.version.copy_from_slice(USTAR_VERSION);
    header.uname[..8].copy_from_slice(b"postgres");
    header.gname[..8].copy_from_slice(b"postgres");
    format_numeric(&mut header.devmajor, 0);
    format_numeric(&mut header.devminor, 0);

    header.set_checksum();

    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(header.as_bytes());
    Ok(block)
}

/// Returns true if every byte of `block` is zero.
pub fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Parse an octal ASCII field.
///
/// Leading spaces are skipped and the digits end at the first space or NUL.
/// An empty field is zero.
pub fn parse_octal(field: &'static str, bytes: &[u8]) -> Result<u64> {
    let invalid = || HeaderError::InvalidNumber {
        field,
        bytes: bytes.to_vec(),
    };

    let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());
    let end = bytes[start..]
        .iter()
        .position(|&b| b == b' ' || b == b'\0')
        .map_or(bytes.len(), |i| start + i);

    let mut value: u64 = 0;
    for &byte in &bytes[start..end] {
        if !(b'0'..=b'7').contains(&byte) {
            return Err(invalid());
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add(u64::from(byte - b'0')))
            .ok_or_else(invalid)?;
    }

    Ok(value)
}

/// Parse a numeric field that may be octal ASCII or GNU base-256 encoded.
pub fn parse_numeric(field: &'static str, bytes: &[u8]) -> Result<u64> {
    match bytes.first() {
        Some(&first) if first & 0x80 != 0 => {
            let mut value: u64 = u64::from(first & 0x7f);
            for &byte in &bytes[1..] {
                value = value
                    .checked_shl(8)
                    .filter(|_| value >> 56 == 0)
                    .map(|v| v | u64::from(byte))
                    .ok_or_else(|| HeaderError::InvalidNumber {
                        field,
                        bytes: bytes.to_vec(),
                    })?;
            }
            Ok(value)
        }
        _ => parse_octal(field, bytes),
    }
}

/// Write `value` into a numeric field.
///
/// Values that fit in `len - 1` octal digits are written as zero-padded
/// octal followed by a space; anything larger uses base-256 with a leading
/// 0x80 byte.
pub fn format_numeric(field: &mut [u8], mut value: u64) {
    let len = field.len();
    let octal_bits = (len - 1) * 3;

    if octal_bits >= 64 || value < (1u64 << octal_bits) {
        field[len - 1] = b' ';
        for slot in field[..len - 1].iter_mut().rev() {
            *slot = b'0' + (value & 7) as u8;
            value >>= 3;
        }
    } else {
        field[0] = 0x80;
        for slot in field[1..].iter_mut().rev() {
            *slot = (value & 0xff) as u8;
            value >>= 8;
        }
    }
}

/// Truncate a byte slice at the first null byte.
pub fn truncate_null(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(pos) => &bytes[..pos],
        None => bytes,
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(size_of::<UstarHeader>(), BLOCK_SIZE);
    }

    #[test]
    fn test_parse_octal() {
        assert_eq!(parse_octal("mode", b"0000644\0").unwrap(), 0o644);
        assert_eq!(parse_octal("mode", b"0000755 ").unwrap(), 0o755);
        assert_eq!(parse_octal("size", b"     123 ").unwrap(), 0o123);
        assert_eq!(parse_octal("size", b"").unwrap(), 0);
        assert_eq!(parse_octal("size", b"   \0\0\0").unwrap(), 0);
        assert_eq!(
            parse_octal("size", b"77777777777\0").unwrap(),
            0o77777777777
        );
    }

    #[test]
    fn test_parse_octal_invalid() {
        assert!(parse_octal("mode", b"abc").is_err());
        assert_eq!(
            parse_octal("mode", b"128").unwrap_err(),
            HeaderError::InvalidNumber {
                field: "mode",
                bytes: b"128".to_vec()
            }
        );
    }

    #[test]
    fn test_parse_numeric_base256() {
        assert_eq!(parse_numeric("uid", &[0x80, 0, 0, 1]).unwrap(), 1);
        assert_eq!(parse_numeric("uid", &[0x80, 0, 1, 0]).unwrap(), 256);
        let mut size = [0u8; 12];
        size[0] = 0x80;
        size[6] = 0x01;
        assert_eq!(parse_numeric("size", &size).unwrap(), 1 << 40);
    }

    #[test]
    fn test_format_numeric() {
        let mut field = [0u8; 8];
        format_numeric(&mut field, 0o644);
        assert_eq!(&field, b"0000644 ");

        let mut size = [0u8; 12];
        format_numeric(&mut size, 5);
        assert_eq!(&size, b"00000000005 ");

        // 8 GiB does not fit in 11 octal digits
        format_numeric(&mut size, 1 << 33);
        assert_eq!(size[0], 0x80);
        assert_eq!(parse_numeric("size", &size).unwrap(), 1 << 33);
    }

    #[test]
    fn test_truncate_null() {
        assert_eq!(truncate_null(b"hello\0world"), b"hello");
        assert_eq!(truncate_null(b"no null"), b"no null");
        assert_eq!(truncate_null(b"\0start"), b"");
    }

    #[test]
    fn test_create_header_regular() {
        let member = Member {
            pathname: "postgresql.auto.conf".into(),
            size: 23,
            mode: 0o600,
            uid: 0o4000,
            gid: 0o2000,
            ..Default::default()
        };
        let block = create_header(&member, 1_700_000_000).unwrap();
        let header = UstarHeader::from_block(&block);

        assert_eq!(truncate_null(&header.name), b"postgresql.auto.conf");
        assert_eq!(header.typeflag, b'0');
        assert_eq!(&header.magic, USTAR_MAGIC);
        assert_eq!(&header.checksum[6..], b"\0 ");
        assert!(header.checksum_matches());
        assert_eq!(header.member().unwrap(), member);
    }

    #[test]
    fn test_create_header_directory_and_link() {
        let dir = Member {
            pathname: "pg_wal".into(),
            mode: 0o700,
            is_directory: true,
            ..Default::default()
        };
        let block = create_header(&dir, 0).unwrap();
        let header = UstarHeader::from_block(&block);
        assert_eq!(truncate_null(&header.name), b"pg_wal/");
        assert_eq!(header.typeflag, b'5');
        assert_eq!(parse_numeric("size", &header.size).unwrap(), 0);

        let link = Member {
            pathname: "pg_tblspc/16384".into(),
            size: 42,
            mode: 0o777,
            is_link: true,
            linktarget: "/srv/tblspc".into(),
            ..Default::default()
        };
        let block = create_header(&link, 0).unwrap();
        let parsed = UstarHeader::from_block(&block).member().unwrap();
        assert_eq!(parsed.pathname, "pg_tblspc/16384/");
        assert!(parsed.is_link);
        assert_eq!(parsed.linktarget, "/srv/tblspc");
        assert_eq!(parsed.size, 0);
    }

    #[test]
    fn test_create_header_too_long() {
        let long = "x".repeat(100);
        assert_eq!(
            create_header(&Member::file(long.clone(), 0, 0o600), 0).unwrap_err(),
            HeaderError::NameTooLong(long.clone())
        );

        let link = Member {
            pathname: "link".into(),
            is_link: true,
            linktarget: long.clone(),
            ..Default::default()
        };
        assert_eq!(
            create_header(&link, 0).unwrap_err(),
            HeaderError::SymlinkTooLong("link".into(), long)
        );
    }

    #[test]
    fn test_matches_tar_crate_checksum() {
        let mut header = tar::Header::new_ustar();
        header.set_path("hello").unwrap();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();

        let block: &[u8; BLOCK_SIZE] = header.as_bytes();
        let ours = UstarHeader::from_block(block);
        assert!(ours.checksum_matches());
        assert_eq!(ours.member().unwrap(), Member::file("hello", 5, 0o644));
    }
}
