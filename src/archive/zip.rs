//! Just enough of the ZIP format to read entries through byte ranges.
//!
//! Reference: PKWARE APPNOTE.TXT, sections 4.3.7 (local file header),
//! 4.3.12 (central directory header) and 4.3.16 (end of central directory).

use std::io::Read;

use flate2::Crc;
use flate2::read::DeflateDecoder;
use regex::Regex;
use serde::Serialize;

use crate::error::AcquisitionError;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_SIGNATURE: u32 = 0x0403_4b50;

pub const EOCD_LEN: usize = 22;
const CENTRAL_HEADER_LEN: usize = 46;
pub const LOCAL_HEADER_LEN: usize = 30;
const MAX_COMMENT_LEN: usize = 0xffff;

/// Largest tail that can contain the end-of-central-directory record.
pub const MAX_TAIL_LEN: u64 = (EOCD_LEN + MAX_COMMENT_LEN) as u64;

const ZIP64_MARKER: u32 = 0xffff_ffff;

/// Upper bound on the buffer reserved up front from a header's size field.
const MAX_PREALLOC: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Compression {
    Stored,
    Deflated,
    Other(u16),
}

impl From<u16> for Compression {
    fn from(method: u16) -> Self {
        match method {
            0 => Compression::Stored,
            8 => Compression::Deflated,
            other => Compression::Other(other),
        }
    }
}

/// One central directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipEntry {
    pub name: String,
    pub compression: Compression,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Offset of the local file header.
    pub offset: u64,
}

impl ZipEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub entries: usize,
    pub directory_size: u64,
    pub directory_offset: u64,
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn invalid(msg: impl Into<String>) -> AcquisitionError {
    AcquisitionError::InvalidArchive(msg.into())
}

/// Scan `tail` (the last bytes of an archive) backwards for the
/// end-of-central-directory record.
pub fn find_eocd(tail: &[u8]) -> Result<EndOfCentralDirectory, AcquisitionError> {
    if tail.len() < EOCD_LEN {
        return Err(invalid("archive too short"));
    }

    for pos in (0..=tail.len() - EOCD_LEN).rev() {
        if u32_at(tail, pos) != EOCD_SIGNATURE {
            continue;
        }
        let comment_len = u16_at(tail, pos + 20) as usize;
        if pos + EOCD_LEN + comment_len > tail.len() {
            // A signature inside the comment or entry data.
            continue;
        }

        let entries = u16_at(tail, pos + 10) as usize;
        let directory_size = u32_at(tail, pos + 12);
        let directory_offset = u32_at(tail, pos + 16);
        if directory_size == ZIP64_MARKER || directory_offset == ZIP64_MARKER {
            return Err(invalid("zip64 archives are not supported"));
        }

        return Ok(EndOfCentralDirectory {
            entries,
            directory_size: directory_size as u64,
            directory_offset: directory_offset as u64,
        });
    }

    Err(invalid("end of central directory not found"))
}

/// Parse `expected` central directory records from `data`.
pub fn parse_central_directory(
    data: &[u8],
    expected: usize,
) -> Result<Vec<ZipEntry>, AcquisitionError> {
    let mut entries = Vec::with_capacity(expected);
    let mut pos = 0;

    for _ in 0..expected {
        if pos + CENTRAL_HEADER_LEN > data.len() {
            return Err(invalid("truncated central directory"));
        }
        if u32_at(data, pos) != CENTRAL_SIGNATURE {
            return Err(invalid(format!("bad central directory signature at {pos}")));
        }

        let method = u16_at(data, pos + 10);
        let crc32 = u32_at(data, pos + 16);
        let compressed_size = u32_at(data, pos + 20);
        let uncompressed_size = u32_at(data, pos + 24);
        let name_len = u16_at(data, pos + 28) as usize;
        let extra_len = u16_at(data, pos + 30) as usize;
        let comment_len = u16_at(data, pos + 32) as usize;
        let offset = u32_at(data, pos + 42);

        let name_start = pos + CENTRAL_HEADER_LEN;
        let next = name_start + name_len + extra_len + comment_len;
        if next > data.len() {
            return Err(invalid("truncated central directory record"));
        }
        if compressed_size == ZIP64_MARKER || offset == ZIP64_MARKER {
            return Err(invalid("zip64 entries are not supported"));
        }

        let name = String::from_utf8_lossy(&data[name_start..name_start + name_len]).into_owned();
        entries.push(ZipEntry {
            name,
            compression: Compression::from(method),
            crc32,
            compressed_size: compressed_size as u64,
            uncompressed_size: uncompressed_size as u64,
            offset: offset as u64,
        });
        pos = next;
    }

    Ok(entries)
}

/// Find an entry by exact name, or by `{name}-{hash}.bin` for target binaries.
pub fn find_entry<'a>(entries: &'a [ZipEntry], name: &str) -> Option<&'a ZipEntry> {
    if let Some(entry) = entries.iter().find(|e| e.name == name) {
        return Some(entry);
    }
    let pattern = Regex::new(&format!(r"^{}-[^/]+\.bin$", regex::escape(name))).ok()?;
    entries.iter().find(|e| pattern.is_match(&e.name))
}

/// Decode an entry from bytes starting at its local file header.
pub fn decode_entry(entry: &ZipEntry, raw: &[u8]) -> Result<Vec<u8>, AcquisitionError> {
    if raw.len() < LOCAL_HEADER_LEN || u32_at(raw, 0) != LOCAL_SIGNATURE {
        return Err(invalid(format!("bad local header for {}", entry.name)));
    }

    // The local extra field may differ from the central one.
    let name_len = u16_at(raw, 26) as usize;
    let extra_len = u16_at(raw, 28) as usize;
    let start = LOCAL_HEADER_LEN + name_len + extra_len;
    let end = start + entry.compressed_size as usize;
    if end > raw.len() {
        return Err(invalid(format!("truncated entry {}", entry.name)));
    }
    let data = &raw[start..end];

    let content = match entry.compression {
        Compression::Stored => data.to_vec(),
        Compression::Deflated => {
            // Declared sizes are untrusted: stop one byte past the declared
            // size instead of inflating the whole stream.
            let declared = entry.uncompressed_size;
            let mut out = Vec::with_capacity(declared.min(MAX_PREALLOC) as usize);
            DeflateDecoder::new(data)
                .take(declared.saturating_add(1))
                .read_to_end(&mut out)
                .map_err(|e| invalid(format!("failed to inflate {}: {e}", entry.name)))?;
            if out.len() as u64 > declared {
                return Err(AcquisitionError::IntegrityMismatch {
                    name: entry.name.clone(),
                });
            }
            out
        }
        Compression::Other(method) => {
            return Err(AcquisitionError::UnsupportedCompression {
                name: entry.name.clone(),
                method,
            });
        }
    };

    let mut crc = Crc::new();
    crc.update(&content);
    if content.len() as u64 != entry.uncompressed_size || crc.sum() != entry.crc32 {
        return Err(AcquisitionError::IntegrityMismatch {
            name: entry.name.clone(),
        });
    }

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single stored entry followed by its central directory and EOCD.
    fn stored_archive(name: &str, content: &[u8], comment: &[u8]) -> Vec<u8> {
        let mut crc = Crc::new();
        crc.update(content);

        let mut out = Vec::new();
        out.extend_from_slice(&LOCAL_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(content);

        let cd_offset = out.len();
        out.extend_from_slice(&CENTRAL_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        let cd_size = out.len() - cd_offset;

        out.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0]);
        out.extend_from_slice(&(cd_size as u32).to_le_bytes());
        out.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        out.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        out.extend_from_slice(comment);
        out
    }

    #[test]
    fn parses_stored_entry_round_trip() {
        let archive = stored_archive("fw.json", br#"{"targets":[]}"#, b"");
        let eocd = find_eocd(&archive).unwrap();
        assert_eq!(eocd.entries, 1);

        let start = eocd.directory_offset as usize;
        let end = start + eocd.directory_size as usize;
        let entries = parse_central_directory(&archive[start..end], eocd.entries).unwrap();
        assert_eq!(entries[0].name, "fw.json");
        assert_eq!(entries[0].compression, Compression::Stored);

        let content = decode_entry(&entries[0], &archive[entries[0].offset as usize..]).unwrap();
        assert_eq!(content, br#"{"targets":[]}"#);
    }

    #[test]
    fn eocd_found_behind_comment() {
        let archive = stored_archive("a.txt", b"hello", b"release notes PK\x05\x06 inside");
        let eocd = find_eocd(&archive).unwrap();
        assert_eq!(eocd.entries, 1);
    }

    #[test]
    fn missing_eocd_is_invalid() {
        let err = find_eocd(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidArchive(_)));
        assert!(find_eocd(&[0u8; 4]).is_err());
    }

    #[test]
    fn corrupted_content_fails_crc() {
        let mut archive = stored_archive("a.txt", b"hello", b"");
        let eocd = find_eocd(&archive).unwrap();
        let start = eocd.directory_offset as usize;
        let entries =
            parse_central_directory(&archive[start..start + eocd.directory_size as usize], 1)
                .unwrap();

        let data_at = LOCAL_HEADER_LEN + "a.txt".len();
        archive[data_at] ^= 0xff;
        let err = decode_entry(&entries[0], &archive).unwrap_err();
        assert!(matches!(err, AcquisitionError::IntegrityMismatch { .. }));
    }

    /// Local header for `name` followed by `data`; sizes come from the central entry.
    fn local_record(name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LOCAL_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[0; 22]);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn inflating_past_declared_size_is_rejected() {
        use flate2::write::DeflateEncoder;
        use std::io::Write;

        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::best());
        encoder.write_all(&vec![0u8; 8 << 20]).unwrap();
        let bomb = encoder.finish().unwrap();
        assert!(bomb.len() < 64 * 1024);

        let mut crc = Crc::new();
        crc.update(&[0u8; 10]);
        let entry = ZipEntry {
            name: "assets/zeros.bin".to_string(),
            compression: Compression::Deflated,
            crc32: crc.sum(),
            compressed_size: bomb.len() as u64,
            uncompressed_size: 10,
            offset: 0,
        };

        let err = decode_entry(&entry, &local_record(&entry.name, &bomb)).unwrap_err();
        assert!(matches!(err, AcquisitionError::IntegrityMismatch { .. }));
    }

    #[test]
    fn huge_declared_size_does_not_reserve_it_up_front() {
        use flate2::write::DeflateEncoder;
        use std::io::Write;

        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello").unwrap();
        let data = encoder.finish().unwrap();

        let entry = ZipEntry {
            name: "hello.txt".to_string(),
            compression: Compression::Deflated,
            crc32: 0,
            compressed_size: data.len() as u64,
            uncompressed_size: u32::MAX as u64,
            offset: 0,
        };

        let err = decode_entry(&entry, &local_record(&entry.name, &data)).unwrap_err();
        assert!(matches!(err, AcquisitionError::IntegrityMismatch { .. }));
    }

    #[test]
    fn find_entry_exact_and_hashed_binary() {
        let entry = |name: &str| ZipEntry {
            name: name.to_string(),
            compression: Compression::Stored,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            offset: 0,
        };
        let entries = vec![
            entry("fw.json"),
            entry("tx16s-1a2b3c4.bin"),
            entry("t16-9f8e7d6.bin"),
            entry("bootloader/t16-9f8e7d6.bin"),
        ];

        assert_eq!(find_entry(&entries, "fw.json").unwrap().name, "fw.json");
        assert_eq!(find_entry(&entries, "t16").unwrap().name, "t16-9f8e7d6.bin");
        assert_eq!(
            find_entry(&entries, "bootloader/t16").unwrap().name,
            "bootloader/t16-9f8e7d6.bin"
        );
        assert!(find_entry(&entries, "tx16").is_none());
        assert!(find_entry(&entries, "x10").is_none());
    }
}
