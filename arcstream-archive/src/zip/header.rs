//! ZIP wire structures
//!
//! Record layouts shared by the streaming decoder and encoder: local file
//! headers, data descriptors, central directory entries and the DOS
//! date/time fields. All integers are little-endian.

use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::read_exact_or_eof;

/// Local file header signature (PK\x03\x04)
pub const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4B50;

/// Central directory header signature (PK\x01\x02)
pub const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4B50;

/// End of central directory signature (PK\x05\x06)
pub const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4B50;

/// ZIP64 end of central directory signature
pub const ZIP64_END_OF_CENTRAL_DIR_SIG: u32 = 0x0606_4B50;

/// ZIP64 end of central directory locator signature
pub const ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG: u32 = 0x0706_4B50;

/// Data descriptor signature (PK\x07\x08, optional on the wire)
pub const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4B50;

/// ZIP64 extended information extra field ID
pub const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;

/// Marker value signalling a ZIP64 64-bit field (32-bit fields)
pub const ZIP64_MARKER_32: u32 = 0xFFFF_FFFF;

/// Marker value signalling a ZIP64 64-bit field (16-bit fields)
pub const ZIP64_MARKER_16: u16 = 0xFFFF;

/// Flag bit: sizes and CRC follow the content in a data descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// Flag bit: name and comment are UTF-8
pub const FLAG_UTF8: u16 = 0x0800;

/// Extra field ID the `jar` tool stamps on the first local header
pub const JAR_MARKER_EXTRA_ID: u16 = 0xCAFE;

/// Human-readable name for a compression method ID
pub fn method_name(method: u16) -> String {
    match method {
        0 => "stored".to_string(),
        8 => "deflate".to_string(),
        9 => "deflate64".to_string(),
        12 => "bzip2".to_string(),
        14 => "lzma".to_string(),
        93 => "zstd".to_string(),
        95 => "xz".to_string(),
        99 => "aes".to_string(),
        other => format!("method {other}"),
    }
}

fn read_le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn days_from_civil(year: i64, month: u64, day: u64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}

fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    (if month <= 2 { y + 1 } else { y }, month, day)
}

/// Convert DOS date/time fields to a `SystemTime`
pub fn dos_to_system_time(time: u16, date: u16) -> SystemTime {
    let year = i64::from(date >> 9) + 1980;
    let month = u64::from((date >> 5) & 0x0F).clamp(1, 12);
    let day = u64::from(date & 0x1F).max(1);
    let days = days_from_civil(year, month, day);
    let secs = days * 86400
        + i64::from(time >> 11) * 3600
        + i64::from((time >> 5) & 0x3F) * 60
        + i64::from(time & 0x1F) * 2;
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// Convert a `SystemTime` to DOS date/time fields, clamped to the DOS epoch
pub fn system_time_to_dos(when: SystemTime) -> (u16, u16) {
    let secs = when
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let (year, month, day) = civil_from_days((secs / 86400) as i64);
    if year < 1980 {
        return (0, 0x0021);
    }
    let year = year.min(2107);
    let tod = secs % 86400;
    let time = (((tod / 3600) << 11) | (((tod % 3600) / 60) << 5) | ((tod % 60) / 2)) as u16;
    let date = (((year - 1980) as u16) << 9) | ((month as u16) << 5) | day as u16;
    (time, date)
}

/// Local file header, sizes already resolved through any ZIP64 extra field
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    /// General purpose bit flag
    pub flags: u16,
    /// Compression method ID
    pub method: u16,
    /// Modification time, DOS format
    pub mtime: u16,
    /// Modification date, DOS format
    pub mdate: u16,
    /// CRC-32 of the uncompressed content, zero when deferred to a descriptor
    pub crc32: u32,
    /// Compressed size
    pub compressed_size: u64,
    /// Uncompressed size
    pub uncompressed_size: u64,
    /// Entry name
    pub name: String,
    /// A ZIP64 extra field was present
    pub zip64: bool,
}

impl LocalFileHeader {
    /// Read the remainder of a local file header, the four signature bytes
    /// having been consumed by the caller
    pub fn read_body(src: &mut dyn Read, offset: u64) -> Result<Self> {
        let mut buf = [0u8; 26];
        let n = read_exact_or_eof(src, &mut buf)?;
        if n < buf.len() {
            return Err(ArcStreamError::truncated((buf.len() - n) as u64));
        }

        let flags = read_le_u16(&buf, 2);
        let method = read_le_u16(&buf, 4);
        let mtime = read_le_u16(&buf, 6);
        let mdate = read_le_u16(&buf, 8);
        let crc32 = read_le_u32(&buf, 10);
        let compressed_size = read_le_u32(&buf, 14);
        let uncompressed_size = read_le_u32(&buf, 18);
        let name_len = read_le_u16(&buf, 22) as usize;
        let extra_len = read_le_u16(&buf, 24) as usize;

        let mut name_buf = vec![0u8; name_len];
        let n = read_exact_or_eof(src, &mut name_buf)?;
        if n < name_len {
            return Err(ArcStreamError::truncated((name_len - n) as u64));
        }
        let mut extra = vec![0u8; extra_len];
        let n = read_exact_or_eof(src, &mut extra)?;
        if n < extra_len {
            return Err(ArcStreamError::truncated((extra_len - n) as u64));
        }
        if name_len == 0 {
            return Err(ArcStreamError::malformed(offset, "zip entry name is empty"));
        }

        let marked = uncompressed_size == ZIP64_MARKER_32 || compressed_size == ZIP64_MARKER_32;
        let (uncompressed_64, compressed_64) = if marked {
            parse_zip64_extra(&extra, uncompressed_size, compressed_size)
        } else {
            (None, None)
        };

        Ok(Self {
            flags,
            method,
            mtime,
            mdate,
            crc32,
            compressed_size: compressed_64.unwrap_or(u64::from(compressed_size)),
            uncompressed_size: uncompressed_64.unwrap_or(u64::from(uncompressed_size)),
            name: String::from_utf8_lossy(&name_buf).into_owned(),
            zip64: marked,
        })
    }

    /// True when bit 3 defers CRC and sizes to a trailing data descriptor
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

/// Scan an extra field block for ZIP64 sizes
///
/// Values appear in the ZIP64 field only for header fields carrying the
/// marker, in the fixed order uncompressed then compressed size.
pub fn parse_zip64_extra(
    extra: &[u8],
    uncompressed_size: u32,
    compressed_size: u32,
) -> (Option<u64>, Option<u64>) {
    let mut offset = 0;
    while offset + 4 <= extra.len() {
        let header_id = read_le_u16(extra, offset);
        let data_size = read_le_u16(extra, offset + 2) as usize;
        offset += 4;

        if header_id == ZIP64_EXTRA_FIELD_ID && offset + data_size <= extra.len() {
            let mut at = offset;
            let end = offset + data_size;
            let mut uncompressed_64 = None;
            let mut compressed_64 = None;

            if uncompressed_size == ZIP64_MARKER_32 && at + 8 <= end {
                uncompressed_64 = Some(read_le_u64(extra, at));
                at += 8;
            }
            if compressed_size == ZIP64_MARKER_32 && at + 8 <= end {
                compressed_64 = Some(read_le_u64(extra, at));
            }
            return (uncompressed_64, compressed_64);
        }
        offset += data_size;
    }
    (None, None)
}

/// Data descriptor trailing an entry written with flag bit 3
#[derive(Debug, Clone, Copy)]
pub struct DataDescriptor {
    /// CRC-32 of the uncompressed content
    pub crc32: u32,
    /// Compressed size
    pub compressed_size: u64,
    /// Uncompressed size
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    /// Read a descriptor; the leading signature is optional on the wire and
    /// the sizes widen to eight bytes for ZIP64 entries
    pub fn read(src: &mut dyn Read, zip64: bool) -> Result<Self> {
        let mut word = [0u8; 4];
        let n = read_exact_or_eof(src, &mut word)?;
        if n < 4 {
            return Err(ArcStreamError::truncated((4 - n) as u64));
        }

        let first = u32::from_le_bytes(word);
        let crc32 = if first == DATA_DESCRIPTOR_SIG {
            let n = read_exact_or_eof(src, &mut word)?;
            if n < 4 {
                return Err(ArcStreamError::truncated((4 - n) as u64));
            }
            u32::from_le_bytes(word)
        } else {
            first
        };

        let mut read_size = |src: &mut dyn Read| -> Result<u64> {
            if zip64 {
                let mut wide = [0u8; 8];
                let n = read_exact_or_eof(src, &mut wide)?;
                if n < 8 {
                    return Err(ArcStreamError::truncated((8 - n) as u64));
                }
                Ok(u64::from_le_bytes(wide))
            } else {
                let n = read_exact_or_eof(src, &mut word)?;
                if n < 4 {
                    return Err(ArcStreamError::truncated((4 - n) as u64));
                }
                Ok(u64::from(u32::from_le_bytes(word)))
            }
        };
        let compressed_size = read_size(src)?;
        let uncompressed_size = read_size(src)?;

        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }

    /// Write a descriptor with the leading signature
    pub fn write(&self, sink: &mut dyn Write, zip64: bool) -> Result<()> {
        sink.write_all(&DATA_DESCRIPTOR_SIG.to_le_bytes())?;
        sink.write_all(&self.crc32.to_le_bytes())?;
        if zip64 {
            sink.write_all(&self.compressed_size.to_le_bytes())?;
            sink.write_all(&self.uncompressed_size.to_le_bytes())?;
        } else {
            sink.write_all(&(self.compressed_size as u32).to_le_bytes())?;
            sink.write_all(&(self.uncompressed_size as u32).to_le_bytes())?;
        }
        Ok(())
    }
}

/// One record accumulated for the central directory
#[derive(Debug, Clone)]
pub struct CentralDirEntry {
    /// Version needed to extract
    pub version_needed: u16,
    /// General purpose bit flag
    pub flags: u16,
    /// Compression method ID
    pub method: u16,
    /// Modification time, DOS format
    pub mtime: u16,
    /// Modification date, DOS format
    pub mdate: u16,
    /// CRC-32 of the uncompressed content
    pub crc32: u32,
    /// Compressed size
    pub compressed_size: u64,
    /// Uncompressed size
    pub uncompressed_size: u64,
    /// Entry name
    pub name: String,
    /// External attributes, Unix mode in the high half
    pub external_attr: u32,
    /// Offset of the matching local header
    pub local_header_offset: u64,
}

impl CentralDirEntry {
    /// True when any field overflows its 32-bit slot
    pub fn needs_zip64(&self) -> bool {
        self.compressed_size >= u64::from(ZIP64_MARKER_32)
            || self.uncompressed_size >= u64::from(ZIP64_MARKER_32)
            || self.local_header_offset >= u64::from(ZIP64_MARKER_32)
    }

    fn build_zip64_extra(&self) -> Vec<u8> {
        if !self.needs_zip64() {
            return Vec::new();
        }
        let wide = u64::from(ZIP64_MARKER_32);
        let mut fields = Vec::with_capacity(3);
        if self.uncompressed_size >= wide {
            fields.push(self.uncompressed_size);
        }
        if self.compressed_size >= wide {
            fields.push(self.compressed_size);
        }
        if self.local_header_offset >= wide {
            fields.push(self.local_header_offset);
        }

        let mut extra = Vec::with_capacity(4 + fields.len() * 8);
        extra.extend_from_slice(&ZIP64_EXTRA_FIELD_ID.to_le_bytes());
        extra.extend_from_slice(&((fields.len() * 8) as u16).to_le_bytes());
        for value in fields {
            extra.extend_from_slice(&value.to_le_bytes());
        }
        extra
    }

    /// Serialize this record
    pub fn write(&self, sink: &mut dyn Write) -> Result<()> {
        let name_bytes = self.name.as_bytes();
        let zip64_extra = self.build_zip64_extra();
        let wide = u64::from(ZIP64_MARKER_32);

        let compressed_32 = if self.compressed_size >= wide {
            ZIP64_MARKER_32
        } else {
            self.compressed_size as u32
        };
        let uncompressed_32 = if self.uncompressed_size >= wide {
            ZIP64_MARKER_32
        } else {
            self.uncompressed_size as u32
        };
        let offset_32 = if self.local_header_offset >= wide {
            ZIP64_MARKER_32
        } else {
            self.local_header_offset as u32
        };
        let version_needed = if self.needs_zip64() {
            45
        } else {
            self.version_needed
        };

        sink.write_all(&CENTRAL_DIR_HEADER_SIG.to_le_bytes())?;
        // version made by: Unix host, format version 3.0
        sink.write_all(&0x031Eu16.to_le_bytes())?;
        sink.write_all(&version_needed.to_le_bytes())?;
        sink.write_all(&self.flags.to_le_bytes())?;
        sink.write_all(&self.method.to_le_bytes())?;
        sink.write_all(&self.mtime.to_le_bytes())?;
        sink.write_all(&self.mdate.to_le_bytes())?;
        sink.write_all(&self.crc32.to_le_bytes())?;
        sink.write_all(&compressed_32.to_le_bytes())?;
        sink.write_all(&uncompressed_32.to_le_bytes())?;
        sink.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
        sink.write_all(&(zip64_extra.len() as u16).to_le_bytes())?;
        // comment length, disk start, internal attributes
        sink.write_all(&0u16.to_le_bytes())?;
        sink.write_all(&0u16.to_le_bytes())?;
        sink.write_all(&0u16.to_le_bytes())?;
        sink.write_all(&self.external_attr.to_le_bytes())?;
        sink.write_all(&offset_32.to_le_bytes())?;
        sink.write_all(name_bytes)?;
        sink.write_all(&zip64_extra)?;
        Ok(())
    }

    /// Byte length of the serialized record
    pub fn written_size(&self) -> u64 {
        (46 + self.name.len() + self.build_zip64_extra().len()) as u64
    }
}
