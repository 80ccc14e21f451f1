//! ZIP archives, read and written as a forward-only stream
//!
//! - reads local file headers in file order and stops at the first central
//!   directory or end-of-central-directory record; the central directory
//!   itself is never consumed
//! - entries compressed with a foreign method surface with an `Encoded`
//!   extent so they can be skipped without decompression
//! - entries written with flag bit 3 and zeroed sizes have no length a
//!   sequential pass can recover and surface a `Delimited` extent
//! - writes stored (method 0) entries; content CRCs travel in a trailing
//!   data descriptor so nothing is buffered, and real sizes go in the local
//!   header so the output reads back sequentially
//! - ZIP64 sizes and offsets are handled on both sides
//! - symlinks are written with the target as content and the type in the
//!   central directory mode; a forward-only reader sees them as files
//!   because the mode lives only in the central directory

pub mod header;

use std::io::{Read, Write};
use std::time::SystemTime;

use arcstream_core::crc::{ContentDigest, Crc32};
use arcstream_core::entry::{EntryHeader, EntryKind, ExtraFields};
use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::read_exact_or_eof;
use arcstream_core::traits::{ContentExtent, EntryDecoder, EntryEncoder};

use crate::registry::{ArchiveFormat, FormatDescriptor};

use header::{
    CentralDirEntry, DataDescriptor, LocalFileHeader, CENTRAL_DIR_HEADER_SIG, DATA_DESCRIPTOR_SIG,
    END_OF_CENTRAL_DIR_SIG, FLAG_DATA_DESCRIPTOR, FLAG_UTF8, JAR_MARKER_EXTRA_ID,
    LOCAL_FILE_HEADER_SIG, ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG, ZIP64_END_OF_CENTRAL_DIR_SIG,
    ZIP64_EXTRA_FIELD_ID, ZIP64_MARKER_16, ZIP64_MARKER_32,
};

/// Check a stream prefix for a ZIP record signature.
///
/// Accepts a local header (the normal case), a bare end-of-central-directory
/// record (an empty archive) or a spanned-archive data descriptor mark.
pub fn probe(prefix: &[u8]) -> bool {
    if prefix.len() < 4 {
        return false;
    }
    let sig = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    sig == LOCAL_FILE_HEADER_SIG || sig == END_OF_CENTRAL_DIR_SIG || sig == DATA_DESCRIPTOR_SIG
}

fn new_decoder() -> Result<Box<dyn EntryDecoder>> {
    Ok(Box::new(ZipDecoder::new()))
}

fn new_encoder() -> Result<Box<dyn EntryEncoder>> {
    Ok(Box::new(ZipEncoder::new()))
}

/// Registry descriptor for ZIP
pub fn descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: ArchiveFormat::Zip,
        matches: probe,
        decoder: new_decoder,
        encoder: new_encoder,
    }
}

struct PendingRead {
    extent: ContentExtent,
    method: u16,
    descriptor: bool,
    zip64: bool,
    header_crc: u32,
}

/// Pull-side ZIP codec over local file headers
pub struct ZipDecoder {
    pending: Option<PendingRead>,
}

impl ZipDecoder {
    /// Create a decoder positioned before the first local header
    pub fn new() -> Self {
        Self { pending: None }
    }
}

impl Default for ZipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryDecoder for ZipDecoder {
    fn next_header(&mut self, src: &mut dyn Read, offset: u64) -> Result<Option<EntryHeader>> {
        let mut sig_buf = [0u8; 4];
        let n = read_exact_or_eof(src, &mut sig_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4 {
            return Err(ArcStreamError::truncated((4 - n) as u64));
        }

        let sig = u32::from_le_bytes(sig_buf);
        match sig {
            LOCAL_FILE_HEADER_SIG => {}
            CENTRAL_DIR_HEADER_SIG
            | END_OF_CENTRAL_DIR_SIG
            | ZIP64_END_OF_CENTRAL_DIR_SIG
            | ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG => return Ok(None),
            _ => {
                return Err(ArcStreamError::malformed(
                    offset,
                    format!("unrecognized zip record signature {sig:#010x}"),
                ));
            }
        }

        let local = LocalFileHeader::read_body(src, offset)?;
        let kind = if local.name.ends_with('/') {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        // bit 3 with all-zero crc and sizes means the true values only
        // exist in the trailing descriptor; a directory still has no content
        let unknown_len = local.has_data_descriptor()
            && local.crc32 == 0
            && local.compressed_size == 0
            && local.uncompressed_size == 0
            && kind != EntryKind::Directory;

        let (extent, size) = if unknown_len {
            (ContentExtent::Delimited, None)
        } else if local.method == 0 {
            if local.compressed_size != local.uncompressed_size {
                return Err(ArcStreamError::malformed(
                    offset,
                    format!(
                        "stored entry size fields disagree: {} vs {}",
                        local.compressed_size, local.uncompressed_size
                    ),
                ));
            }
            (
                ContentExtent::Known {
                    len: local.compressed_size,
                },
                Some(local.uncompressed_size),
            )
        } else {
            (
                ContentExtent::Encoded {
                    len: local.compressed_size,
                    method: header::method_name(local.method),
                },
                Some(local.uncompressed_size),
            )
        };

        self.pending = Some(PendingRead {
            extent,
            method: local.method,
            descriptor: local.has_data_descriptor(),
            zip64: local.zip64,
            header_crc: local.crc32,
        });
        Ok(Some(EntryHeader {
            name: local.name,
            kind,
            size,
            mode: None,
            uid: None,
            gid: None,
            modified: Some(header::dos_to_system_time(local.mtime, local.mdate)),
            link_target: None,
            extras: ExtraFields::new(),
        }))
    }

    fn content_extent(&self, _header: &EntryHeader) -> Result<ContentExtent> {
        match &self.pending {
            Some(pending) => Ok(pending.extent.clone()),
            None => Err(ArcStreamError::invalid_cursor(
                "content_extent",
                "no open zip entry",
            )),
        }
    }

    fn finish_entry(
        &mut self,
        src: &mut dyn Read,
        _header: &EntryHeader,
        digest: &ContentDigest,
        offset: u64,
    ) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            let expected_crc = if pending.descriptor {
                let descriptor = DataDescriptor::read(src, pending.zip64)?;
                if descriptor.compressed_size != digest.len() {
                    return Err(ArcStreamError::malformed(
                        offset,
                        format!(
                            "zip descriptor size mismatch: descriptor {}, streamed {}",
                            descriptor.compressed_size,
                            digest.len()
                        ),
                    ));
                }
                descriptor.crc32
            } else {
                pending.header_crc
            };
            // crc covers the uncompressed bytes, which the engine only saw
            // for stored entries
            if pending.method == 0 && expected_crc != digest.crc32() {
                return Err(ArcStreamError::malformed(
                    offset,
                    format!(
                        "zip crc mismatch: recorded {expected_crc:#010x}, content {:#010x}",
                        digest.crc32()
                    ),
                ));
            }
        }
        Ok(())
    }
}

struct PendingWrite {
    offset: u64,
    name: String,
    flags: u16,
    mtime: u16,
    mdate: u16,
    external_attr: u32,
    version_needed: u16,
    descriptor: bool,
    zip64: bool,
    fixed: Option<(u32, u64)>,
}

/// Push-side ZIP codec writing stored entries with data descriptors
pub struct ZipEncoder {
    entries: Vec<CentralDirEntry>,
    pending: Option<PendingWrite>,
    jar_marker: bool,
    stamped: bool,
}

impl ZipEncoder {
    /// Create an encoder
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            pending: None,
            jar_marker: false,
            stamped: false,
        }
    }

    /// Create an encoder that stamps the `jar` tool marker on the first
    /// local header
    pub fn jar() -> Self {
        Self {
            jar_marker: true,
            ..Self::new()
        }
    }
}

impl Default for ZipEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryEncoder for ZipEncoder {
    fn start_archive(&mut self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn write_header(
        &mut self,
        sink: &mut dyn Write,
        header: &EntryHeader,
        offset: u64,
    ) -> Result<()> {
        if header.kind == EntryKind::Hardlink {
            return Err(ArcStreamError::invalid_entry(
                "zip cannot represent hard links",
            ));
        }

        let mut name = header.name.clone();
        let mut link_bytes: Option<Vec<u8>> = None;
        match header.kind {
            EntryKind::Directory => {
                if !name.ends_with('/') {
                    name.push('/');
                }
                if header.content_len() != 0 {
                    return Err(ArcStreamError::invalid_entry(
                        "directory entry declares content",
                    ));
                }
            }
            EntryKind::Symlink => {
                let target = header
                    .link_target
                    .as_deref()
                    .ok_or_else(|| ArcStreamError::invalid_entry("link entry missing target"))?;
                link_bytes = Some(target.as_bytes().to_vec());
            }
            _ => {}
        }

        let size = match &link_bytes {
            Some(bytes) => bytes.len() as u64,
            None => header.content_len(),
        };
        let fixed = link_bytes
            .as_ref()
            .map(|bytes| (Crc32::compute(bytes), bytes.len() as u64));

        let (mtime, mdate) = match header.modified {
            Some(when) => header::system_time_to_dos(when),
            None => header::system_time_to_dos(SystemTime::UNIX_EPOCH),
        };

        // the crc of streamed content is only known after the fact, so file
        // entries defer it to a data descriptor; sizes are declared up front
        // and written for real so the output reads back without the central
        // directory
        let descriptor = fixed.is_none() && size > 0;
        let zip64 = size >= u64::from(ZIP64_MARKER_32);
        let version_needed: u16 = if zip64 {
            45
        } else if descriptor {
            20
        } else {
            10
        };
        let mut flags = FLAG_UTF8;
        if descriptor {
            flags |= FLAG_DATA_DESCRIPTOR;
        }

        let mode = header.mode.unwrap_or(match header.kind {
            EntryKind::Directory => 0o755,
            EntryKind::Symlink => 0o777,
            _ => 0o644,
        }) & 0o7777;
        let external_attr = match header.kind {
            EntryKind::Directory => ((0o040_000 | mode) << 16) | 0x10,
            EntryKind::Symlink => (0o120_000 | mode) << 16,
            _ => (0o100_000 | mode) << 16,
        };

        let crc = fixed.map_or(0, |(crc, _)| crc);
        let mut extra = Vec::new();
        if self.jar_marker && !self.stamped {
            extra.extend_from_slice(&JAR_MARKER_EXTRA_ID.to_le_bytes());
            extra.extend_from_slice(&0u16.to_le_bytes());
        }
        if zip64 {
            extra.extend_from_slice(&ZIP64_EXTRA_FIELD_ID.to_le_bytes());
            extra.extend_from_slice(&16u16.to_le_bytes());
            extra.extend_from_slice(&size.to_le_bytes());
            extra.extend_from_slice(&size.to_le_bytes());
        }
        let size_32 = if zip64 { ZIP64_MARKER_32 } else { size as u32 };

        let name_bytes = name.as_bytes();
        sink.write_all(&LOCAL_FILE_HEADER_SIG.to_le_bytes())?;
        sink.write_all(&version_needed.to_le_bytes())?;
        sink.write_all(&flags.to_le_bytes())?;
        sink.write_all(&0u16.to_le_bytes())?;
        sink.write_all(&mtime.to_le_bytes())?;
        sink.write_all(&mdate.to_le_bytes())?;
        sink.write_all(&crc.to_le_bytes())?;
        sink.write_all(&size_32.to_le_bytes())?;
        sink.write_all(&size_32.to_le_bytes())?;
        sink.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
        sink.write_all(&(extra.len() as u16).to_le_bytes())?;
        sink.write_all(name_bytes)?;
        sink.write_all(&extra)?;

        if let Some(bytes) = &link_bytes {
            sink.write_all(bytes)?;
        }
        self.stamped = true;

        self.pending = Some(PendingWrite {
            offset,
            name,
            flags,
            mtime,
            mdate,
            external_attr,
            version_needed,
            descriptor,
            zip64,
            fixed,
        });
        Ok(())
    }

    fn finish_entry(
        &mut self,
        sink: &mut dyn Write,
        _header: &EntryHeader,
        digest: &ContentDigest,
    ) -> Result<()> {
        let pending = self.pending.take().ok_or_else(|| {
            ArcStreamError::invalid_cursor("finish_zip_entry", "no open zip entry")
        })?;

        let (crc, size) = pending
            .fixed
            .unwrap_or((digest.crc32(), digest.len()));
        if pending.descriptor {
            let descriptor = DataDescriptor {
                crc32: crc,
                compressed_size: size,
                uncompressed_size: size,
            };
            descriptor.write(sink, pending.zip64)?;
        }

        self.entries.push(CentralDirEntry {
            version_needed: pending.version_needed,
            flags: pending.flags,
            method: 0,
            mtime: pending.mtime,
            mdate: pending.mdate,
            crc32: crc,
            compressed_size: size,
            uncompressed_size: size,
            name: pending.name,
            external_attr: pending.external_attr,
            local_header_offset: pending.offset,
        });
        Ok(())
    }

    fn finish_archive(&mut self, sink: &mut dyn Write, offset: u64) -> Result<()> {
        let central_dir_offset = offset;
        let mut central_dir_size = 0u64;
        for entry in &self.entries {
            central_dir_size += entry.written_size();
            entry.write(sink)?;
        }

        let num_entries = self.entries.len() as u64;
        let needs_zip64 = num_entries > u64::from(ZIP64_MARKER_16)
            || central_dir_size >= u64::from(ZIP64_MARKER_32)
            || central_dir_offset >= u64::from(ZIP64_MARKER_32)
            || self.entries.iter().any(CentralDirEntry::needs_zip64);

        if needs_zip64 {
            let zip64_eocd_offset = central_dir_offset + central_dir_size;
            sink.write_all(&ZIP64_END_OF_CENTRAL_DIR_SIG.to_le_bytes())?;
            // record size counts the bytes after this field
            sink.write_all(&44u64.to_le_bytes())?;
            sink.write_all(&0x031Eu16.to_le_bytes())?;
            sink.write_all(&45u16.to_le_bytes())?;
            sink.write_all(&0u32.to_le_bytes())?;
            sink.write_all(&0u32.to_le_bytes())?;
            sink.write_all(&num_entries.to_le_bytes())?;
            sink.write_all(&num_entries.to_le_bytes())?;
            sink.write_all(&central_dir_size.to_le_bytes())?;
            sink.write_all(&central_dir_offset.to_le_bytes())?;

            sink.write_all(&ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG.to_le_bytes())?;
            sink.write_all(&0u32.to_le_bytes())?;
            sink.write_all(&zip64_eocd_offset.to_le_bytes())?;
            sink.write_all(&1u32.to_le_bytes())?;
        }

        let num_entries_16 = if num_entries > u64::from(ZIP64_MARKER_16) {
            ZIP64_MARKER_16
        } else {
            num_entries as u16
        };
        let central_dir_size_32 = if central_dir_size >= u64::from(ZIP64_MARKER_32) {
            ZIP64_MARKER_32
        } else {
            central_dir_size as u32
        };
        let central_dir_offset_32 = if central_dir_offset >= u64::from(ZIP64_MARKER_32) {
            ZIP64_MARKER_32
        } else {
            central_dir_offset as u32
        };

        sink.write_all(&END_OF_CENTRAL_DIR_SIG.to_le_bytes())?;
        sink.write_all(&0u16.to_le_bytes())?;
        sink.write_all(&0u16.to_le_bytes())?;
        sink.write_all(&num_entries_16.to_le_bytes())?;
        sink.write_all(&num_entries_16.to_le_bytes())?;
        sink.write_all(&central_dir_size_32.to_le_bytes())?;
        sink.write_all(&central_dir_offset_32.to_le_bytes())?;
        sink.write_all(&0u16.to_le_bytes())?;
        sink.flush()?;
        Ok(())
    }
}
