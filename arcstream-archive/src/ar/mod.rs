//! Unix ar archives
//!
//! - 8-byte global magic `!<arch>\n`, then 60-byte member headers
//! - header fields are fixed-width ASCII: decimal mtime/uid/gid/size,
//!   octal mode, terminated by `` ` `` and a newline
//! - member data is padded to two-byte alignment with a newline
//! - long names arrive either through the GNU `//` string table or as
//!   BSD `#1/len` inline names; both are resolved on read, while the
//!   write side sticks to plain 16-byte names

use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use arcstream_core::crc::ContentDigest;
use arcstream_core::entry::EntryHeader;
use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::read_exact_or_eof;
use arcstream_core::traits::{ContentExtent, EntryDecoder, EntryEncoder};

use crate::registry::{ArchiveFormat, FormatDescriptor};

/// Global archive magic
pub const GLOBAL_MAGIC: &[u8; 8] = b"!<arch>\n";
/// Fixed member header length
pub const HEADER_LEN: usize = 60;
/// Longest name a plain header field can carry
pub const MAX_NAME_LEN: usize = 16;

const TERMINATOR: &[u8; 2] = b"`\n";

// size fields drive allocations; name metadata past these is hostile input
const MAX_TABLE_LEN: u64 = 1 << 20;
const MAX_INLINE_NAME_LEN: u64 = 1 << 16;

/// Check a stream prefix for the ar global magic
pub fn probe(prefix: &[u8]) -> bool {
    prefix.len() >= GLOBAL_MAGIC.len() && &prefix[..GLOBAL_MAGIC.len()] == GLOBAL_MAGIC
}

fn new_decoder() -> Result<Box<dyn EntryDecoder>> {
    Ok(Box::new(ArDecoder::new()))
}

fn new_encoder() -> Result<Box<dyn EntryEncoder>> {
    Ok(Box::new(ArEncoder::new()))
}

/// Registry descriptor for ar
pub fn descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: ArchiveFormat::Ar,
        matches: probe,
        decoder: new_decoder,
        encoder: new_encoder,
    }
}

fn parse_dec(field: &[u8], offset: u64, what: &str) -> Result<u64> {
    let text = std::str::from_utf8(field.trim_ascii_end())
        .map_err(|_| ArcStreamError::malformed(offset, format!("non-ASCII {what} field")))?;
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<u64>()
        .map_err(|_| ArcStreamError::malformed(offset, format!("invalid {what} field: {text:?}")))
}

fn parse_oct(field: &[u8], offset: u64, what: &str) -> Result<u32> {
    let text = std::str::from_utf8(field.trim_ascii_end())
        .map_err(|_| ArcStreamError::malformed(offset, format!("non-ASCII {what} field")))?;
    if text.is_empty() {
        return Ok(0);
    }
    u32::from_str_radix(text, 8)
        .map_err(|_| ArcStreamError::malformed(offset, format!("invalid {what} field: {text:?}")))
}

/// Pull-side ar codec
pub struct ArDecoder {
    started: bool,
    name_table: Option<Vec<u8>>,
    // odd-sized member data is followed by one alignment byte
    pad_next: bool,
}

impl ArDecoder {
    /// Create a decoder positioned before the global magic
    pub fn new() -> Self {
        Self {
            started: false,
            name_table: None,
            pad_next: false,
        }
    }

    fn resolve_gnu_name(&self, index: usize, offset: u64) -> Result<String> {
        let table = self.name_table.as_ref().ok_or_else(|| {
            ArcStreamError::malformed(offset, "long name reference without a name table")
        })?;
        if index >= table.len() {
            return Err(ArcStreamError::malformed(
                offset,
                format!("long name offset {index} outside the name table"),
            ));
        }
        let rest = &table[index..];
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        let mut name = &rest[..end];
        if name.ends_with(b"/") {
            name = &name[..name.len() - 1];
        }
        Ok(String::from_utf8_lossy(name).into_owned())
    }

    fn skip_pad(&mut self, src: &mut dyn Read) -> Result<()> {
        if self.pad_next {
            let mut pad = [0u8; 1];
            // a missing pad at the very end of input is tolerated
            read_exact_or_eof(src, &mut pad)?;
            self.pad_next = false;
        }
        Ok(())
    }
}

impl Default for ArDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryDecoder for ArDecoder {
    fn next_header(&mut self, src: &mut dyn Read, offset: u64) -> Result<Option<EntryHeader>> {
        if !self.started {
            let mut magic = [0u8; 8];
            let n = read_exact_or_eof(src, &mut magic)?;
            if n < magic.len() {
                return Err(ArcStreamError::truncated((magic.len() - n) as u64));
            }
            if &magic != GLOBAL_MAGIC {
                return Err(ArcStreamError::malformed(offset, "bad ar global magic"));
            }
            self.started = true;
        }

        loop {
            let mut raw = [0u8; HEADER_LEN];
            let n = read_exact_or_eof(src, &mut raw)?;
            if n == 0 {
                return Ok(None);
            }
            if n < HEADER_LEN {
                return Err(ArcStreamError::truncated((HEADER_LEN - n) as u64));
            }
            if &raw[58..60] != TERMINATOR {
                return Err(ArcStreamError::malformed(
                    offset,
                    "ar member header missing terminator",
                ));
            }

            let name_field = raw[0..16].trim_ascii_end();
            let mtime = parse_dec(&raw[16..28], offset, "mtime")?;
            let uid = parse_dec(&raw[28..34], offset, "uid")? as u32;
            let gid = parse_dec(&raw[34..40], offset, "gid")? as u32;
            let mode = parse_oct(&raw[40..48], offset, "mode")?;
            let size = parse_dec(&raw[48..58], offset, "size")?;
            self.pad_next = size % 2 == 1;

            // GNU long-name table: stashed for later lookups, never surfaced
            if name_field == b"//" {
                if size > MAX_TABLE_LEN {
                    return Err(ArcStreamError::malformed(
                        offset,
                        format!("oversized long-name table: {size} bytes"),
                    ));
                }
                let mut table = vec![0u8; size as usize];
                let n = read_exact_or_eof(src, &mut table)?;
                if (n as u64) < size {
                    return Err(ArcStreamError::truncated(size - n as u64));
                }
                self.skip_pad(src)?;
                self.name_table = Some(table);
                continue;
            }

            let (name, content_len) = if let Some(rest) = name_field.strip_prefix(b"#1/") {
                // BSD style: name bytes sit between the header and the content,
                // and are counted in the size field
                let name_len = parse_dec(rest, offset, "inline name length")?;
                if name_len > MAX_INLINE_NAME_LEN {
                    return Err(ArcStreamError::malformed(
                        offset,
                        format!("oversized inline name: {name_len} bytes"),
                    ));
                }
                let name_len = name_len as usize;
                if (size as usize) < name_len {
                    return Err(ArcStreamError::malformed(
                        offset,
                        "inline name longer than the member itself",
                    ));
                }
                let mut name_buf = vec![0u8; name_len];
                let n = read_exact_or_eof(src, &mut name_buf)?;
                if n < name_len {
                    return Err(ArcStreamError::truncated((name_len - n) as u64));
                }
                while name_buf.last() == Some(&0) {
                    name_buf.pop();
                }
                (
                    String::from_utf8_lossy(&name_buf).into_owned(),
                    size - name_len as u64,
                )
            } else if let Some(rest) = name_field.strip_prefix(b"/") {
                if rest.is_empty() {
                    // symbol index member keeps its raw name
                    ("/".to_string(), size)
                } else {
                    let index = parse_dec(rest, offset, "name table offset")? as usize;
                    (self.resolve_gnu_name(index, offset)?, size)
                }
            } else {
                let mut name = name_field;
                if name.len() > 1 && name.ends_with(b"/") {
                    name = &name[..name.len() - 1];
                }
                (String::from_utf8_lossy(name).into_owned(), size)
            };

            let header = EntryHeader::file(name, content_len)
                .with_mode(mode & 0o7777)
                .with_owner(uid, gid)
                .with_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime));
            return Ok(Some(header));
        }
    }

    fn content_extent(&self, header: &EntryHeader) -> Result<ContentExtent> {
        Ok(ContentExtent::Known {
            len: header.content_len(),
        })
    }

    fn finish_entry(
        &mut self,
        src: &mut dyn Read,
        _header: &EntryHeader,
        _digest: &ContentDigest,
        _offset: u64,
    ) -> Result<()> {
        self.skip_pad(src)
    }
}

fn put_field(dst: &mut [u8], value: &str, what: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > dst.len() {
        return Err(ArcStreamError::invalid_entry(format!(
            "ar {what} field overflow: {value}"
        )));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Push-side ar codec. Writes plain short-name headers only.
pub struct ArEncoder;

impl ArEncoder {
    /// Create an encoder
    pub fn new() -> Self {
        Self
    }
}

impl Default for ArEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryEncoder for ArEncoder {
    fn start_archive(&mut self, sink: &mut dyn Write) -> Result<()> {
        sink.write_all(GLOBAL_MAGIC)?;
        Ok(())
    }

    fn write_header(
        &mut self,
        sink: &mut dyn Write,
        header: &EntryHeader,
        _offset: u64,
    ) -> Result<()> {
        if !header.is_file() {
            return Err(ArcStreamError::invalid_entry(
                "ar archives hold regular files only",
            ));
        }
        if header.name.len() > MAX_NAME_LEN {
            return Err(ArcStreamError::invalid_entry(format!(
                "ar member name longer than {MAX_NAME_LEN} bytes: {}",
                header.name
            )));
        }
        let mtime = header
            .modified
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut raw = [b' '; HEADER_LEN];
        put_field(&mut raw[0..16], &header.name, "name")?;
        put_field(&mut raw[16..28], &mtime.to_string(), "mtime")?;
        put_field(&mut raw[28..34], &header.uid.unwrap_or(0).to_string(), "uid")?;
        put_field(&mut raw[34..40], &header.gid.unwrap_or(0).to_string(), "gid")?;
        put_field(
            &mut raw[40..48],
            &format!("{:o}", header.mode.unwrap_or(0o644)),
            "mode",
        )?;
        put_field(&mut raw[48..58], &header.content_len().to_string(), "size")?;
        raw[58..60].copy_from_slice(TERMINATOR);
        sink.write_all(&raw)?;
        Ok(())
    }

    fn finish_entry(
        &mut self,
        sink: &mut dyn Write,
        _header: &EntryHeader,
        digest: &ContentDigest,
    ) -> Result<()> {
        if digest.len() % 2 == 1 {
            sink.write_all(b"\n")?;
        }
        Ok(())
    }

    fn finish_archive(&mut self, _sink: &mut dyn Write, _offset: u64) -> Result<()> {
        Ok(())
    }
}
