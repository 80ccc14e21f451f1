//! POSIX ustar tape archives
//!
//! - 512-byte header and data blocks; numeric fields in NUL-terminated
//!   octal, with GNU base-256 accepted for oversized values on read
//! - PAX extended headers (`x` local, `g` global) override block fields;
//!   unrecognized records are preserved as `pax.*` attributes
//! - GNU long name (`L`) and long link (`K`) members are resolved on read
//! - writes POSIX ustar with prefix splitting, falling back to a PAX
//!   header when a name, link target or numeric field does not fit
//! - the entry stream ends at a zero block or two trailing zero blocks;
//!   a clean EOF at a block boundary is tolerated on read

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use arcstream_core::crc::ContentDigest;
use arcstream_core::entry::{EntryHeader, EntryKind, ExtraFields};
use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::{read_exact_or_eof, skip_bytes};
use arcstream_core::traits::{ContentExtent, EntryDecoder, EntryEncoder};

use crate::registry::{ArchiveFormat, FormatDescriptor};

/// Size of a tar block
pub const BLOCK_SIZE: usize = 512;

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
// widest value an 11-digit octal field can carry
const MAX_OCTAL_12: u64 = 0o77777777777;
const MAX_OCTAL_8: u64 = 0o7777777;
// extended headers larger than this are treated as hostile input
const MAX_META_LEN: u64 = 1 << 20;

/// Check a stream prefix for the ustar magic at block offset 257
pub fn probe(prefix: &[u8]) -> bool {
    prefix.len() >= 262 && &prefix[257..262] == b"ustar"
}

fn new_decoder() -> Result<Box<dyn EntryDecoder>> {
    Ok(Box::new(TarDecoder::new()))
}

fn new_encoder() -> Result<Box<dyn EntryEncoder>> {
    Ok(Box::new(TarEncoder::new()))
}

/// Registry descriptor for tar
pub fn descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: ArchiveFormat::Tar,
        matches: probe,
        decoder: new_decoder,
        encoder: new_encoder,
    }
}

fn parse_string(block: &[u8], start: usize, len: usize) -> String {
    let field = &block[start..start + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

fn parse_octal(block: &[u8], start: usize, len: usize) -> u64 {
    let s = parse_string(block, start, len);
    u64::from_str_radix(&s, 8).unwrap_or(0)
}

fn parse_numeric(block: &[u8], start: usize, len: usize) -> u64 {
    let field = &block[start..start + len];
    if field[0] & 0x80 != 0 {
        // GNU base-256: big-endian, high bit of the first byte is the flag
        let mut value = (field[0] & 0x7F) as u128;
        for &b in &field[1..] {
            value = (value << 8) | b as u128;
        }
        u64::try_from(value).unwrap_or(u64::MAX)
    } else {
        parse_octal(block, start, len)
    }
}

fn write_string(block: &mut [u8], start: usize, len: usize, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(len);
    block[start..start + n].copy_from_slice(&bytes[..n]);
}

fn write_octal(block: &mut [u8], start: usize, len: usize, value: u64) {
    let text = format!("{value:0width$o}", width = len - 1);
    write_string(block, start, len, &text);
}

fn block_pad(len: u64) -> u64 {
    (BLOCK_SIZE as u64 - (len % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64
}

/// Raw fields of one ustar header block
#[derive(Debug, Clone, Default)]
struct TarBlock {
    name: String,
    mode: u32,
    uid: u64,
    gid: u64,
    size: u64,
    mtime: u64,
    typeflag: u8,
    linkname: String,
    uname: String,
    gname: String,
    prefix: String,
}

impl TarBlock {
    fn parse(block: &[u8; BLOCK_SIZE], offset: u64) -> Result<Self> {
        let declared = parse_octal(block, 148, 8);
        let mut computed: u64 = 0;
        for (i, &b) in block.iter().enumerate() {
            computed += if (148..156).contains(&i) {
                u64::from(b' ')
            } else {
                u64::from(b)
            };
        }
        if declared != computed {
            return Err(ArcStreamError::malformed(
                offset,
                format!("header checksum mismatch: header {declared}, computed {computed}"),
            ));
        }
        Ok(Self {
            name: parse_string(block, 0, 100),
            mode: parse_octal(block, 100, 8) as u32,
            uid: parse_numeric(block, 108, 8),
            gid: parse_numeric(block, 116, 8),
            size: parse_numeric(block, 124, 12),
            mtime: parse_numeric(block, 136, 12),
            typeflag: block[156],
            linkname: parse_string(block, 157, 100),
            uname: parse_string(block, 265, 32),
            gname: parse_string(block, 297, 32),
            prefix: parse_string(block, 345, 155),
        })
    }

    fn full_name(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.prefix, self.name)
        }
    }

    fn to_block(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        write_string(&mut block, 0, 100, &self.name);
        write_octal(&mut block, 100, 8, u64::from(self.mode));
        write_octal(&mut block, 108, 8, self.uid);
        write_octal(&mut block, 116, 8, self.gid);
        write_octal(&mut block, 124, 12, self.size);
        write_octal(&mut block, 136, 12, self.mtime);
        block[156] = self.typeflag;
        write_string(&mut block, 157, 100, &self.linkname);
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        write_string(&mut block, 265, 32, &self.uname);
        write_string(&mut block, 297, 32, &self.gname);
        write_octal(&mut block, 329, 8, 0);
        write_octal(&mut block, 337, 8, 0);
        write_string(&mut block, 345, 155, &self.prefix);

        block[148..156].fill(b' ');
        let sum: u64 = block.iter().map(|&b| u64::from(b)).sum();
        let checksum = format!("{sum:06o}\0 ");
        block[148..156].copy_from_slice(checksum.as_bytes());
        block
    }
}

fn parse_pax_data(data: &[u8]) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut pos = 0;
    while pos < data.len() {
        // each record reads "len key=value\n", len covering the whole record
        let space = match data[pos..].iter().position(|&b| b == b' ') {
            Some(s) => pos + s,
            None => break,
        };
        let len: usize = match std::str::from_utf8(&data[pos..space])
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(l) => l,
            None => break,
        };
        if len == 0 || pos + len > data.len() {
            break;
        }
        let record = &data[space + 1..pos + len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(eq) = record.iter().position(|&b| b == b'=') {
            let key = String::from_utf8_lossy(&record[..eq]).into_owned();
            let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
            attrs.insert(key, value);
        }
        pos += len;
    }
    attrs
}

fn format_pax_record(key: &str, value: &str) -> String {
    // the length prefix counts itself, so grow until it settles
    let base = key.len() + value.len() + 3;
    let mut total = base;
    loop {
        let with_len = base + total.to_string().len();
        if with_len == total {
            break;
        }
        total = with_len;
    }
    format!("{total} {key}={value}\n")
}

fn read_member_data(src: &mut dyn Read, size: u64, offset: u64) -> Result<Vec<u8>> {
    if size > MAX_META_LEN {
        return Err(ArcStreamError::malformed(
            offset,
            format!("oversized extended header member: {size} bytes"),
        ));
    }
    let mut data = vec![0u8; size as usize];
    let n = read_exact_or_eof(src, &mut data)?;
    if (n as u64) < size {
        return Err(ArcStreamError::truncated(size - n as u64));
    }
    let pad = block_pad(size);
    let skipped = skip_bytes(src, pad)?;
    if skipped < pad {
        return Err(ArcStreamError::truncated(pad - skipped));
    }
    Ok(data)
}

fn read_gnu_string(src: &mut dyn Read, size: u64, offset: u64) -> Result<String> {
    let mut data = read_member_data(src, size, offset)?;
    while data.last() == Some(&0) {
        data.pop();
    }
    Ok(String::from_utf8_lossy(&data).into_owned())
}

struct EntryFields {
    name: String,
    size: u64,
    uid: u64,
    gid: u64,
    mtime_float: Option<f64>,
    link: Option<String>,
    uname: String,
    gname: String,
    extras: ExtraFields,
}

fn apply_pax(fields: &mut EntryFields, attrs: &HashMap<String, String>) {
    for (key, value) in attrs {
        match key.as_str() {
            "path" => fields.name = value.clone(),
            "linkpath" => fields.link = Some(value.clone()),
            "size" => {
                if let Ok(v) = value.parse() {
                    fields.size = v;
                }
            }
            "uid" => {
                if let Ok(v) = value.parse() {
                    fields.uid = v;
                }
            }
            "gid" => {
                if let Ok(v) = value.parse() {
                    fields.gid = v;
                }
            }
            "mtime" => {
                if let Ok(v) = value.parse::<f64>() {
                    fields.mtime_float = Some(v);
                }
            }
            "uname" => fields.uname = value.clone(),
            "gname" => fields.gname = value.clone(),
            _ => fields
                .extras
                .insert(format!("pax.{key}"), value.as_bytes().to_vec()),
        }
    }
}

/// Pull-side tar codec with PAX and GNU long-name support
pub struct TarDecoder {
    global_pax: HashMap<String, String>,
    content_pad: u64,
}

impl TarDecoder {
    /// Create a decoder positioned before the first header block
    pub fn new() -> Self {
        Self {
            global_pax: HashMap::new(),
            content_pad: 0,
        }
    }
}

impl Default for TarDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryDecoder for TarDecoder {
    fn next_header(&mut self, src: &mut dyn Read, offset: u64) -> Result<Option<EntryHeader>> {
        let mut pending_pax: Option<HashMap<String, String>> = None;
        let mut long_name: Option<String> = None;
        let mut long_link: Option<String> = None;

        loop {
            let mut block = [0u8; BLOCK_SIZE];
            let n = read_exact_or_eof(src, &mut block)?;
            if n == 0 {
                // archives cut before the trailer are accepted at a block boundary
                return Ok(None);
            }
            if n < BLOCK_SIZE {
                return Err(ArcStreamError::truncated((BLOCK_SIZE - n) as u64));
            }
            if block.iter().all(|&b| b == 0) {
                return Ok(None);
            }

            let raw = TarBlock::parse(&block, offset)?;
            match raw.typeflag {
                b'x' => {
                    let data = read_member_data(src, raw.size, offset)?;
                    pending_pax
                        .get_or_insert_with(HashMap::new)
                        .extend(parse_pax_data(&data));
                    continue;
                }
                b'g' => {
                    let data = read_member_data(src, raw.size, offset)?;
                    self.global_pax.extend(parse_pax_data(&data));
                    continue;
                }
                b'L' => {
                    long_name = Some(read_gnu_string(src, raw.size, offset)?);
                    continue;
                }
                b'K' => {
                    long_link = Some(read_gnu_string(src, raw.size, offset)?);
                    continue;
                }
                _ => {}
            }

            let mut fields = EntryFields {
                name: long_name.take().unwrap_or_else(|| raw.full_name()),
                size: raw.size,
                uid: raw.uid,
                gid: raw.gid,
                mtime_float: None,
                link: long_link
                    .take()
                    .or_else(|| (!raw.linkname.is_empty()).then(|| raw.linkname.clone())),
                uname: raw.uname.clone(),
                gname: raw.gname.clone(),
                extras: ExtraFields::new(),
            };
            apply_pax(&mut fields, &self.global_pax);
            if let Some(pax) = &pending_pax {
                apply_pax(&mut fields, pax);
            }

            let mut kind = match raw.typeflag {
                b'5' => EntryKind::Directory,
                b'2' => EntryKind::Symlink,
                b'1' => EntryKind::Hardlink,
                b'0' | 0 | b'7' => EntryKind::File,
                _ => EntryKind::Unknown,
            };
            if kind == EntryKind::File && fields.name.ends_with('/') {
                kind = EntryKind::Directory;
            }
            // content belongs only to files; POSIX says to ignore the size
            // field for directories and links
            if matches!(
                kind,
                EntryKind::Directory | EntryKind::Symlink | EntryKind::Hardlink
            ) {
                fields.size = 0;
            }

            let modified = match fields.mtime_float {
                Some(v) if v.is_finite() && v >= 0.0 => {
                    Some(SystemTime::UNIX_EPOCH + Duration::from_secs_f64(v))
                }
                Some(_) => Some(SystemTime::UNIX_EPOCH),
                None => Some(SystemTime::UNIX_EPOCH + Duration::from_secs(raw.mtime)),
            };

            if !fields.uname.is_empty() {
                fields
                    .extras
                    .insert("tar.uname", fields.uname.as_bytes().to_vec());
            }
            if !fields.gname.is_empty() {
                fields
                    .extras
                    .insert("tar.gname", fields.gname.as_bytes().to_vec());
            }

            self.content_pad = block_pad(fields.size);
            return Ok(Some(EntryHeader {
                name: fields.name,
                kind,
                size: Some(fields.size),
                mode: Some(raw.mode & 0o7777),
                uid: u32::try_from(fields.uid).ok(),
                gid: u32::try_from(fields.gid).ok(),
                modified,
                link_target: fields.link,
                extras: fields.extras,
            }));
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
        let pad = self.content_pad;
        self.content_pad = 0;
        let skipped = skip_bytes(src, pad)?;
        if skipped < pad {
            return Err(ArcStreamError::truncated(pad - skipped));
        }
        Ok(())
    }
}

fn split_name(name: &str) -> Option<(String, String)> {
    if name.len() <= NAME_LEN {
        return Some((name.to_string(), String::new()));
    }
    let mut upper = PREFIX_LEN.min(name.len());
    while upper > 0 && !name.is_char_boundary(upper) {
        upper -= 1;
    }
    let split = name[..upper].rfind('/')?;
    let prefix = &name[..split];
    let rest = &name[split + 1..];
    if !rest.is_empty() && rest.len() <= NAME_LEN {
        Some((rest.to_string(), prefix.to_string()))
    } else {
        None
    }
}

fn tail_bytes(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }
    let mut start = value.len() - limit;
    while start < value.len() && !value.is_char_boundary(start) {
        start += 1;
    }
    value[start..].to_string()
}

fn write_pax_member(sink: &mut dyn Write, records: &[(&str, String)]) -> Result<()> {
    let mut data = String::new();
    for (key, value) in records {
        data.push_str(&format_pax_record(key, value));
    }
    let bytes = data.as_bytes();
    let block = TarBlock {
        name: "PaxHeader".to_string(),
        mode: 0o644,
        size: bytes.len() as u64,
        typeflag: b'x',
        ..TarBlock::default()
    }
    .to_block();
    sink.write_all(&block)?;
    sink.write_all(bytes)?;
    let pad = block_pad(bytes.len() as u64);
    if pad > 0 {
        sink.write_all(&vec![0u8; pad as usize])?;
    }
    Ok(())
}

/// Push-side tar codec writing POSIX ustar with PAX fallback
pub struct TarEncoder;

impl TarEncoder {
    /// Create an encoder
    pub fn new() -> Self {
        Self
    }
}

impl Default for TarEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryEncoder for TarEncoder {
    fn start_archive(&mut self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn write_header(
        &mut self,
        sink: &mut dyn Write,
        header: &EntryHeader,
        _offset: u64,
    ) -> Result<()> {
        let (typeflag, default_mode) = match header.kind {
            EntryKind::Directory => (b'5', 0o755),
            EntryKind::Symlink => (b'2', 0o777),
            EntryKind::Hardlink => (b'1', 0o644),
            _ => (b'0', 0o644),
        };
        if matches!(header.kind, EntryKind::Symlink | EntryKind::Hardlink)
            && header.link_target.is_none()
        {
            return Err(ArcStreamError::invalid_entry("link entry missing target"));
        }
        let size = match header.kind {
            EntryKind::Directory | EntryKind::Symlink | EntryKind::Hardlink => 0,
            _ => header.content_len(),
        };
        let link = header.link_target.clone().unwrap_or_default();
        let uid = u64::from(header.uid.unwrap_or(0));
        let gid = u64::from(header.gid.unwrap_or(0));
        let mtime = header
            .modified
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut pax: Vec<(&str, String)> = Vec::new();
        let (block_name, prefix) = match split_name(&header.name) {
            Some(pair) => pair,
            None => {
                pax.push(("path", header.name.clone()));
                (tail_bytes(&header.name, NAME_LEN), String::new())
            }
        };
        let block_link = if link.len() > NAME_LEN {
            pax.push(("linkpath", link.clone()));
            tail_bytes(&link, NAME_LEN)
        } else {
            link
        };
        let block_size = if size > MAX_OCTAL_12 {
            pax.push(("size", size.to_string()));
            0
        } else {
            size
        };
        let block_mtime = if mtime > MAX_OCTAL_12 {
            pax.push(("mtime", mtime.to_string()));
            0
        } else {
            mtime
        };
        let block_uid = if uid > MAX_OCTAL_8 {
            pax.push(("uid", uid.to_string()));
            0
        } else {
            uid
        };
        let block_gid = if gid > MAX_OCTAL_8 {
            pax.push(("gid", gid.to_string()));
            0
        } else {
            gid
        };

        if !pax.is_empty() {
            write_pax_member(sink, &pax)?;
        }

        let uname = header
            .extras
            .get("tar.uname")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let gname = header
            .extras
            .get("tar.gname")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();

        let block = TarBlock {
            name: block_name,
            mode: header.mode.unwrap_or(default_mode) & 0o7777,
            uid: block_uid,
            gid: block_gid,
            size: block_size,
            mtime: block_mtime,
            typeflag,
            linkname: block_link,
            uname,
            gname,
            prefix,
        }
        .to_block();
        sink.write_all(&block)?;
        Ok(())
    }

    fn finish_entry(
        &mut self,
        sink: &mut dyn Write,
        _header: &EntryHeader,
        digest: &ContentDigest,
    ) -> Result<()> {
        let pad = block_pad(digest.len());
        if pad > 0 {
            sink.write_all(&vec![0u8; pad as usize])?;
        }
        Ok(())
    }

    fn finish_archive(&mut self, sink: &mut dyn Write, _offset: u64) -> Result<()> {
        for _ in 0..2 {
            sink.write_all(&[0u8; BLOCK_SIZE])?;
        }
        Ok(())
    }
}
