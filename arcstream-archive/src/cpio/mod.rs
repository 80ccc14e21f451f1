//! cpio archives
//!
//! - reads the newc (`070701`), crc (`070702`) and odc (`070707`) variants
//! - writes newc: 110-byte ASCII headers with thirteen 8-digit hex fields,
//!   header+name and content each padded to four bytes
//! - the `TRAILER!!!` member ends the entry stream and never surfaces
//! - crc-variant check values are verified against the streamed byte sum
//! - symlink targets travel as member content; both sides translate so
//!   entries surface with `link_target` set and zero content bytes
//! - the write side pads the finished archive to a 512-byte block

use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use arcstream_core::crc::ContentDigest;
use arcstream_core::entry::{EntryHeader, EntryKind, ExtraFields};
use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::{read_exact_or_eof, skip_bytes};
use arcstream_core::traits::{ContentExtent, EntryDecoder, EntryEncoder};

use crate::registry::{ArchiveFormat, FormatDescriptor};

/// Magic for the newc variant
pub const MAGIC_NEWC: &[u8; 6] = b"070701";
/// Magic for the crc variant
pub const MAGIC_CRC: &[u8; 6] = b"070702";
/// Magic for the portable odc variant
pub const MAGIC_ODC: &[u8; 6] = b"070707";

/// Name of the terminating member
pub const TRAILER_NAME: &str = "TRAILER!!!";

const NEWC_HEADER_LEN: u64 = 110;
const ODC_HEADER_LEN: usize = 76;
const BLOCK_SIZE: u64 = 512;

const TYPE_MASK: u32 = 0o170000;
const TYPE_FILE: u32 = 0o100000;
const TYPE_DIR: u32 = 0o040000;
const TYPE_SYMLINK: u32 = 0o120000;

/// Check a stream prefix for one of the cpio magics
pub fn probe(prefix: &[u8]) -> bool {
    prefix.len() >= 6
        && (&prefix[..6] == MAGIC_NEWC || &prefix[..6] == MAGIC_CRC || &prefix[..6] == MAGIC_ODC)
}

fn new_decoder() -> Result<Box<dyn EntryDecoder>> {
    Ok(Box::new(CpioDecoder::new()))
}

fn new_encoder() -> Result<Box<dyn EntryEncoder>> {
    Ok(Box::new(CpioEncoder::new()))
}

/// Registry descriptor for cpio
pub fn descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: ArchiveFormat::Cpio,
        matches: probe,
        decoder: new_decoder,
        encoder: new_encoder,
    }
}

fn pad4(len: u64) -> u64 {
    (4 - (len % 4)) % 4
}

fn parse_hex(field: &[u8], offset: u64) -> Result<u32> {
    let text = std::str::from_utf8(field)
        .map_err(|_| ArcStreamError::malformed(offset, "non-ASCII cpio header field"))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| ArcStreamError::malformed(offset, format!("invalid hex field: {text:?}")))
}

fn parse_oct(field: &[u8], offset: u64) -> Result<u64> {
    let text = std::str::from_utf8(field)
        .map_err(|_| ArcStreamError::malformed(offset, "non-ASCII cpio header field"))?;
    u64::from_str_radix(text.trim(), 8)
        .map_err(|_| ArcStreamError::malformed(offset, format!("invalid octal field: {text:?}")))
}

fn kind_from_mode(mode: u32) -> EntryKind {
    match mode & TYPE_MASK {
        TYPE_DIR => EntryKind::Directory,
        TYPE_SYMLINK => EntryKind::Symlink,
        TYPE_FILE => EntryKind::File,
        _ => EntryKind::Unknown,
    }
}

fn skip_padding(src: &mut dyn Read, count: u64) -> Result<()> {
    let skipped = skip_bytes(src, count)?;
    if skipped < count {
        return Err(ArcStreamError::truncated(count - skipped));
    }
    Ok(())
}

const MAX_LINK_LEN: u64 = 4096;
// namesize drives an allocation; names larger than this are hostile input
const MAX_NAME_LEN: u64 = 1 << 16;

fn read_link_target(src: &mut dyn Read, len: u64, offset: u64) -> Result<(String, u32)> {
    if len > MAX_LINK_LEN {
        return Err(ArcStreamError::malformed(
            offset,
            format!("oversized symlink target: {len} bytes"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    let n = read_exact_or_eof(src, &mut buf)?;
    if (n as u64) < len {
        return Err(ArcStreamError::truncated(len - n as u64));
    }
    let sum = buf
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok((String::from_utf8_lossy(&buf).into_owned(), sum))
}

struct PendingRead {
    content_pad: u64,
    check: Option<u32>,
}

/// Pull-side cpio codec for the newc, crc and odc variants
pub struct CpioDecoder {
    pending: Option<PendingRead>,
}

impl CpioDecoder {
    /// Create a decoder positioned before the first member
    pub fn new() -> Self {
        Self { pending: None }
    }

    fn read_newc(
        &mut self,
        src: &mut dyn Read,
        offset: u64,
        with_check: bool,
    ) -> Result<Option<EntryHeader>> {
        let mut raw = [0u8; 104];
        let n = read_exact_or_eof(src, &mut raw)?;
        if n < raw.len() {
            return Err(ArcStreamError::truncated((raw.len() - n) as u64));
        }
        let mut fields = [0u32; 13];
        for (slot, chunk) in fields.iter_mut().zip(raw.chunks(8)) {
            *slot = parse_hex(chunk, offset)?;
        }
        let [
            _ino,
            mode,
            uid,
            gid,
            _nlink,
            mtime,
            filesize,
            _devmajor,
            _devminor,
            _rdevmajor,
            _rdevminor,
            namesize,
            check,
        ] = fields;

        if namesize == 0 {
            return Err(ArcStreamError::malformed(offset, "cpio name size is zero"));
        }
        if u64::from(namesize) > MAX_NAME_LEN {
            return Err(ArcStreamError::malformed(
                offset,
                format!("oversized member name: {namesize} bytes"),
            ));
        }
        let mut name_buf = vec![0u8; namesize as usize];
        let n = read_exact_or_eof(src, &mut name_buf)?;
        if n < name_buf.len() {
            return Err(ArcStreamError::truncated((name_buf.len() - n) as u64));
        }
        skip_padding(src, pad4(NEWC_HEADER_LEN + namesize as u64))?;

        while name_buf.last() == Some(&0) {
            name_buf.pop();
        }
        let name = String::from_utf8_lossy(&name_buf).into_owned();
        if name == TRAILER_NAME {
            return Ok(None);
        }

        let kind = kind_from_mode(mode);
        let mut link_target = None;
        let mut size = filesize as u64;
        if kind == EntryKind::Symlink && filesize > 0 {
            // member content is the link target, consumed here so the entry
            // surfaces as a zero-length symlink
            let (target, sum) = read_link_target(src, filesize as u64, offset)?;
            if with_check && check != 0 && check != sum {
                return Err(ArcStreamError::malformed(
                    offset,
                    format!("cpio checksum mismatch: header {check:#010x}, content {sum:#010x}"),
                ));
            }
            skip_padding(src, pad4(filesize as u64))?;
            link_target = Some(target);
            size = 0;
        }
        self.pending = Some(PendingRead {
            content_pad: if link_target.is_some() {
                0
            } else {
                pad4(filesize as u64)
            },
            check: (with_check && link_target.is_none()).then_some(check),
        });
        Ok(Some(EntryHeader {
            name,
            kind,
            size: Some(size),
            mode: Some(mode & 0o7777),
            uid: Some(uid),
            gid: Some(gid),
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime as u64)),
            link_target,
            extras: ExtraFields::new(),
        }))
    }

    fn read_odc(&mut self, src: &mut dyn Read, offset: u64) -> Result<Option<EntryHeader>> {
        let mut raw = [0u8; ODC_HEADER_LEN - 6];
        let n = read_exact_or_eof(src, &mut raw)?;
        if n < raw.len() {
            return Err(ArcStreamError::truncated((raw.len() - n) as u64));
        }
        let mode = parse_oct(&raw[12..18], offset)? as u32;
        let uid = parse_oct(&raw[18..24], offset)? as u32;
        let gid = parse_oct(&raw[24..30], offset)? as u32;
        let mtime = parse_oct(&raw[42..53], offset)?;
        let namesize = parse_oct(&raw[53..59], offset)?;
        let filesize = parse_oct(&raw[59..70], offset)?;

        if namesize == 0 {
            return Err(ArcStreamError::malformed(offset, "cpio name size is zero"));
        }
        if namesize > MAX_NAME_LEN {
            return Err(ArcStreamError::malformed(
                offset,
                format!("oversized member name: {namesize} bytes"),
            ));
        }
        let mut name_buf = vec![0u8; namesize as usize];
        let n = read_exact_or_eof(src, &mut name_buf)?;
        if n < name_buf.len() {
            return Err(ArcStreamError::truncated((name_buf.len() - n) as u64));
        }
        while name_buf.last() == Some(&0) {
            name_buf.pop();
        }
        let name = String::from_utf8_lossy(&name_buf).into_owned();
        if name == TRAILER_NAME {
            return Ok(None);
        }

        let kind = kind_from_mode(mode);
        let mut link_target = None;
        let mut size = filesize;
        if kind == EntryKind::Symlink && filesize > 0 {
            let (target, _) = read_link_target(src, filesize, offset)?;
            link_target = Some(target);
            size = 0;
        }
        // odc has no alignment padding
        self.pending = Some(PendingRead {
            content_pad: 0,
            check: None,
        });
        Ok(Some(EntryHeader {
            name,
            kind,
            size: Some(size),
            mode: Some(mode & 0o7777),
            uid: Some(uid),
            gid: Some(gid),
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime)),
            link_target,
            extras: ExtraFields::new(),
        }))
    }
}

impl Default for CpioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryDecoder for CpioDecoder {
    fn next_header(&mut self, src: &mut dyn Read, offset: u64) -> Result<Option<EntryHeader>> {
        let mut magic = [0u8; 6];
        let n = read_exact_or_eof(src, &mut magic)?;
        if n < magic.len() {
            // a cpio stream must end with the trailer member
            return Err(ArcStreamError::truncated((magic.len() - n) as u64));
        }
        match &magic {
            m if m == MAGIC_NEWC => self.read_newc(src, offset, false),
            m if m == MAGIC_CRC => self.read_newc(src, offset, true),
            m if m == MAGIC_ODC => self.read_odc(src, offset),
            _ => Err(ArcStreamError::malformed(offset, "bad cpio member magic")),
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
        digest: &ContentDigest,
        offset: u64,
    ) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            skip_padding(src, pending.content_pad)?;
            if let Some(expected) = pending.check {
                if expected != digest.byte_sum() {
                    return Err(ArcStreamError::malformed(
                        offset,
                        format!(
                            "cpio checksum mismatch: header {expected:#010x}, content {:#010x}",
                            digest.byte_sum()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

struct PendingWrite {
    filesize: u64,
    target: Option<String>,
}

struct RawMember<'a> {
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    filesize: u32,
    name: &'a str,
}

fn write_member_header(sink: &mut dyn Write, member: &RawMember<'_>) -> Result<()> {
    let mut out = Vec::with_capacity(NEWC_HEADER_LEN as usize + member.name.len() + 4);
    out.extend_from_slice(MAGIC_NEWC);
    let namesize = member.name.len() as u32 + 1;
    for value in [
        member.ino,
        member.mode,
        member.uid,
        member.gid,
        member.nlink,
        member.mtime,
        member.filesize,
        0,
        0,
        0,
        0,
        namesize,
        0,
    ] {
        out.extend_from_slice(format!("{value:08x}").as_bytes());
    }
    out.extend_from_slice(member.name.as_bytes());
    out.push(0);
    for _ in 0..pad4(NEWC_HEADER_LEN + namesize as u64) {
        out.push(0);
    }
    sink.write_all(&out)?;
    Ok(())
}

/// Push-side cpio codec. Always writes the newc variant.
pub struct CpioEncoder {
    next_ino: u32,
    pending: Option<PendingWrite>,
}

impl CpioEncoder {
    /// Create an encoder
    pub fn new() -> Self {
        Self {
            next_ino: 1,
            pending: None,
        }
    }
}

impl Default for CpioEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryEncoder for CpioEncoder {
    fn start_archive(&mut self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn write_header(
        &mut self,
        sink: &mut dyn Write,
        header: &EntryHeader,
        _offset: u64,
    ) -> Result<()> {
        let (type_bits, default_mode, nlink) = match header.kind {
            EntryKind::Directory => (TYPE_DIR, 0o755, 2),
            EntryKind::Symlink => (TYPE_SYMLINK, 0o777, 1),
            _ => (TYPE_FILE, 0o644, 1),
        };
        let target = match header.kind {
            EntryKind::Symlink => Some(
                header
                    .link_target
                    .clone()
                    .ok_or_else(|| ArcStreamError::invalid_entry("symlink entry missing target"))?,
            ),
            _ => None,
        };
        let filesize = match &target {
            Some(t) => t.len() as u64,
            None => header.content_len(),
        };
        if filesize > u64::from(u32::MAX) {
            return Err(ArcStreamError::invalid_entry(
                "cpio newc cannot store entries over 4 GiB",
            ));
        }
        let mtime = header
            .modified
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if mtime > u64::from(u32::MAX) {
            return Err(ArcStreamError::invalid_entry(
                "cpio newc cannot store timestamps past 2106",
            ));
        }

        let ino = self.next_ino;
        self.next_ino = self.next_ino.wrapping_add(1);
        write_member_header(
            sink,
            &RawMember {
                ino,
                mode: type_bits | (header.mode.unwrap_or(default_mode) & 0o7777),
                uid: header.uid.unwrap_or(0),
                gid: header.gid.unwrap_or(0),
                nlink,
                mtime: mtime as u32,
                filesize: filesize as u32,
                name: &header.name,
            },
        )?;
        self.pending = Some(PendingWrite { filesize, target });
        Ok(())
    }

    fn finish_entry(
        &mut self,
        sink: &mut dyn Write,
        _header: &EntryHeader,
        _digest: &ContentDigest,
    ) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            // symlink targets travel as member content, written here because
            // the engine streams zero user bytes for them
            if let Some(target) = &pending.target {
                sink.write_all(target.as_bytes())?;
            }
            let pad = pad4(pending.filesize);
            if pad > 0 {
                sink.write_all(&[0u8; 3][..pad as usize])?;
            }
        }
        Ok(())
    }

    fn finish_archive(&mut self, sink: &mut dyn Write, offset: u64) -> Result<()> {
        let mut trailer_len = 0u64;
        write_member_header(
            sink,
            &RawMember {
                ino: 0,
                mode: 0,
                uid: 0,
                gid: 0,
                nlink: 1,
                mtime: 0,
                filesize: 0,
                name: TRAILER_NAME,
            },
        )?;
        trailer_len += NEWC_HEADER_LEN + TRAILER_NAME.len() as u64 + 1;
        trailer_len += pad4(trailer_len);

        let total = offset + trailer_len;
        let block_pad = (BLOCK_SIZE - (total % BLOCK_SIZE)) % BLOCK_SIZE;
        if block_pad > 0 {
            sink.write_all(&vec![0u8; block_pad as usize])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn newc_member(magic: &[u8; 6], name: &str, content: &[u8], check: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(magic);
        let namesize = name.len() as u32 + 1;
        for value in [
            1u32,
            0o100644,
            0,
            0,
            1,
            0,
            content.len() as u32,
            0,
            0,
            0,
            0,
            namesize,
            check,
        ] {
            out.extend_from_slice(format!("{value:08x}").as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(content);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn decode_all(data: &[u8]) -> Result<Vec<(EntryHeader, Vec<u8>)>> {
        let mut decoder = CpioDecoder::new();
        let mut src = Cursor::new(data.to_vec());
        let mut out = Vec::new();
        while let Some(header) = decoder.next_header(&mut src, 0)? {
            let len = header.content_len() as usize;
            let mut content = vec![0u8; len];
            assert_eq!(read_exact_or_eof(&mut src, &mut content)?, len);
            let mut digest = ContentDigest::new();
            digest.update(&content);
            let offset = src.position();
            decoder.finish_entry(&mut src, &header, &digest, offset)?;
            out.push((header, content));
        }
        Ok(out)
    }

    #[test]
    fn test_decode_newc() {
        let mut data = newc_member(MAGIC_NEWC, "a/b.txt", b"hello", 0);
        data.extend_from_slice(&newc_member(MAGIC_NEWC, TRAILER_NAME, b"", 0));

        let entries = decode_all(&data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.name, "a/b.txt");
        assert_eq!(entries[0].0.kind, EntryKind::File);
        assert_eq!(entries[0].0.mode, Some(0o644));
        assert_eq!(entries[0].1, b"hello");
    }

    #[test]
    fn test_decode_crc_variant_verifies_sum() {
        let sum = b"abc".iter().map(|&b| u32::from(b)).sum::<u32>();
        let mut good = newc_member(MAGIC_CRC, "f", b"abc", sum);
        good.extend_from_slice(&newc_member(MAGIC_NEWC, TRAILER_NAME, b"", 0));
        assert_eq!(decode_all(&good).unwrap()[0].1, b"abc");

        let mut bad = newc_member(MAGIC_CRC, "f", b"abc", sum + 1);
        bad.extend_from_slice(&newc_member(MAGIC_NEWC, TRAILER_NAME, b"", 0));
        let err = decode_all(&bad).unwrap_err();
        assert!(matches!(err, ArcStreamError::MalformedArchive { .. }));
    }

    #[test]
    fn test_decode_odc() {
        let name = "old.txt";
        let content = b"portable";
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC_ODC);
        data.extend_from_slice(
            format!(
                "{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
                0,
                1,
                0o100600,
                10,
                20,
                1,
                0,
                99,
                name.len() + 1,
                content.len()
            )
            .as_bytes(),
        );
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(content);
        // odc trailer
        data.extend_from_slice(MAGIC_ODC);
        data.extend_from_slice(
            format!(
                "{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
                0,
                0,
                0,
                0,
                0,
                1,
                0,
                0,
                TRAILER_NAME.len() + 1,
                0
            )
            .as_bytes(),
        );
        data.extend_from_slice(TRAILER_NAME.as_bytes());
        data.push(0);

        let entries = decode_all(&data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.name, "old.txt");
        assert_eq!(entries[0].0.mode, Some(0o600));
        assert_eq!(entries[0].0.uid, Some(10));
        assert_eq!(entries[0].0.gid, Some(20));
        assert_eq!(entries[0].1, b"portable");
    }

    #[test]
    fn test_missing_trailer_is_truncation() {
        let data = newc_member(MAGIC_NEWC, "only", b"data", 0);
        let err = decode_all(&data).unwrap_err();
        assert!(matches!(err, ArcStreamError::TruncatedInput { .. }));
    }

    #[test]
    fn test_decode_oversized_namesize_rejected() {
        // a forged namesize must fail before driving an allocation
        let mut newc = Vec::new();
        newc.extend_from_slice(MAGIC_NEWC);
        for value in [1u32, 0o100644, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0xFFFF_FFFF, 0] {
            newc.extend_from_slice(format!("{value:08x}").as_bytes());
        }
        let err = decode_all(&newc).unwrap_err();
        assert!(matches!(err, ArcStreamError::MalformedArchive { .. }));

        let mut odc = Vec::new();
        odc.extend_from_slice(MAGIC_ODC);
        odc.extend_from_slice(
            format!(
                "{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
                0, 1, 0o100644, 0, 0, 1, 0, 0, 0o777777, 0
            )
            .as_bytes(),
        );
        let err = decode_all(&odc).unwrap_err();
        assert!(matches!(err, ArcStreamError::MalformedArchive { .. }));
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut encoder = CpioEncoder::new();
        let mut out = Vec::new();
        encoder.start_archive(&mut out).unwrap();

        let header = EntryHeader::file("data.bin", 6).with_mode(0o600).with_owner(7, 8);
        encoder.write_header(&mut out, &header, 0).unwrap();
        out.extend_from_slice(b"abc123");
        let mut digest = ContentDigest::new();
        digest.update(b"abc123");
        encoder.finish_entry(&mut out, &header, &digest).unwrap();
        let end = out.len() as u64;
        encoder.finish_archive(&mut out, end).unwrap();

        assert_eq!(&out[..6], MAGIC_NEWC);
        assert_eq!(out.len() % 512, 0);

        let entries = decode_all(&out).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.name, "data.bin");
        assert_eq!(entries[0].0.mode, Some(0o600));
        assert_eq!(entries[0].0.uid, Some(7));
        assert_eq!(entries[0].1, b"abc123");
    }

    #[test]
    fn test_encode_symlink_target_as_content() {
        let mut encoder = CpioEncoder::new();
        let mut out = Vec::new();
        encoder.start_archive(&mut out).unwrap();

        let header = EntryHeader::symlink("link", "the/target");
        encoder.write_header(&mut out, &header, 0).unwrap();
        // engine streams zero bytes for a symlink
        let digest = ContentDigest::new();
        encoder.finish_entry(&mut out, &header, &digest).unwrap();
        let end = out.len() as u64;
        encoder.finish_archive(&mut out, end).unwrap();

        let entries = decode_all(&out).unwrap();
        assert_eq!(entries[0].0.kind, EntryKind::Symlink);
        assert_eq!(entries[0].0.link_target.as_deref(), Some("the/target"));
        assert_eq!(entries[0].0.size, Some(0));
        assert_eq!(entries[0].1, b"");
    }

    #[test]
    fn test_probe() {
        assert!(probe(b"070701rest"));
        assert!(probe(b"070702rest"));
        assert!(probe(b"070707rest"));
        assert!(!probe(b"070777rest"));
        assert!(!probe(b"0707"));
    }
}
