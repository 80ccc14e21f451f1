//! Pull-based sequential archive reader
//!
//! One forward pass over a byte source: each [`advance`] parses exactly one
//! entry header and leaves the cursor at the start of its content, which
//! can be streamed out once or simply skipped by the next [`advance`]. The
//! engine drains skipped content itself, keeping a running digest so the
//! format codec can verify trailing checksums either way.
//!
//! [`advance`]: SequentialReader::advance

use std::fmt;
use std::io::{Read, Write};

use arcstream_core::crc::ContentDigest;
use arcstream_core::entry::EntryHeader;
use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::PeekReader;
use arcstream_core::traits::{ContentExtent, EntryDecoder};

use crate::registry::{ArchiveFormat, FormatRegistry};

const COPY_BUF_LEN: usize = 8192;

struct CurrentEntry {
    header: EntryHeader,
    remaining: u64,
    taken: bool,
    method: Option<String>,
    digest: ContentDigest,
}

/// Forward-only archive reader producing one entry at a time.
///
/// The reader owns its source exclusively and releases it exactly once,
/// through [`close`](Self::close) or drop. End of archive is terminal:
/// once [`advance`](Self::advance) returns `None` it keeps returning
/// `None` until the reader is closed.
pub struct SequentialReader<R: Read> {
    source: Option<PeekReader<R>>,
    decoder: Box<dyn EntryDecoder>,
    format: ArchiveFormat,
    current: Option<CurrentEntry>,
    exhausted: bool,
}

impl<R: Read> SequentialReader<R> {
    /// Open a reader over `source`, detecting the format from its leading
    /// bytes via the builtin registry
    pub fn new(source: R) -> Result<Self> {
        Self::with_registry(source, FormatRegistry::builtin(), None)
    }

    /// Open a reader for a declared format, skipping detection
    pub fn with_format(source: R, format: ArchiveFormat) -> Result<Self> {
        Self::with_registry(source, FormatRegistry::builtin(), Some(format))
    }

    /// Open a reader against a caller-supplied registry
    pub fn with_registry(
        source: R,
        registry: &FormatRegistry,
        declared: Option<ArchiveFormat>,
    ) -> Result<Self> {
        let mut source = PeekReader::new(source);
        let descriptor = registry.detect(&mut source, declared)?;
        let decoder = (descriptor.decoder)()?;
        Ok(Self {
            source: Some(source),
            decoder,
            format: descriptor.format,
            current: None,
            exhausted: false,
        })
    }

    /// Format this reader is decoding
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Header of the entry the cursor is currently positioned at
    pub fn current_header(&self) -> Option<&EntryHeader> {
        self.current.as_ref().map(|current| &current.header)
    }

    /// Move to the next entry and return its header.
    ///
    /// Any unread remainder of the previous entry's content is drained
    /// first, so callers may ignore content entirely. Returns `Ok(None)` at
    /// the end of the archive, idempotently.
    ///
    /// # Errors
    /// [`ArcStreamError::ClosedReader`] after [`close`](Self::close),
    /// [`ArcStreamError::MalformedArchive`] on structural corruption or an
    /// entry whose length a forward pass cannot recover,
    /// [`ArcStreamError::TruncatedInput`] when the source ends mid-entry.
    pub fn advance(&mut self) -> Result<Option<EntryHeader>> {
        if self.source.is_none() {
            return Err(ArcStreamError::ClosedReader);
        }
        if self.exhausted {
            return Ok(None);
        }
        self.finish_current()?;

        let source = match &mut self.source {
            Some(source) => source,
            None => return Err(ArcStreamError::ClosedReader),
        };
        let offset = source.consumed();
        match self.decoder.next_header(source, offset)? {
            None => {
                self.exhausted = true;
                Ok(None)
            }
            Some(header) => {
                let (remaining, method) = match self.decoder.content_extent(&header)? {
                    ContentExtent::Known { len } => (len, None),
                    ContentExtent::Encoded { len, method } => (len, Some(method)),
                    ContentExtent::Delimited => {
                        return Err(ArcStreamError::malformed(
                            offset,
                            "entry length is not declared ahead of its content; \
                             a sequential pass cannot locate its end",
                        ));
                    }
                };
                self.current = Some(CurrentEntry {
                    header: header.clone(),
                    remaining,
                    taken: false,
                    method,
                    digest: ContentDigest::new(),
                });
                Ok(Some(header))
            }
        }
    }

    /// Stream the current entry's content into `sink`, returning the byte
    /// count.
    ///
    /// Valid at most once per entry, between one [`advance`](Self::advance)
    /// and the next.
    ///
    /// # Errors
    /// [`ArcStreamError::InvalidCursorState`] without a current entry or on
    /// a second call, [`ArcStreamError::UnsupportedCodec`] when the content
    /// is stored under a compression method this crate does not decode.
    pub fn read_content<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64> {
        if self.source.is_none() {
            return Err(ArcStreamError::ClosedReader);
        }
        match &self.current {
            None => {
                let state = if self.exhausted {
                    "after the last entry"
                } else {
                    "before the first entry"
                };
                return Err(ArcStreamError::invalid_cursor("read_content", state));
            }
            Some(current) => {
                if current.taken {
                    return Err(ArcStreamError::invalid_cursor(
                        "read_content",
                        "content already read for this entry",
                    ));
                }
                if let Some(method) = &current.method {
                    return Err(ArcStreamError::unsupported_codec(method.clone()));
                }
            }
        }
        if let Some(current) = self.current.as_mut() {
            current.taken = true;
        }

        let mut written = 0u64;
        let mut buf = [0u8; COPY_BUF_LEN];
        loop {
            let n = self.read_chunk(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            written += n as u64;
        }
        Ok(written)
    }

    /// Collect the current entry's content into a vector
    pub fn read_content_to_vec(&mut self) -> Result<Vec<u8>> {
        let capacity = self
            .current
            .as_ref()
            .map_or(0, |current| current.remaining.min(1 << 16) as usize);
        let mut out = Vec::with_capacity(capacity);
        self.read_content(&mut out)?;
        Ok(out)
    }

    /// Release the source. Idempotent; every later operation except
    /// another `close` fails with [`ArcStreamError::ClosedReader`].
    pub fn close(&mut self) -> Result<()> {
        self.source = None;
        self.current = None;
        Ok(())
    }

    /// Pull up to `buf.len()` content bytes of the current entry,
    /// updating the running digest
    pub(crate) fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (Some(source), Some(current)) = (&mut self.source, &mut self.current) else {
            return Ok(0);
        };
        if current.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(current.remaining.min(usize::MAX as u64) as usize);
        let n = loop {
            match source.read(&mut buf[..want]) {
                Ok(n) => break n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };
        if n == 0 {
            return Err(ArcStreamError::truncated(current.remaining));
        }
        current.digest.update(&buf[..n]);
        current.remaining -= n as u64;
        Ok(n)
    }

    /// Whether the current entry's content is gated behind a foreign
    /// compression method
    pub(crate) fn current_method(&self) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|current| current.method.as_deref())
    }

    /// Drain what is left of the current entry, then let the decoder
    /// consume its trailer and verify checksums
    fn finish_current(&mut self) -> Result<()> {
        let mut buf = [0u8; COPY_BUF_LEN];
        while self.read_chunk(&mut buf)? > 0 {}

        if let Some(current) = self.current.take() {
            let source = match &mut self.source {
                Some(source) => source,
                None => return Err(ArcStreamError::ClosedReader),
            };
            let offset = source.consumed();
            self.decoder
                .finish_entry(source, &current.header, &current.digest, offset)?;
        }
        Ok(())
    }
}

// the decoder box is opaque; report the cursor state instead
impl<R: Read> fmt::Debug for SequentialReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialReader")
            .field("format", &self.format)
            .field("closed", &self.source.is_none())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SequentialWriter;
    use arcstream_core::entry::EntryKind;
    use std::io::Cursor;

    fn sample_tar() -> Vec<u8> {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Tar).unwrap();
        writer
            .add_entry(&EntryHeader::file("a.txt", 5), &mut &b"hello"[..])
            .unwrap();
        writer
            .add_entry(&EntryHeader::directory("sub"), &mut &b""[..])
            .unwrap();
        writer
            .add_entry(&EntryHeader::file("sub/b.bin", 3), &mut &b"xyz"[..])
            .unwrap();
        writer.finish().unwrap();
        writer.into_inner().unwrap()
    }

    #[test]
    fn test_detects_and_reads() {
        let mut reader = SequentialReader::new(Cursor::new(sample_tar())).unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Tar);

        let header = reader.advance().unwrap().unwrap();
        assert_eq!(header.name, "a.txt");
        assert_eq!(reader.current_header().map(|h| h.name.as_str()), Some("a.txt"));
        let mut content = Vec::new();
        assert_eq!(reader.read_content(&mut content).unwrap(), 5);
        assert_eq!(content, b"hello");

        let header = reader.advance().unwrap().unwrap();
        assert_eq!(header.kind, EntryKind::Directory);
        let header = reader.advance().unwrap().unwrap();
        assert_eq!(header.name, "sub/b.bin");
        assert_eq!(reader.read_content_to_vec().unwrap(), b"xyz");
        assert!(reader.advance().unwrap().is_none());
    }

    #[test]
    fn test_advance_skips_unread_content() {
        let mut reader = SequentialReader::new(Cursor::new(sample_tar())).unwrap();
        assert_eq!(reader.advance().unwrap().unwrap().name, "a.txt");
        assert_eq!(reader.advance().unwrap().unwrap().name, "sub/");
        assert_eq!(reader.advance().unwrap().unwrap().name, "sub/b.bin");
        assert!(reader.advance().unwrap().is_none());
        // end of archive is idempotent
        assert!(reader.advance().unwrap().is_none());
        assert!(reader.current_header().is_none());
    }

    #[test]
    fn test_double_read_content() {
        let mut reader = SequentialReader::new(Cursor::new(sample_tar())).unwrap();
        reader.advance().unwrap().unwrap();
        reader.read_content(&mut Vec::new()).unwrap();
        let err = reader.read_content(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, ArcStreamError::InvalidCursorState { .. }));
    }

    #[test]
    fn test_read_content_before_first_entry() {
        let mut reader = SequentialReader::new(Cursor::new(sample_tar())).unwrap();
        let err = reader.read_content(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, ArcStreamError::InvalidCursorState { .. }));
    }

    #[test]
    fn test_closed_reader() {
        let mut reader = SequentialReader::new(Cursor::new(sample_tar())).unwrap();
        reader.close().unwrap();
        assert!(matches!(
            reader.advance().unwrap_err(),
            ArcStreamError::ClosedReader
        ));
        assert!(matches!(
            reader.read_content(&mut Vec::new()).unwrap_err(),
            ArcStreamError::ClosedReader
        ));
        // close stays idempotent
        reader.close().unwrap();
    }

    #[test]
    fn test_declared_format_reads_zero_filled_tar() {
        // an all-zero tar has no magic to probe, but a declared format
        // still reads it as an empty archive
        let data = vec![0u8; 1024];
        let mut reader =
            SequentialReader::with_format(Cursor::new(data), ArchiveFormat::Tar).unwrap();
        assert!(reader.advance().unwrap().is_none());
    }

    #[test]
    fn test_debug_reports_cursor_state() {
        let mut reader = SequentialReader::new(Cursor::new(sample_tar())).unwrap();
        let repr = format!("{reader:?}");
        assert!(repr.contains("Tar"));
        assert!(repr.contains("closed: false"));
        reader.close().unwrap();
        assert!(format!("{reader:?}").contains("closed: true"));
    }

    #[test]
    fn test_truncated_content() {
        let data = sample_tar();
        let mut reader = SequentialReader::new(Cursor::new(data[..514].to_vec())).unwrap();
        reader.advance().unwrap().unwrap();
        let err = reader.read_content(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, ArcStreamError::TruncatedInput { .. }));
    }

    #[test]
    fn test_delimited_entry_is_malformed() {
        // zip local header with flag bit 3 and zeroed sizes: the length
        // only exists in the trailing descriptor
        let mut data = Vec::new();
        data.extend_from_slice(b"PK\x03\x04");
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&0x0008u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(b"s");

        let mut reader = SequentialReader::new(Cursor::new(data)).unwrap();
        let err = reader.advance().unwrap_err();
        assert!(matches!(err, ArcStreamError::MalformedArchive { .. }));
    }

    #[test]
    fn test_encoded_entry_skippable_but_not_readable() {
        // method 8 zip entry: header parses, content can be skipped, but
        // read_content refuses
        let mut data = Vec::new();
        data.extend_from_slice(b"PK\x03\x04");
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&8u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // times
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&9u32.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(b"c.bin");
        data.extend_from_slice(&[0xAA; 4]);
        data.extend_from_slice(b"PK\x05\x06");
        data.extend_from_slice(&[0u8; 18]);

        let mut reader = SequentialReader::new(Cursor::new(data)).unwrap();
        let header = reader.advance().unwrap().unwrap();
        assert_eq!(header.size, Some(9));
        let err = reader.read_content(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            ArcStreamError::UnsupportedCodec { ref method } if method == "deflate"
        ));
        // the raw bytes still skip cleanly
        assert!(reader.advance().unwrap().is_none());
    }
}
