//! Push-based sequential archive writer
//!
//! Entries are appended one at a time: the caller hands over a header and
//! a content source, and [`add_entry`] copies exactly the declared number
//! of bytes straight through to the sink. Nothing is buffered across
//! entries, so a failure leaves a diagnosable partial archive rather than
//! silently dropped data. [`finish`] writes the format trailer and is
//! required before the sink can be taken back.
//!
//! [`add_entry`]: SequentialWriter::add_entry
//! [`finish`]: SequentialWriter::finish

use std::fmt;
use std::io::{Read, Write};

use arcstream_core::crc::ContentDigest;
use arcstream_core::entry::EntryHeader;
use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::{read_exact_or_eof, CountingWriter};
use arcstream_core::traits::EntryEncoder;

use crate::registry::{ArchiveFormat, FormatRegistry};

const COPY_BUF_LEN: usize = 8192;

/// Forward-only archive writer accepting one entry at a time.
///
/// The writer owns its sink until [`close`](Self::close) or
/// [`into_inner`](Self::into_inner). Closing before
/// [`finish`](Self::finish) still releases the sink but reports
/// [`ArcStreamError::UnfinishedArchive`], since the archive on disk is
/// missing its trailer.
pub struct SequentialWriter<W: Write> {
    sink: Option<CountingWriter<W>>,
    encoder: Box<dyn EntryEncoder>,
    format: ArchiveFormat,
    started: bool,
    finished: bool,
    entries: u64,
}

impl<W: Write> SequentialWriter<W> {
    /// Open a writer producing `format` into `sink`
    pub fn new(sink: W, format: ArchiveFormat) -> Result<Self> {
        Self::with_registry(sink, FormatRegistry::builtin(), format)
    }

    /// Open a writer against a caller-supplied registry
    pub fn with_registry(sink: W, registry: &FormatRegistry, format: ArchiveFormat) -> Result<Self> {
        let descriptor = registry.descriptor(format)?;
        let encoder = (descriptor.encoder)()?;
        Ok(Self {
            sink: Some(CountingWriter::new(sink)),
            encoder,
            format: descriptor.format,
            started: false,
            finished: false,
            entries: 0,
        })
    }

    /// Format this writer is producing
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Number of entries written so far
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Append one entry, copying exactly `header.content_len()` bytes
    /// from `content`.
    ///
    /// The source must yield the declared byte count: ending early or
    /// holding more bytes is a [`ArcStreamError::SizeMismatch`], because
    /// the length already went out inside the entry header.
    pub fn add_entry<R: Read + ?Sized>(&mut self, header: &EntryHeader, content: &mut R) -> Result<()> {
        if self.sink.is_none() {
            return Err(ArcStreamError::ClosedWriter);
        }
        if self.finished {
            return Err(ArcStreamError::invalid_cursor(
                "add_entry",
                "archive trailer already written",
            ));
        }
        header.validate()?;
        self.ensure_started()?;

        let sink = match &mut self.sink {
            Some(sink) => sink,
            None => return Err(ArcStreamError::ClosedWriter),
        };
        let offset = sink.bytes_written();
        self.encoder.write_header(sink, header, offset)?;

        let declared = header.content_len();
        let mut digest = ContentDigest::new();
        let mut remaining = declared;
        let mut buf = [0u8; COPY_BUF_LEN];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = read_exact_or_eof(content, &mut buf[..want])?;
            sink.write_all(&buf[..n])?;
            digest.update(&buf[..n]);
            remaining -= n as u64;
            if n < want {
                return Err(ArcStreamError::size_mismatch(declared, declared - remaining));
            }
        }
        // one extra byte means the source disagrees with the header
        let mut probe = [0u8; 1];
        if read_exact_or_eof(content, &mut probe)? != 0 {
            return Err(ArcStreamError::size_mismatch(declared, declared + 1));
        }

        self.encoder.finish_entry(sink, header, &digest)?;
        self.entries += 1;
        Ok(())
    }

    /// Write the archive trailer and flush the sink.
    ///
    /// Required exactly once, even for an archive with no entries.
    pub fn finish(&mut self) -> Result<()> {
        if self.sink.is_none() {
            return Err(ArcStreamError::ClosedWriter);
        }
        if self.finished {
            return Err(ArcStreamError::invalid_cursor(
                "finish",
                "archive trailer already written",
            ));
        }
        self.ensure_started()?;
        let sink = match &mut self.sink {
            Some(sink) => sink,
            None => return Err(ArcStreamError::ClosedWriter),
        };
        let offset = sink.bytes_written();
        self.encoder.finish_archive(sink, offset)?;
        sink.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Release the sink.
    ///
    /// Idempotent. Closing a writer that was never finished releases the
    /// sink all the same but reports
    /// [`ArcStreamError::UnfinishedArchive`]; a second close is `Ok`.
    pub fn close(&mut self) -> Result<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        let finished = self.finished;
        self.sink = None;
        if finished {
            Ok(())
        } else {
            Err(ArcStreamError::UnfinishedArchive)
        }
    }

    /// Consume the writer and hand back the sink.
    ///
    /// Only legal after [`finish`](Self::finish); an unfinished writer
    /// still drops the sink, mirroring [`close`](Self::close).
    pub fn into_inner(mut self) -> Result<W> {
        match self.sink.take() {
            None => Err(ArcStreamError::ClosedWriter),
            Some(sink) => {
                if self.finished {
                    Ok(sink.into_inner())
                } else {
                    Err(ArcStreamError::UnfinishedArchive)
                }
            }
        }
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let sink = match &mut self.sink {
            Some(sink) => sink,
            None => return Err(ArcStreamError::ClosedWriter),
        };
        self.encoder.start_archive(sink)?;
        self.started = true;
        Ok(())
    }
}

// the encoder box is opaque; report the protocol state instead
impl<W: Write> fmt::Debug for SequentialWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialWriter")
            .field("format", &self.format)
            .field("started", &self.started)
            .field("finished", &self.finished)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

/// One entry queued for a batch write: target format, header and an
/// unread content source.
pub struct PendingEntry<'a> {
    format: ArchiveFormat,
    header: EntryHeader,
    content: Box<dyn Read + 'a>,
}

impl<'a> PendingEntry<'a> {
    /// Queue `content` behind `header` for an archive of `format`
    pub fn new(format: ArchiveFormat, header: EntryHeader, content: impl Read + 'a) -> Self {
        Self {
            format,
            header,
            content: Box::new(content),
        }
    }

    /// Format this entry is destined for
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Header this entry will be written under
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }
}

/// Write a whole archive in one call, inferring the format from the
/// first entry.
///
/// The batch is checked before anything touches the sink: an empty batch
/// cannot name a format and entries disagreeing on the format are a
/// [`ArcStreamError::MixedEntryTypes`], raised with zero bytes written.
pub fn write_archive<W: Write>(sink: W, entries: Vec<PendingEntry<'_>>) -> Result<W> {
    let format = match entries.first() {
        Some(entry) => entry.format,
        None => {
            return Err(ArcStreamError::invalid_entry(
                "cannot infer an archive format from an empty entry batch",
            ));
        }
    };
    for entry in &entries {
        if entry.format != format {
            return Err(ArcStreamError::mixed_types(
                format.name(),
                entry.format.name(),
            ));
        }
    }

    let mut writer = SequentialWriter::new(sink, format)?;
    for mut entry in entries {
        writer.add_entry(&entry.header, &mut entry.content)?;
    }
    writer.finish()?;
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::SequentialReader;
    use arcstream_core::entry::EntryKind;
    use std::io::Cursor;

    #[test]
    fn test_writes_readable_cpio() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Cpio).unwrap();
        writer
            .add_entry(&EntryHeader::file("hello.txt", 5), &mut &b"hello"[..])
            .unwrap();
        writer
            .add_entry(&EntryHeader::symlink("ln", "hello.txt"), &mut &b""[..])
            .unwrap();
        assert_eq!(writer.entry_count(), 2);
        writer.finish().unwrap();
        let data = writer.into_inner().unwrap();

        let mut reader = SequentialReader::new(Cursor::new(data)).unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Cpio);
        let first = reader.advance().unwrap().unwrap();
        assert_eq!(first.name, "hello.txt");
        assert_eq!(reader.read_content_to_vec().unwrap(), b"hello");
        let second = reader.advance().unwrap().unwrap();
        assert_eq!(second.kind, EntryKind::Symlink);
        assert_eq!(second.link_target.as_deref(), Some("hello.txt"));
        assert!(reader.advance().unwrap().is_none());
    }

    #[test]
    fn test_content_shorter_than_declared() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Tar).unwrap();
        let err = writer
            .add_entry(&EntryHeader::file("short.bin", 10), &mut &b"1234"[..])
            .unwrap_err();
        assert!(matches!(
            err,
            ArcStreamError::SizeMismatch {
                declared: 10,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_content_longer_than_declared() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Tar).unwrap();
        let err = writer
            .add_entry(&EntryHeader::file("long.bin", 4), &mut &b"12345"[..])
            .unwrap_err();
        assert!(matches!(
            err,
            ArcStreamError::SizeMismatch {
                declared: 4,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_add_after_finish() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Ar).unwrap();
        writer.finish().unwrap();
        let err = writer
            .add_entry(&EntryHeader::file("late", 0), &mut &b""[..])
            .unwrap_err();
        assert!(matches!(err, ArcStreamError::InvalidCursorState { .. }));
    }

    #[test]
    fn test_finish_twice() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Ar).unwrap();
        writer.finish().unwrap();
        let err = writer.finish().unwrap_err();
        assert!(matches!(err, ArcStreamError::InvalidCursorState { .. }));
    }

    #[test]
    fn test_close_unfinished_then_again() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Tar).unwrap();
        writer
            .add_entry(&EntryHeader::file("a", 2), &mut &b"ab"[..])
            .unwrap();
        let err = writer.close().unwrap_err();
        assert!(matches!(err, ArcStreamError::UnfinishedArchive));
        // the sink is already gone, so a repeat close has nothing to report
        writer.close().unwrap();
        assert!(matches!(
            writer.finish().unwrap_err(),
            ArcStreamError::ClosedWriter
        ));
    }

    #[test]
    fn test_into_inner_before_finish() {
        let writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Tar).unwrap();
        assert!(matches!(
            writer.into_inner().unwrap_err(),
            ArcStreamError::UnfinishedArchive
        ));
    }

    #[test]
    fn test_into_inner_after_close() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Ar).unwrap();
        writer.finish().unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.into_inner().unwrap_err(),
            ArcStreamError::ClosedWriter
        ));
    }

    #[test]
    fn test_empty_archives_have_valid_trailers() {
        for (format, expected_len) in [
            (ArchiveFormat::Ar, 8),
            (ArchiveFormat::Tar, 1024),
            (ArchiveFormat::Zip, 22),
            (ArchiveFormat::Cpio, 512),
        ] {
            let mut writer = SequentialWriter::new(Vec::new(), format).unwrap();
            writer.finish().unwrap();
            let data = writer.into_inner().unwrap();
            assert_eq!(data.len(), expected_len, "{format} trailer length");

            let mut reader =
                SequentialReader::with_format(Cursor::new(data), format).unwrap();
            assert!(reader.advance().unwrap().is_none(), "{format} reads empty");
        }
    }

    #[test]
    fn test_seven_z_writer_unavailable() {
        let err = SequentialWriter::new(Vec::new(), ArchiveFormat::SevenZ).unwrap_err();
        assert!(matches!(err, ArcStreamError::SequentialUnsupported { .. }));
    }

    #[test]
    fn test_invalid_header_writes_nothing() {
        let mut buf = Vec::new();
        {
            let mut writer = SequentialWriter::new(&mut buf, ArchiveFormat::Tar).unwrap();
            let err = writer
                .add_entry(&EntryHeader::file("", 0), &mut &b""[..])
                .unwrap_err();
            assert!(matches!(err, ArcStreamError::InvalidEntry { .. }));
            let _ = writer.close();
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_nonfile_with_content_writes_nothing() {
        // a directory header cannot carry a content stream; letting one
        // through would desync the header size from the bytes on disk
        let mut buf = Vec::new();
        {
            let mut writer = SequentialWriter::new(&mut buf, ArchiveFormat::Tar).unwrap();
            let mut header = EntryHeader::directory("d");
            header.size = Some(3);
            let err = writer.add_entry(&header, &mut &b"abc"[..]).unwrap_err();
            assert!(matches!(err, ArcStreamError::InvalidEntry { .. }));
            let _ = writer.close();
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_debug_reports_protocol_state() {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Zip).unwrap();
        let repr = format!("{writer:?}");
        assert!(repr.contains("Zip"));
        assert!(repr.contains("finished: false"));
        writer.finish().unwrap();
        assert!(format!("{writer:?}").contains("finished: true"));
    }

    #[test]
    fn test_write_archive_batch() {
        let entries = vec![
            PendingEntry::new(
                ArchiveFormat::Ar,
                EntryHeader::file("one.o", 4),
                Cursor::new(b"\x7fELF".to_vec()),
            ),
            PendingEntry::new(
                ArchiveFormat::Ar,
                EntryHeader::file("two.o", 3),
                Cursor::new(b"obj".to_vec()),
            ),
        ];
        let data = write_archive(Vec::new(), entries).unwrap();
        assert!(data.starts_with(b"!<arch>\n"));

        let mut reader = SequentialReader::new(Cursor::new(data)).unwrap();
        assert_eq!(reader.advance().unwrap().unwrap().name, "one.o");
        assert_eq!(reader.advance().unwrap().unwrap().name, "two.o");
        assert!(reader.advance().unwrap().is_none());
    }

    #[test]
    fn test_write_archive_rejects_mixed_formats() {
        let mut buf = Vec::new();
        let entries = vec![
            PendingEntry::new(
                ArchiveFormat::Tar,
                EntryHeader::file("a", 1),
                Cursor::new(b"a".to_vec()),
            ),
            PendingEntry::new(
                ArchiveFormat::Zip,
                EntryHeader::file("b", 1),
                Cursor::new(b"b".to_vec()),
            ),
        ];
        let err = write_archive(&mut buf, entries).unwrap_err();
        assert!(matches!(
            err,
            ArcStreamError::MixedEntryTypes { ref expected, ref found }
                if expected == "tar" && found == "zip"
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_archive_empty_batch() {
        let err = write_archive(Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, ArcStreamError::InvalidEntry { .. }));
    }
}
