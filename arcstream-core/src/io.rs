//! Stream adapters for forward-only archive processing
//!
//! - [`PeekReader`]: look ahead on any `Read` without consuming bytes,
//!   used for format detection before decoding starts
//! - [`CountingWriter`]: track the number of bytes written, used for
//!   offset bookkeeping in trailer records
//! - [`read_exact_or_eof`]: fill a buffer while distinguishing a clean
//!   end of stream from a mid-record cut

use std::io::{self, Read, Write};

/// Reader adapter with a replay buffer for non-consuming look-ahead.
///
/// Bytes obtained through [`peek`](Self::peek) stay available to later
/// `read` calls in their original order. Also counts every byte handed
/// out, which gives decoders their current archive offset.
#[derive(Debug)]
pub struct PeekReader<R: Read> {
    inner: R,
    buffer: Vec<u8>,
    pos: usize,
    consumed: u64,
}

impl<R: Read> PeekReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
            consumed: 0,
        }
    }

    /// Look at up to `len` upcoming bytes without consuming them.
    ///
    /// Returns fewer bytes only when the source ends first.
    pub fn peek(&mut self, len: usize) -> io::Result<&[u8]> {
        while self.buffer.len() - self.pos < len {
            let need = len - (self.buffer.len() - self.pos);
            let mut chunk = vec![0u8; need];
            match self.inner.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let end = self.buffer.len().min(self.pos + len);
        Ok(&self.buffer[self.pos..end])
    }

    /// Total bytes consumed through `read` so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Access the wrapped reader
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap, discarding any buffered look-ahead bytes
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for PeekReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.buffer.len() {
            let n = (self.buffer.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.buffer.len() {
                self.buffer.clear();
                self.pos = 0;
            }
            self.consumed += n as u64;
            return Ok(n);
        }
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Writer adapter that counts the bytes passing through it.
#[derive(Debug)]
pub struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Access the wrapped writer
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutable access to the wrapped writer
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap the counted writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Fill `buf` from `src`, tolerating end of stream.
///
/// Returns the number of bytes read: `buf.len()` when the buffer was
/// filled, `0` when the source was already exhausted, and a partial
/// count when the source ended mid-buffer. Callers turn a partial count
/// into a truncation error when the record layout demands more bytes.
pub fn read_exact_or_eof<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Discard up to `count` bytes from `src` without materializing them.
///
/// Returns the number of bytes actually skipped, which falls short of
/// `count` only when the source ends first.
pub fn skip_bytes<R: Read + ?Sized>(src: &mut R, count: u64) -> io::Result<u64> {
    let mut buf = [0u8; 512];
    let mut remaining = count;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = read_exact_or_eof(src, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(count - remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_peek_does_not_consume() {
        let mut reader = PeekReader::new(Cursor::new(b"hello world".to_vec()));
        let peeked = reader.peek(5).unwrap();
        assert_eq!(peeked, b"hello");
        assert_eq!(reader.consumed(), 0);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(reader.consumed(), 11);
    }

    #[test]
    fn test_peek_short_input() {
        let mut reader = PeekReader::new(Cursor::new(b"abc".to_vec()));
        let peeked = reader.peek(512).unwrap();
        assert_eq!(peeked, b"abc");
        let again = reader.peek(2).unwrap();
        assert_eq!(again, b"ab");
    }

    #[test]
    fn test_peek_then_partial_reads() {
        let mut reader = PeekReader::new(Cursor::new(b"0123456789".to_vec()));
        assert_eq!(reader.peek(4).unwrap(), b"0123");
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"01");
        assert_eq!(reader.peek(3).unwrap(), b"234");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"23456789");
    }

    #[test]
    fn test_counting_writer() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"1234").unwrap();
        writer.write_all(b"56").unwrap();
        assert_eq!(writer.bytes_written(), 6);
        assert_eq!(writer.into_inner(), b"123456");
    }

    #[test]
    fn test_read_exact_or_eof() {
        let mut src = Cursor::new(b"12345".to_vec());
        let mut buf = [0u8; 3];
        assert_eq!(read_exact_or_eof(&mut src, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"123");
        assert_eq!(read_exact_or_eof(&mut src, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"45");
        assert_eq!(read_exact_or_eof(&mut src, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_skip_bytes() {
        let mut src = Cursor::new(vec![7u8; 2000]);
        assert_eq!(skip_bytes(&mut src, 1500).unwrap(), 1500);
        assert_eq!(skip_bytes(&mut src, 1500).unwrap(), 500);
    }
}
