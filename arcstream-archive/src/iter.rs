//! Lazy sequence adapters over a sequential reader
//!
//! [`SequentialReader::map_entries`] turns the pull loop into an
//! `Iterator`: each step advances to the next entry, hands the mapper the
//! header plus a bounded view of that entry's content, and yields the
//! mapper's result. Entries the mapper does not read are skipped at the
//! next step, so metadata-only passes never touch content bytes.
//!
//! The adapters own the reader and close it when the sequence ends, when
//! a step fails, and on drop. After either terminal event the iterator is
//! fused.

use std::io::{self, Read};

use arcstream_core::entry::EntryHeader;
use arcstream_core::error::{ArcStreamError, Result};

use crate::reader::SequentialReader;

fn into_io_error(err: ArcStreamError) -> io::Error {
    match err {
        ArcStreamError::Io(io) => io,
        other => io::Error::other(other),
    }
}

/// Bounded `Read` over the current entry's content.
///
/// Ends at the entry boundary. Content stored under a foreign compression
/// method refuses to read with [`io::ErrorKind::Unsupported`].
struct ContentView<'a, R: Read> {
    reader: &'a mut SequentialReader<R>,
}

impl<R: Read> Read for ContentView<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(method) = self.reader.current_method() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("entry content requires codec: {method}"),
            ));
        }
        self.reader.read_chunk(buf).map_err(into_io_error)
    }
}

impl<R: Read> SequentialReader<R> {
    /// Adapt this reader into an iterator of mapped entries.
    ///
    /// `mapper` runs once per entry while the cursor still sits on it; the
    /// content view it receives ends at the entry boundary. Reading the
    /// content is optional.
    pub fn map_entries<F, U>(self, mapper: F) -> EntryIter<R, F>
    where
        F: FnMut(&EntryHeader, &mut dyn Read) -> Result<U>,
    {
        EntryIter {
            reader: Some(self),
            mapper,
        }
    }

    /// Adapt this reader into an iterator over entry headers only
    pub fn headers(self) -> Headers<R> {
        Headers { reader: Some(self) }
    }

    /// Run `action` for every remaining entry, closing the reader at the
    /// end or at the first error
    pub fn for_each_entry<F>(self, action: F) -> Result<()>
    where
        F: FnMut(&EntryHeader, &mut dyn Read) -> Result<()>,
    {
        for item in self.map_entries(action) {
            item?;
        }
        Ok(())
    }

    /// Like [`map_entries`](Self::map_entries), but flattens the sequence
    /// each mapper call produces
    pub fn flat_map_entries<F, I>(self, mapper: F) -> FlatMapEntries<R, F, I>
    where
        F: FnMut(&EntryHeader, &mut dyn Read) -> Result<I>,
        I: IntoIterator,
    {
        FlatMapEntries {
            inner: self.map_entries(mapper),
            pending: None,
        }
    }
}

/// Iterator adapter produced by [`SequentialReader::map_entries`]
pub struct EntryIter<R: Read, F> {
    reader: Option<SequentialReader<R>>,
    mapper: F,
}

impl<R: Read, F> EntryIter<R, F> {
    /// Close the underlying reader early. The iterator yields nothing
    /// afterwards.
    pub fn close(&mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            let _ = reader.close();
        }
    }
}

impl<R: Read, F, U> Iterator for EntryIter<R, F>
where
    F: FnMut(&EntryHeader, &mut dyn Read) -> Result<U>,
{
    type Item = Result<U>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match reader.advance() {
            Ok(Some(header)) => {
                let mut view = ContentView { reader };
                let item = (self.mapper)(&header, &mut view);
                if item.is_err() {
                    self.shutdown();
                }
                Some(item)
            }
            Ok(None) => {
                self.shutdown();
                None
            }
            Err(err) => {
                self.shutdown();
                Some(Err(err))
            }
        }
    }
}

impl<R: Read, F> Drop for EntryIter<R, F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Header-only iterator produced by [`SequentialReader::headers`]
pub struct Headers<R: Read> {
    reader: Option<SequentialReader<R>>,
}

impl<R: Read> Headers<R> {
    /// Close the underlying reader early
    pub fn close(&mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            let _ = reader.close();
        }
    }
}

impl<R: Read> Iterator for Headers<R> {
    type Item = Result<EntryHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match reader.advance() {
            Ok(Some(header)) => Some(Ok(header)),
            Ok(None) => {
                self.shutdown();
                None
            }
            Err(err) => {
                self.shutdown();
                Some(Err(err))
            }
        }
    }
}

impl<R: Read> Drop for Headers<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Flattening iterator produced by
/// [`SequentialReader::flat_map_entries`]
pub struct FlatMapEntries<R: Read, F, I: IntoIterator> {
    inner: EntryIter<R, F>,
    pending: Option<I::IntoIter>,
}

impl<R: Read, F, I: IntoIterator> FlatMapEntries<R, F, I> {
    /// Close the underlying reader early. Items already produced by the
    /// mapper keep draining.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl<R: Read, F, I> Iterator for FlatMapEntries<R, F, I>
where
    F: FnMut(&EntryHeader, &mut dyn Read) -> Result<I>,
    I: IntoIterator,
{
    type Item = Result<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pending) = &mut self.pending {
                if let Some(item) = pending.next() {
                    return Some(Ok(item));
                }
                self.pending = None;
            }
            match self.inner.next()? {
                Ok(group) => self.pending = Some(group.into_iter()),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArchiveFormat;
    use crate::writer::SequentialWriter;
    use std::io::Cursor;

    fn sample_tar() -> Vec<u8> {
        let mut writer = SequentialWriter::new(Vec::new(), ArchiveFormat::Tar).unwrap();
        writer
            .add_entry(&EntryHeader::file("a.txt", 5), &mut &b"alpha"[..])
            .unwrap();
        writer
            .add_entry(&EntryHeader::file("b.txt", 4), &mut &b"beta"[..])
            .unwrap();
        writer
            .add_entry(&EntryHeader::file("c.txt", 5), &mut &b"gamma"[..])
            .unwrap();
        writer.finish().unwrap();
        writer.into_inner().unwrap()
    }

    fn open_sample() -> SequentialReader<Cursor<Vec<u8>>> {
        SequentialReader::new(Cursor::new(sample_tar())).unwrap()
    }

    #[test]
    fn test_map_entries_reads_each_entry_once() {
        let collected: Result<Vec<(String, Vec<u8>)>> = open_sample()
            .map_entries(|header, content| {
                let mut bytes = Vec::new();
                content.read_to_end(&mut bytes)?;
                Ok((header.name.clone(), bytes))
            })
            .collect();
        let collected = collected.unwrap();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0], ("a.txt".to_string(), b"alpha".to_vec()));
        assert_eq!(collected[2], ("c.txt".to_string(), b"gamma".to_vec()));
    }

    #[test]
    fn test_map_entries_without_reading_content() {
        let names: Result<Vec<String>> = open_sample()
            .map_entries(|header, _content| Ok(header.name.clone()))
            .collect();
        assert_eq!(names.unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_mapper_error_fuses_iterator() {
        let mut iter = open_sample().map_entries(|header, _content| {
            if header.name == "b.txt" {
                Err(ArcStreamError::invalid_entry("refused"))
            } else {
                Ok(header.name.clone())
            }
        });
        assert_eq!(iter.next().unwrap().unwrap(), "a.txt");
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_content_view_is_bounded() {
        // an over-eager read in one entry must not leak the next entry's bytes
        let sizes: Result<Vec<u64>> = open_sample()
            .map_entries(|_header, content| {
                let mut sink = Vec::new();
                let n = std::io::copy(content, &mut sink)?;
                Ok(n)
            })
            .collect();
        assert_eq!(sizes.unwrap(), vec![5, 4, 5]);
    }

    #[test]
    fn test_headers_iterator() {
        let names: Result<Vec<String>> = open_sample()
            .headers()
            .map(|item| item.map(|header| header.name))
            .collect();
        assert_eq!(names.unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_for_each_entry_accumulates() {
        let mut total = 0u64;
        open_sample()
            .for_each_entry(|_header, content| {
                total += std::io::copy(content, &mut std::io::sink())?;
                Ok(())
            })
            .unwrap();
        assert_eq!(total, 14);
    }

    #[test]
    fn test_flat_map_entries_flattens() {
        let letters: Result<Vec<char>> = open_sample()
            .flat_map_entries(|header, _content| {
                Ok(header.name.chars().take(1).collect::<Vec<char>>())
            })
            .collect();
        assert_eq!(letters.unwrap(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_explicit_close_stops_iteration() {
        let mut iter = open_sample().map_entries(|header, _content| Ok(header.name.clone()));
        assert_eq!(iter.next().unwrap().unwrap(), "a.txt");
        iter.close();
        assert!(iter.next().is_none());
    }
}
