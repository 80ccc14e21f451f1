//! # ArcStream Archive
//!
//! Sequential archive readers and writers for ArcStream.
//!
//! This crate processes archives as forward-only streams: one pass, no
//! seeking, no whole-archive buffering. Entries come out (or go in) one
//! at a time through a shared header model, so callers handle tar
//! members and zip entries with the same code.
//!
//! Supported container formats:
//!
//! - **ar**: Unix archive libraries, including GNU and BSD long names
//! - **cpio**: newc, crc and odc variants
//! - **tar**: POSIX ustar with pax and GNU long-name extensions
//! - **zip**: stored entries, ZIP64, data descriptors
//! - **jar**: zip with Java-specific detection and markers
//! - **7z**: detection only; its trailer metadata defeats streaming
//!
//! ## Example
//!
//! ```rust
//! use std::io::Cursor;
//! use arcstream_archive::{create, open, ArchiveFormat, EntryHeader};
//!
//! # fn main() -> arcstream_archive::Result<()> {
//! let mut writer = create(Vec::new(), ArchiveFormat::Tar)?;
//! writer.add_entry(&EntryHeader::file("notes.txt", 5), &mut &b"hello"[..])?;
//! writer.finish()?;
//! let data = writer.into_inner()?;
//!
//! let mut reader = open(Cursor::new(data))?;
//! assert_eq!(reader.format(), ArchiveFormat::Tar);
//! while let Some(entry) = reader.advance()? {
//!     println!("{entry}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Format Detection
//!
//! [`open`] probes the stream prefix against the builtin
//! [`FormatRegistry`] without consuming bytes; a declared format via
//! [`SequentialReader::with_format`] skips probing entirely, which is
//! the only way to read containers whose first bytes carry no magic
//! (an all-zero tar, say).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

use std::io::{Read, Write};

pub mod ar;
pub mod cpio;
pub mod iter;
pub mod jar;
pub mod reader;
pub mod registry;
pub mod sevenz;
pub mod tar;
pub mod writer;
pub mod zip;

// Re-exports
pub use arcstream_core::{ArcStreamError, ContentExtent, EntryHeader, EntryKind, ExtraFields, Result};
pub use iter::{EntryIter, FlatMapEntries, Headers};
pub use reader::SequentialReader;
pub use registry::{ArchiveFormat, FormatDescriptor, FormatRegistry};
pub use writer::{write_archive, PendingEntry, SequentialWriter};

/// Open a reader over `source`, detecting the archive format from its
/// leading bytes
pub fn open<R: Read>(source: R) -> Result<SequentialReader<R>> {
    SequentialReader::new(source)
}

/// Open a writer producing `format` into `sink`
pub fn create<W: Write>(sink: W, format: ArchiveFormat) -> Result<SequentialWriter<W>> {
    SequentialWriter::new(sink, format)
}
