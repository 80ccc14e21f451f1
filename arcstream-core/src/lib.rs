//! # ArcStream Core
//!
//! Core building blocks for the ArcStream streaming archive toolkit.
//!
//! This crate provides:
//! - Format-neutral entry headers and attribute handling
//! - Streaming decoder/encoder traits implemented by each container format
//! - Error types shared across the toolkit
//! - Look-ahead and byte-counting stream adapters
//! - CRC32 and combined content digests for trailer verification
//!
//! ## Example
//!
//! ```rust
//! use arcstream_core::crc::Crc32;
//! use arcstream_core::entry::EntryHeader;
//!
//! let header = EntryHeader::file("notes.txt", 5).with_mode(0o644);
//! assert!(header.is_file());
//! assert_eq!(header.content_len(), 5);
//!
//! assert_eq!(Crc32::compute(b"12345"), 0xCBF53A1C);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod crc;
pub mod entry;
pub mod error;
pub mod io;
pub mod traits;

pub use crc::{ContentDigest, Crc32};
pub use entry::{EntryHeader, EntryKind, ExtraFields};
pub use error::{ArcStreamError, Result};
pub use io::{CountingWriter, PeekReader, read_exact_or_eof, skip_bytes};
pub use traits::{ContentExtent, EntryDecoder, EntryEncoder};

/// Commonly used imports
pub mod prelude {
    pub use crate::crc::{ContentDigest, Crc32};
    pub use crate::entry::{EntryHeader, EntryKind, ExtraFields};
    pub use crate::error::{ArcStreamError, Result};
    pub use crate::io::{CountingWriter, PeekReader};
    pub use crate::traits::{ContentExtent, EntryDecoder, EntryEncoder};
}
