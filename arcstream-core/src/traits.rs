//! Streaming codec traits implemented by each archive format
//!
//! A format plugs into the engine as a decoder/encoder pair. Decoders pull
//! headers off a forward-only byte stream; encoders push headers, content
//! framing and trailers onto one. The engine owns the content bytes in both
//! directions, so codecs never buffer entry data.

use std::io::{Read, Write};

use crate::crc::ContentDigest;
use crate::entry::EntryHeader;
use crate::error::Result;

/// How the content bytes of one entry are laid out on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentExtent {
    /// `len` raw bytes follow the header and can be streamed directly
    Known {
        /// Content length in bytes
        len: u64,
    },
    /// `len` bytes follow but are transformed by a compression method this
    /// crate does not decode; they can be skipped, not read
    Encoded {
        /// Stored (transformed) length in bytes
        len: u64,
        /// Human-readable method name
        method: String,
    },
    /// Length is not declared ahead of the content, so a forward-only pass
    /// cannot locate the end of the entry
    Delimited,
}

impl ContentExtent {
    /// Raw byte count the content occupies on the stream, if declared
    pub fn raw_len(&self) -> Option<u64> {
        match self {
            ContentExtent::Known { len } | ContentExtent::Encoded { len, .. } => Some(*len),
            ContentExtent::Delimited => None,
        }
    }
}

/// Pull side of a format codec.
///
/// One decoder instance walks one archive from start to end. The engine
/// calls [`next_header`](Self::next_header), streams or skips the content
/// itself, then calls [`finish_entry`](Self::finish_entry) before asking
/// for the next header. Format bookkeeping members (tar PAX blocks, GNU
/// long-name members, ar name tables, the cpio trailer) are consumed
/// internally and never surface as entries.
pub trait EntryDecoder {
    /// Parse the next entry header from the stream.
    ///
    /// # Arguments
    /// * `src` - Source positioned at a header boundary
    /// * `offset` - Absolute archive offset of that boundary, for diagnostics
    ///
    /// # Returns
    /// The next header, or `None` once the end-of-archive marker (or a clean
    /// end of input, where the format allows it) is reached.
    fn next_header(&mut self, src: &mut dyn Read, offset: u64) -> Result<Option<EntryHeader>>;

    /// Describe how the content of the entry just returned by
    /// [`next_header`](Self::next_header) is stored.
    fn content_extent(&self, header: &EntryHeader) -> Result<ContentExtent>;

    /// Consume per-entry framing after the content bytes.
    ///
    /// Called once the engine has streamed or drained the full content,
    /// with `offset` pointing just past it. Implementations skip alignment
    /// padding, read trailing descriptor records and verify checksums
    /// against `digest`.
    fn finish_entry(
        &mut self,
        src: &mut dyn Read,
        header: &EntryHeader,
        digest: &ContentDigest,
        offset: u64,
    ) -> Result<()>;
}

/// Push side of a format codec.
///
/// One encoder instance produces one archive. The engine drives it through
/// `start_archive`, then `write_header`/`finish_entry` around each entry's
/// content (which the engine streams itself), and `finish_archive` exactly
/// once at the end.
pub trait EntryEncoder {
    /// Emit any archive-level preamble, such as the ar global magic.
    fn start_archive(&mut self, sink: &mut dyn Write) -> Result<()>;

    /// Emit the header record for one entry.
    ///
    /// # Arguments
    /// * `sink` - Destination stream
    /// * `header` - Validated entry metadata
    /// * `offset` - Absolute archive offset where this header starts, for
    ///   formats that refer back to it from a trailer
    fn write_header(&mut self, sink: &mut dyn Write, header: &EntryHeader, offset: u64)
    -> Result<()>;

    /// Emit per-entry framing after the content bytes.
    ///
    /// `digest` covers exactly the content the engine copied, so trailing
    /// checksum records and alignment padding can be derived from it.
    fn finish_entry(
        &mut self,
        sink: &mut dyn Write,
        header: &EntryHeader,
        digest: &ContentDigest,
    ) -> Result<()>;

    /// Emit the end-of-archive trailer.
    ///
    /// `offset` is the absolute archive offset at which the trailer begins.
    fn finish_archive(&mut self, sink: &mut dyn Write, offset: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_extent_raw_len() {
        assert_eq!(ContentExtent::Known { len: 42 }.raw_len(), Some(42));
        let encoded = ContentExtent::Encoded {
            len: 10,
            method: "deflate".to_string(),
        };
        assert_eq!(encoded.raw_len(), Some(10));
        assert_eq!(ContentExtent::Delimited.raw_len(), None);
    }
}
