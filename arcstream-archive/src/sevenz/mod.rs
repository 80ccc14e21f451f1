//! 7-Zip archives, detection only
//!
//! 7z keeps the entry table in a trailer at the end of the file, so a
//! forward-only pass has nothing to walk. The format is registered for
//! detection and reports itself as unstreamable rather than being
//! misdiagnosed as an unknown signature.

use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::traits::{EntryDecoder, EntryEncoder};

use crate::registry::{ArchiveFormat, FormatDescriptor};

/// 7z signature bytes
pub const MAGIC: &[u8; 6] = &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// Check a stream prefix for the 7z signature
pub fn probe(prefix: &[u8]) -> bool {
    prefix.len() >= MAGIC.len() && &prefix[..MAGIC.len()] == MAGIC
}

fn new_decoder() -> Result<Box<dyn EntryDecoder>> {
    Err(ArcStreamError::sequential_unsupported(
        ArchiveFormat::SevenZ.name(),
    ))
}

fn new_encoder() -> Result<Box<dyn EntryEncoder>> {
    Err(ArcStreamError::sequential_unsupported(
        ArchiveFormat::SevenZ.name(),
    ))
}

/// Registry descriptor for 7z
pub fn descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: ArchiveFormat::SevenZ,
        matches: probe,
        decoder: new_decoder,
        encoder: new_encoder,
    }
}
