//! Java archives
//!
//! A jar is a zip whose first entry lives under `META-INF/`, so both codec
//! halves are the zip ones; writing adds the `jar` tool's marker extra
//! field to the first local header. Detection must outrank plain zip in
//! the registry, since every jar prefix is also a valid zip prefix.

use arcstream_core::error::Result;
use arcstream_core::traits::{EntryDecoder, EntryEncoder};

use crate::registry::{ArchiveFormat, FormatDescriptor};
use crate::zip::{ZipDecoder, ZipEncoder};

/// Check a stream prefix for a zip local header whose first entry name
/// starts with `META-INF/`
pub fn probe(prefix: &[u8]) -> bool {
    if prefix.len() < 39 || prefix[..4] != [0x50, 0x4B, 0x03, 0x04] {
        return false;
    }
    let name_len = u16::from_le_bytes([prefix[26], prefix[27]]);
    name_len >= 9 && &prefix[30..39] == b"META-INF/"
}

fn new_decoder() -> Result<Box<dyn EntryDecoder>> {
    Ok(Box::new(ZipDecoder::new()))
}

fn new_encoder() -> Result<Box<dyn EntryEncoder>> {
    Ok(Box::new(ZipEncoder::jar()))
}

/// Registry descriptor for jar
pub fn descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: ArchiveFormat::Jar,
        matches: probe,
        decoder: new_decoder,
        encoder: new_encoder,
    }
}
