//! Format registry and stream-prefix detection
//!
//! Formats register as [`FormatDescriptor`]s: a signature probe plus
//! constructors for the pull and push codec halves. Detection looks at a
//! bounded prefix of the stream through a [`PeekReader`], so no input is
//! consumed before decoding starts. Probe order puts the formats with
//! narrow signatures (ar, cpio, 7z, jar) ahead of the broad zip and tar
//! checks; jar in particular must run before zip because every jar prefix
//! is also a valid zip prefix.

use std::fmt;
use std::io::Read;
use std::sync::OnceLock;

use arcstream_core::error::{ArcStreamError, Result};
use arcstream_core::io::PeekReader;
use arcstream_core::traits::{EntryDecoder, EntryEncoder};

use crate::{ar, cpio, jar, sevenz, tar, zip};

/// Number of prefix bytes a registry probe may inspect
pub const PROBE_LEN: usize = 512;

/// Container formats known to the builtin registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// Unix archiver format used for static libraries and Debian packages
    Ar,
    /// cpio archives (newc, crc and odc variants)
    Cpio,
    /// POSIX ustar tape archives, including PAX and GNU extensions
    Tar,
    /// PKZIP archives
    Zip,
    /// Java archives, a zip profile with a leading `META-INF/` member
    Jar,
    /// 7-Zip archives (recognized, but not streamable)
    SevenZ,
}

impl ArchiveFormat {
    /// Short lowercase format name
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveFormat::Ar => "ar",
            ArchiveFormat::Cpio => "cpio",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Jar => "jar",
            ArchiveFormat::SevenZ => "7z",
        }
    }

    /// Typical file extension
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Ar => "a",
            ArchiveFormat::Cpio => "cpio",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Jar => "jar",
            ArchiveFormat::SevenZ => "7z",
        }
    }

    /// MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Ar => "application/x-archive",
            ArchiveFormat::Cpio => "application/x-cpio",
            ArchiveFormat::Tar => "application/x-tar",
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::Jar => "application/java-archive",
            ArchiveFormat::SevenZ => "application/x-7z-compressed",
        }
    }

    /// Whether the format can be processed in one forward pass.
    ///
    /// 7z keeps its metadata at the end of the file, so it is detected
    /// but never streamed.
    pub fn supports_streaming(&self) -> bool {
        !matches!(self, ArchiveFormat::SevenZ)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One registered format: its signature probe plus codec constructors.
///
/// The constructors are plain function pointers, which keeps a registry
/// immutable and shareable across threads.
#[derive(Debug, Clone, Copy)]
pub struct FormatDescriptor {
    /// Format this descriptor provides
    pub format: ArchiveFormat,
    /// Signature probe over a stream prefix of up to [`PROBE_LEN`] bytes
    pub matches: fn(&[u8]) -> bool,
    /// Construct a fresh pull-side codec
    pub decoder: fn() -> Result<Box<dyn EntryDecoder>>,
    /// Construct a fresh push-side codec
    pub encoder: fn() -> Result<Box<dyn EntryEncoder>>,
}

/// Ordered collection of format descriptors.
///
/// Probes run in registration order and the first match wins.
pub struct FormatRegistry {
    descriptors: Vec<FormatDescriptor>,
}

static BUILTIN: OnceLock<FormatRegistry> = OnceLock::new();

impl FormatRegistry {
    /// Build a registry from an ordered descriptor list
    pub fn new(descriptors: Vec<FormatDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Shared registry holding every builtin format
    pub fn builtin() -> &'static FormatRegistry {
        BUILTIN.get_or_init(|| {
            FormatRegistry::new(vec![
                ar::descriptor(),
                cpio::descriptor(),
                sevenz::descriptor(),
                jar::descriptor(),
                zip::descriptor(),
                tar::descriptor(),
            ])
        })
    }

    /// Formats in probe order
    pub fn formats(&self) -> impl Iterator<Item = ArchiveFormat> + '_ {
        self.descriptors.iter().map(|d| d.format)
    }

    /// Look up the descriptor for a declared format
    pub fn descriptor(&self, format: ArchiveFormat) -> Result<&FormatDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.format == format)
            .ok_or_else(|| ArcStreamError::invalid_declared_type(format.name()))
    }

    /// Match a raw stream prefix against the registered probes
    pub fn detect_prefix(&self, prefix: &[u8]) -> Result<&FormatDescriptor> {
        self.descriptors
            .iter()
            .find(|d| (d.matches)(prefix))
            .ok_or(ArcStreamError::UnsupportedFormat {
                probed: prefix.len(),
            })
    }

    /// Resolve the format for a source stream.
    ///
    /// A declared format short-circuits probing entirely; otherwise up to
    /// [`PROBE_LEN`] bytes are peeked (never consumed) and matched in
    /// registration order.
    pub fn detect<R: Read>(
        &self,
        src: &mut PeekReader<R>,
        declared: Option<ArchiveFormat>,
    ) -> Result<&FormatDescriptor> {
        if let Some(format) = declared {
            return self.descriptor(format);
        }
        let prefix = src.peek(PROBE_LEN)?;
        self.detect_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fake_jar_prefix() -> Vec<u8> {
        let mut prefix = vec![0u8; 64];
        prefix[..4].copy_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
        prefix[26..28].copy_from_slice(&20u16.to_le_bytes());
        prefix[30..39].copy_from_slice(b"META-INF/");
        prefix
    }

    #[test]
    fn test_builtin_probe_signatures() {
        let registry = FormatRegistry::builtin();

        let ar = b"!<arch>\ndata".to_vec();
        assert_eq!(registry.detect_prefix(&ar).unwrap().format, ArchiveFormat::Ar);

        let cpio = b"070701000000".to_vec();
        assert_eq!(
            registry.detect_prefix(&cpio).unwrap().format,
            ArchiveFormat::Cpio
        );

        let sevenz = vec![0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04];
        assert_eq!(
            registry.detect_prefix(&sevenz).unwrap().format,
            ArchiveFormat::SevenZ
        );

        let zip = vec![0x50, 0x4B, 0x03, 0x04, 0x14, 0x00];
        assert_eq!(
            registry.detect_prefix(&zip).unwrap().format,
            ArchiveFormat::Zip
        );

        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(
            registry.detect_prefix(&tar).unwrap().format,
            ArchiveFormat::Tar
        );
    }

    #[test]
    fn test_jar_wins_over_zip() {
        let registry = FormatRegistry::builtin();
        let prefix = fake_jar_prefix();
        assert_eq!(
            registry.detect_prefix(&prefix).unwrap().format,
            ArchiveFormat::Jar
        );
    }

    #[test]
    fn test_unsupported_prefix() {
        let registry = FormatRegistry::builtin();
        let err = registry.detect_prefix(b"not an archive").unwrap_err();
        assert!(matches!(
            err,
            ArcStreamError::UnsupportedFormat { probed: 14 }
        ));
    }

    #[test]
    fn test_detect_consumes_nothing() {
        let registry = FormatRegistry::builtin();
        let mut src = PeekReader::new(Cursor::new(b"!<arch>\nrest".to_vec()));
        let descriptor = registry.detect(&mut src, None).unwrap();
        assert_eq!(descriptor.format, ArchiveFormat::Ar);
        assert_eq!(src.consumed(), 0);

        let mut all = Vec::new();
        src.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"!<arch>\nrest");
    }

    #[test]
    fn test_declared_format_skips_probe() {
        let registry = FormatRegistry::builtin();
        // Prefix says ar, declared type wins anyway.
        let mut src = PeekReader::new(Cursor::new(b"!<arch>\n".to_vec()));
        let descriptor = registry
            .detect(&mut src, Some(ArchiveFormat::Tar))
            .unwrap();
        assert_eq!(descriptor.format, ArchiveFormat::Tar);
    }

    #[test]
    fn test_unregistered_declared_format() {
        let registry = FormatRegistry::new(vec![crate::zip::descriptor()]);
        let mut src = PeekReader::new(Cursor::new(Vec::new()));
        let err = registry
            .detect(&mut src, Some(ArchiveFormat::Tar))
            .unwrap_err();
        assert!(matches!(err, ArcStreamError::InvalidDeclaredType { .. }));
    }

    #[test]
    fn test_builtin_probe_order() {
        let registry = FormatRegistry::builtin();
        let order: Vec<ArchiveFormat> = registry.formats().collect();
        assert_eq!(
            order,
            vec![
                ArchiveFormat::Ar,
                ArchiveFormat::Cpio,
                ArchiveFormat::SevenZ,
                ArchiveFormat::Jar,
                ArchiveFormat::Zip,
                ArchiveFormat::Tar,
            ]
        );
    }

    #[test]
    fn test_format_metadata() {
        assert_eq!(ArchiveFormat::Jar.name(), "jar");
        assert_eq!(ArchiveFormat::SevenZ.to_string(), "7z");
        assert_eq!(ArchiveFormat::Tar.mime_type(), "application/x-tar");
        assert!(ArchiveFormat::Zip.supports_streaming());
        assert!(!ArchiveFormat::SevenZ.supports_streaming());
    }
}
