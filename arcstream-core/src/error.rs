//! Error types for ArcStream operations

use thiserror::Error;

/// Result type alias for ArcStream operations
pub type Result<T> = std::result::Result<T, ArcStreamError>;

/// Errors that can occur while reading or writing archives
#[derive(Error, Debug)]
pub enum ArcStreamError {
    /// I/O error from underlying reader/writer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No registered format matched the probed input prefix
    #[error("no registered archive format matches the input (probed {probed} bytes)")]
    UnsupportedFormat {
        /// Number of prefix bytes that were available for probing
        probed: usize,
    },

    /// A caller-declared format is not present in the registry
    #[error("declared archive format {name:?} is not registered")]
    InvalidDeclaredType {
        /// Name of the requested format
        name: String,
    },

    /// Structurally invalid archive data
    #[error("malformed archive at offset {offset}: {message}")]
    MalformedArchive {
        /// Byte offset where the problem was detected
        offset: u64,
        /// Description of the problem
        message: String,
    },

    /// Input ended in the middle of a header or entry content
    #[error("input truncated: {expected} more bytes expected")]
    TruncatedInput {
        /// Number of bytes still owed by the source
        expected: u64,
    },

    /// Operation is not legal in the cursor's current position
    #[error("invalid cursor state for {operation}: {state}")]
    InvalidCursorState {
        /// Operation that was attempted
        operation: String,
        /// Description of the current state
        state: String,
    },

    /// Reader has been closed
    #[error("archive reader is closed")]
    ClosedReader,

    /// Writer has been closed
    #[error("archive writer is closed")]
    ClosedWriter,

    /// Batch write received entries destined for different formats
    #[error("mixed entry formats in one archive: expected {expected}, found {found}")]
    MixedEntryTypes {
        /// Format inferred from the first entry
        expected: String,
        /// Conflicting format of a later entry
        found: String,
    },

    /// Entry content length differed from the declared header size
    #[error("entry content size mismatch: declared {declared} bytes, observed {actual}")]
    SizeMismatch {
        /// Size announced in the entry header
        declared: u64,
        /// Size actually observed on the stream
        actual: u64,
    },

    /// Writer was closed before the archive trailer was written
    #[error("archive was not finished before close")]
    UnfinishedArchive,

    /// Format cannot be processed as a forward-only stream
    #[error("format {format} does not support sequential streaming")]
    SequentialUnsupported {
        /// Name of the offending format
        format: String,
    },

    /// Entry content uses a compression method this crate does not decode
    #[error("unsupported compression method: {method}")]
    UnsupportedCodec {
        /// Name or numeric id of the method
        method: String,
    },

    /// Entry header fails validation for the target format
    #[error("invalid entry: {message}")]
    InvalidEntry {
        /// Description of the violated rule
        message: String,
    },
}

impl ArcStreamError {
    /// Create a malformed archive error
    pub fn malformed(offset: u64, message: impl Into<String>) -> Self {
        Self::MalformedArchive {
            offset,
            message: message.into(),
        }
    }

    /// Create a truncated input error
    pub fn truncated(expected: u64) -> Self {
        Self::TruncatedInput { expected }
    }

    /// Create an invalid cursor state error
    pub fn invalid_cursor(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidCursorState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Create a mixed entry formats error
    pub fn mixed_types(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::MixedEntryTypes {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a size mismatch error
    pub fn size_mismatch(declared: u64, actual: u64) -> Self {
        Self::SizeMismatch { declared, actual }
    }

    /// Create a sequential streaming unsupported error
    pub fn sequential_unsupported(format: impl Into<String>) -> Self {
        Self::SequentialUnsupported {
            format: format.into(),
        }
    }

    /// Create an unsupported compression method error
    pub fn unsupported_codec(method: impl Into<String>) -> Self {
        Self::UnsupportedCodec {
            method: method.into(),
        }
    }

    /// Create an invalid entry error
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        Self::InvalidEntry {
            message: message.into(),
        }
    }

    /// Create an invalid declared format error
    pub fn invalid_declared_type(name: impl Into<String>) -> Self {
        Self::InvalidDeclaredType { name: name.into() }
    }

    /// Create an unsupported format error
    pub fn unsupported_format(probed: usize) -> Self {
        Self::UnsupportedFormat { probed }
    }
}
