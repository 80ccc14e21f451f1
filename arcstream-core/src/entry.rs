//! Format-neutral archive entry headers

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use crate::error::{ArcStreamError, Result};

/// Kind of archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Hard link to another entry
    Hardlink,
    /// Anything else (device nodes, fifos, format-specific members)
    Unknown,
}

impl EntryKind {
    /// Check if this is a regular file
    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File)
    }

    /// Check if this is a directory
    pub fn is_directory(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    /// Check if this is a symbolic link
    pub fn is_symlink(&self) -> bool {
        matches!(self, EntryKind::Symlink)
    }
}

/// Format-specific attributes that have no dedicated header field.
///
/// Keys are short dotted names such as `pax.comment` or `zip.extra`.
/// Read paths stash unrecognized metadata here instead of dropping it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraFields {
    fields: BTreeMap<String, Vec<u8>>,
}

impl ExtraFields {
    /// Create an empty attribute set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored attributes
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check whether no attributes are stored
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Insert or replace an attribute
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Look up an attribute by key
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    /// Check whether an attribute is present
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Iterate over attributes in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Metadata for one archive entry, independent of the container format.
///
/// Fields a format does not record stay `None`; codecs fill in their own
/// defaults when writing.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    /// Entry name with `/` separators, directories end in `/`
    pub name: String,
    /// Kind of entry
    pub kind: EntryKind,
    /// Content length in bytes, if the format declares one
    pub size: Option<u64>,
    /// Unix permission bits (no file type bits)
    pub mode: Option<u32>,
    /// Owning user id
    pub uid: Option<u32>,
    /// Owning group id
    pub gid: Option<u32>,
    /// Modification time
    pub modified: Option<SystemTime>,
    /// Target path for symlinks and hardlinks
    pub link_target: Option<String>,
    /// Format-specific attributes without a dedicated field
    pub extras: ExtraFields,
}

impl EntryHeader {
    /// Create a regular file entry with a declared content length
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
            mode: None,
            uid: None,
            gid: None,
            modified: None,
            link_target: None,
            extras: ExtraFields::new(),
        }
    }

    /// Create a directory entry, normalizing the trailing slash
    pub fn directory(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            kind: EntryKind::Directory,
            size: Some(0),
            mode: None,
            uid: None,
            gid: None,
            modified: None,
            link_target: None,
            extras: ExtraFields::new(),
        }
    }

    /// Create a symbolic link entry
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Symlink,
            size: Some(0),
            mode: None,
            uid: None,
            gid: None,
            modified: None,
            link_target: Some(target.into()),
            extras: ExtraFields::new(),
        }
    }

    /// Set permission bits
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set owning user and group ids
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Set modification time
    pub fn with_modified(mut self, time: SystemTime) -> Self {
        self.modified = Some(time);
        self
    }

    /// Attach a format-specific attribute
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.extras.insert(key, value);
        self
    }

    /// Check if this is a regular file
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Check if this is a directory
    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }

    /// Check if this is a symbolic link
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }

    /// Declared content length, zero when the format recorded none
    pub fn content_len(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Validate that this header can be written to an archive.
    ///
    /// Checks rules shared by every format; codecs apply their own
    /// field-width limits on top of this.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ArcStreamError::invalid_entry("entry name is empty"));
        }
        if self.name.contains('\0') {
            return Err(ArcStreamError::invalid_entry(
                "entry name contains a NUL byte",
            ));
        }
        if self.kind.is_file() && self.size.is_none() {
            return Err(ArcStreamError::invalid_entry(
                "file entry has no declared size",
            ));
        }
        // directories and links have no content stream in any container;
        // a declared size here would desync header and data on write
        if matches!(
            self.kind,
            EntryKind::Directory | EntryKind::Symlink | EntryKind::Hardlink
        ) && self.content_len() != 0
        {
            return Err(ArcStreamError::invalid_entry(
                "non-file entry declares content",
            ));
        }
        Ok(())
    }

    /// Validate the entry name against path traversal.
    ///
    /// Rejects absolute paths, `..` components and embedded NUL bytes.
    /// Call this before using the name to create files on disk.
    pub fn validate_path(&self) -> Result<()> {
        use std::path::Component;

        let path = std::path::Path::new(&self.name);
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    return Err(ArcStreamError::invalid_entry(format!(
                        "entry name contains parent directory reference: {}",
                        self.name
                    )));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ArcStreamError::invalid_entry(format!(
                        "entry name is an absolute path: {}",
                        self.name
                    )));
                }
                _ => {}
            }
        }
        if self.name.contains('\0') {
            return Err(ArcStreamError::invalid_entry(
                "entry name contains a NUL byte",
            ));
        }
        Ok(())
    }

    /// Entry name reduced to its safe normal components.
    ///
    /// Drops root, `.` and `..` components and replaces NUL bytes, so the
    /// result can be joined under an extraction directory.
    pub fn sanitized_name(&self) -> String {
        use std::path::Component;

        let path = std::path::Path::new(&self.name);
        let mut parts = Vec::new();
        for component in path.components() {
            if let Component::Normal(part) = component {
                if let Some(s) = part.to_str() {
                    parts.push(s.replace('\0', "_"));
                }
            }
        }
        parts.join("/")
    }
}

impl fmt::Display for EntryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind_char = match self.kind {
            EntryKind::File => '-',
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
            EntryKind::Hardlink => 'h',
            EntryKind::Unknown => '?',
        };
        match self.size {
            Some(size) => write!(f, "{}{:>12} {}", kind_char, size, self.name),
            None => write!(f, "{}{:>12} {}", kind_char, "-", self.name),
        }
    }
}
