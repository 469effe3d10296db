//! Content-addressed identifiers for files and symbols.
//!
//! Both identifier kinds are 20-byte SHA-1 digests: a `FileId` hashes the
//! cleaned path of a file, a `SymbolId` hashes the clang unified symbol
//! resolution string. USRs are stable across translation units, which is
//! what lets the resolver stitch a use in one TU to a definition in another.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::paths;

/// Identifies a file by the SHA-1 of its cleaned path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; 20]);

impl FileId {
    /// Digest of the cleaned form of `path`. Cleaning is idempotent, so
    /// callers may pass either raw or already-cleaned paths.
    pub fn for_path(path: &str) -> Self {
        FileId(digest(paths::clean(path).as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(FileId)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", hex_prefix(&self.0))
    }
}

/// Identifies a symbol by the SHA-1 of its USR.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId([u8; 20]);

impl SymbolId {
    pub fn for_usr(usr: &str) -> Self {
        SymbolId(digest(usr.as_bytes()))
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId({})", hex_prefix(&self.0))
    }
}

fn digest(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

fn hex_prefix(bytes: &[u8; 20]) -> String {
    bytes[..6].iter().map(|b| format!("{b:02x}")).collect()
}
