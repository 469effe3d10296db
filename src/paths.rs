//! Path utilities: lexical cleaning, hidden-entry checks, source
//! classification, and the phantom-header naming scheme.

use std::path::Path;

/// Prefix marking a header record whose path could not be resolved to a file
/// on disk at parse time. Cleaned real paths never begin with `?`, so these
/// names cannot collide with anything the walker reports.
pub const PHANTOM_PREFIX: &str = "?";

/// What kind of source a path is, judged by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A compiled translation unit (`.c`).
    CSource,
    /// A header (`.h`).
    Header,
    /// Anything else.
    Other,
}

pub fn classify(path: &Path) -> FileKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("c") => FileKind::CSource,
        Some("h") => FileKind::Header,
        _ => FileKind::Other,
    }
}

/// True when the basename starts with `.` (but is not `.` itself).
pub fn is_hidden(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.len() > 1 && name.starts_with('.'),
        None => false,
    }
}

/// Lexically cleans a path: collapses `//` and `/./`, resolves `..` where
/// possible, and strips trailing separators. The empty path cleans to `.`.
/// Purely textual, no filesystem access.
pub fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                // Leading `..` components survive in relative paths and
                // vanish at the root of absolute ones.
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Joins `base` and `rel` and cleans the result. If `rel` is already
/// absolute it is cleaned alone.
pub fn join_clean(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        clean(rel)
    } else {
        clean(&format!("{base}/{rel}"))
    }
}

pub fn phantom_name(include_spelling: &str) -> String {
    format!("{PHANTOM_PREFIX}{}", clean(include_spelling))
}

pub fn is_phantom(path: &str) -> bool {
    path.starts_with(PHANTOM_PREFIX)
}
