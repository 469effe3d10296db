//! Directory traversal for the index roots.
//!
//! Depth-first, hidden entries skipped, everything else reported to the
//! caller's visitors: directories first (so they can be registered with the
//! watcher before their contents produce events), then files with their
//! classification.

use std::path::Path;

use ignore::WalkBuilder;
use tracing::warn;

use crate::paths::{self, FileKind};

pub fn walk<D, F>(root: &Path, mut on_dir: D, mut on_file: F)
where
    D: FnMut(&Path),
    F: FnMut(&Path, FileKind),
{
    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .parents(false)
        .threads(1);

    for result in builder.build() {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), "walk error, skipping entry: {err}");
                continue;
            }
        };

        match entry.file_type() {
            Some(ft) if ft.is_dir() => on_dir(entry.path()),
            Some(ft) if ft.is_file() => on_file(entry.path(), paths::classify(entry.path())),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn relative(root: &Path, path: &Path) -> String {
        path.strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn reports_dirs_and_classified_files() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        fs::write(root.path().join("a.c"), "int x;").unwrap();
        fs::write(root.path().join("sub/b.h"), "int y;").unwrap();
        fs::write(root.path().join("notes.txt"), "hi").unwrap();

        let mut dirs = BTreeSet::new();
        let mut c_files = BTreeSet::new();
        let mut headers = BTreeSet::new();
        let mut others = BTreeSet::new();

        walk(
            root.path(),
            |d| {
                dirs.insert(relative(root.path(), d));
            },
            |f, kind| {
                let name = relative(root.path(), f);
                match kind {
                    FileKind::CSource => c_files.insert(name),
                    FileKind::Header => headers.insert(name),
                    FileKind::Other => others.insert(name),
                };
            },
        );

        assert!(dirs.contains(""));
        assert!(dirs.contains("sub"));
        assert_eq!(c_files.into_iter().collect::<Vec<_>>(), ["a.c"]);
        assert_eq!(headers.into_iter().collect::<Vec<_>>(), ["sub/b.h"]);
        assert_eq!(others.into_iter().collect::<Vec<_>>(), ["notes.txt"]);
    }

    #[test]
    fn hidden_entries_are_skipped() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join(".git")).unwrap();
        fs::write(root.path().join(".git/c.c"), "int z;").unwrap();
        fs::write(root.path().join(".hidden.c"), "int w;").unwrap();
        fs::write(root.path().join("seen.c"), "int v;").unwrap();

        let mut files = Vec::new();
        walk(root.path(), |_| {}, |f, _| {
            files.push(relative(root.path(), f));
        });

        assert_eq!(files, ["seen.c"]);
    }
}
