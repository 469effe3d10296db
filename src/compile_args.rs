//! Per-project compile argument lookup.
//!
//! Each index root may carry a `compile_commands.json` (the standard clang
//! compilation database). Only include and definition flags survive loading;
//! everything else in the command line is irrelevant to indexing and gets
//! dropped. Paths are re-based into the frame the daemon was started in:
//! roots given as relative paths yield relative file and include paths,
//! absolute roots yield absolute ones.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::paths;

#[derive(Debug, Deserialize)]
struct CompileCommand {
    directory: String,
    command: String,
    file: String,
}

/// Maps canonical file paths to the argument vector the parser should use.
/// Unknown files get an empty vector.
#[derive(Debug)]
pub struct CompileArgsDb {
    args: HashMap<String, Vec<String>>,
}

impl CompileArgsDb {
    /// Loads `ROOT/compile_commands.json` for every root that has one.
    /// Missing databases are skipped; malformed ones abort startup.
    pub fn load(roots: &[PathBuf]) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load_in(roots, &cwd)
    }

    fn load_in(roots: &[PathBuf], cwd: &Path) -> Result<Self> {
        let mut args = HashMap::new();

        for root in roots {
            let db_path = if root.is_absolute() {
                root.join("compile_commands.json")
            } else {
                cwd.join(root).join("compile_commands.json")
            };
            let text = match fs::read_to_string(&db_path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(root = %root.display(), "no compile database");
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading {}", db_path.display()));
                }
            };

            let records: Vec<CompileCommand> = serde_json::from_str(&text)
                .with_context(|| format!("malformed compile database {}", db_path.display()))?;

            let absolute_frame = root.is_absolute();
            for record in &records {
                let file = rebase_path(&record.directory, &record.file, absolute_frame, cwd);
                let flags = extract_flags(&record.command, &record.directory, absolute_frame, cwd);
                args.insert(file, flags);
            }

            info!(
                root = %root.display(),
                entries = records.len(),
                "compile database loaded"
            );
        }

        Ok(CompileArgsDb { args })
    }

    pub fn args_for(&self, path: &str) -> &[String] {
        self.args
            .get(&paths::clean(path))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Re-bases `path` (resolved against the record's directory when relative)
/// into the requested frame: absolute, or relative to the working directory.
fn rebase_path(record_dir: &str, path: &str, absolute_frame: bool, cwd: &Path) -> String {
    let resolved = paths::join_clean(record_dir, path);
    if absolute_frame {
        if resolved.starts_with('/') {
            resolved
        } else {
            paths::join_clean(&cwd.to_string_lossy(), &resolved)
        }
    } else {
        relative_to(&resolved, cwd)
    }
}

fn relative_to(path: &str, base: &Path) -> String {
    match Path::new(path).strip_prefix(base) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        // Outside the working directory; the absolute form is the best
        // stable name available.
        Err(_) => path.to_string(),
    }
}

/// Keeps only `-D`/`-I` flags (joined and separated forms) from a compile
/// command, re-basing every include directory.
fn extract_flags(command: &str, record_dir: &str, absolute_frame: bool, cwd: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut tokens = command.split_whitespace();

    while let Some(token) = tokens.next() {
        match token {
            "-D" => {
                if let Some(value) = tokens.next() {
                    out.push("-D".to_string());
                    out.push(value.to_string());
                }
            }
            "-I" => {
                if let Some(dir) = tokens.next() {
                    out.push("-I".to_string());
                    out.push(rebase_path(record_dir, dir, absolute_frame, cwd));
                }
            }
            _ if token.len() > 2 && token.starts_with("-D") => {
                out.push(token.to_string());
            }
            _ if token.len() > 2 && token.starts_with("-I") => {
                let dir = rebase_path(record_dir, &token[2..], absolute_frame, cwd);
                out.push(format!("-I{dir}"));
            }
            _ => {}
        }
    }

    out
}
