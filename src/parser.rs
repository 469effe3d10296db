//! The libclang adapter.
//!
//! Each worker owns one [`Parser`] (and with it one clang index). A parse
//! walks the cursor tree in source order, recording declarations,
//! definitions, uses, and inclusion directives into a fresh [`TuRecord`].
//! The record is bincode-encoded on the worker thread so the reconcile task
//! receives install-ready bytes.

use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clang::{Clang, Entity, EntityKind, EntityVisitResult, Index};
use tracing::{debug, trace, warn};

use crate::compile_args::CompileArgsDb;
use crate::paths;
use crate::record::{ParsedUnit, SymbolInfo, SymbolLocReq, TuRecord};

pub struct Parser<'c> {
    index: Index<'c>,
    args_db: Arc<CompileArgsDb>,
}

impl<'c> Parser<'c> {
    pub fn new(clang: &'c Clang, args_db: Arc<CompileArgsDb>) -> Self {
        Parser {
            index: Index::new(clang, false, false),
            args_db,
        }
    }

    /// Parses one file with its compile arguments.
    ///
    /// A parse the analyzer rejects outright still yields a record with the
    /// correct file and mtime and empty symbol maps: installing it replaces
    /// whatever stale graph the store held for that file.
    pub fn parse(&self, file: &str) -> Result<ParsedUnit> {
        let file = paths::clean(file);
        let mtime = fs::metadata(&file)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("stat {file}"))?;

        let mut record = TuRecord::new(file.clone(), mtime);
        let args = self.args_db.args_for(&file);

        let mut parser = self.index.parser(&file);
        parser.arguments(args).detailed_preprocessing_record(true);

        match parser.parse() {
            Ok(tu) => {
                tu.get_entity()
                    .visit_children(|entity, _parent| visit(&mut record, entity));
            }
            Err(err) => {
                warn!(%file, "analyzer rejected the file: {err}");
            }
        }

        ParsedUnit::new(record).context("encoding record")
    }
}

fn visit(record: &mut TuRecord, entity: Entity) -> EntityVisitResult {
    let Some(loc) = location_of(&entity) else {
        // System code or a degenerate location: no records from this
        // subtree.
        return EntityVisitResult::Continue;
    };

    match entity.get_kind() {
        EntityKind::FunctionDecl
        | EntityKind::StructDecl
        | EntityKind::FieldDecl
        | EntityKind::TypedefDecl
        | EntityKind::EnumDecl
        | EntityKind::EnumConstantDecl => {
            if let Some(sym) = symbol_at(&entity, loc) {
                match entity.get_definition().and_then(|def| symbol_of(&def)) {
                    Some(def) => record.insert_decl_with_def(&sym, &def),
                    None => record.insert_decl(&sym),
                }
            }
        }
        // A macro definition is its own definition site.
        EntityKind::MacroDefinition => {
            if let Some(sym) = symbol_at(&entity, loc) {
                record.insert_decl_with_def(&sym, &sym);
            }
        }
        EntityKind::VarDecl => {
            if let Some(sym) = symbol_at(&entity, loc) {
                record.insert_decl(&sym);
            }
        }
        EntityKind::ParmDecl => {
            // Unnamed parameters in prototypes carry no spelling.
            if let Some(sym) = symbol_at(&entity, loc) {
                if !sym.name.is_empty() {
                    record.insert_decl(&sym);
                }
            }
        }
        EntityKind::CallExpr => insert_reference(record, &entity, loc, true),
        EntityKind::DeclRefExpr
        | EntityKind::TypeRef
        | EntityKind::MemberRef
        | EntityKind::MacroExpansion => insert_reference(record, &entity, loc, false),
        EntityKind::InclusionDirective => insert_inclusion(record, &entity),
        _ => {}
    }

    EntityVisitResult::Recurse
}

fn location_of(entity: &Entity) -> Option<SymbolLocReq> {
    let location = entity.get_location()?.get_file_location();
    let path = location.file?.get_path();
    let path = path.to_str()?;
    if path.is_empty() {
        return None;
    }
    Some(SymbolLocReq::new(
        paths::clean(path),
        location.line as i32,
        location.column as i32,
    ))
}

fn symbol_at(entity: &Entity, loc: SymbolLocReq) -> Option<SymbolInfo> {
    let usr = entity.get_usr()?.0;
    if usr.is_empty() {
        return None;
    }
    Some(SymbolInfo {
        name: entity.get_name().unwrap_or_default(),
        usr,
        loc,
    })
}

fn symbol_of(entity: &Entity) -> Option<SymbolInfo> {
    let loc = location_of(entity)?;
    symbol_at(entity, loc)
}

fn insert_reference(record: &mut TuRecord, entity: &Entity, loc: SymbolLocReq, func_call: bool) {
    let Some(decl) = entity.get_reference() else {
        trace!("use without a declaration, ignoring");
        return;
    };
    let Some(usr) = decl.get_usr().map(|u| u.0).filter(|u| !u.is_empty()) else {
        return;
    };

    let sym = SymbolInfo {
        name: entity.get_name().unwrap_or_default(),
        usr: usr.clone(),
        loc,
    };
    record.insert_use(&sym, &usr, func_call);
}

fn insert_inclusion(record: &mut TuRecord, entity: &Entity) {
    let spelling = entity.get_name().unwrap_or_default();
    match entity.get_file() {
        Some(file) => {
            let path = file.get_path();
            let mtime = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            record.insert_header(&spelling, Some((&path.to_string_lossy(), mtime)));
        }
        None if spelling.is_empty() => {}
        None => record.insert_header(&spelling, None),
    }
}

/// Body of one parser worker thread: drain the parse queue until it closes,
/// publishing each completed unit to the reconcile task. Workers never touch
/// the symbol store.
pub fn run_worker(
    args_db: Arc<CompileArgsDb>,
    files: crossbeam_channel::Receiver<String>,
    done: tokio::sync::mpsc::Sender<ParsedUnit>,
) {
    let clang = match Clang::new() {
        Ok(clang) => clang,
        Err(err) => {
            warn!("libclang unavailable on worker thread: {err}");
            return;
        }
    };
    let parser = Parser::new(&clang, args_db);

    while let Ok(file) = files.recv() {
        debug!(%file, "parsing");
        match parser.parse(&file) {
            Ok(unit) => {
                if done.blocking_send(unit).is_err() {
                    break;
                }
            }
            Err(err) => warn!(%file, "dropping file: {err:#}"),
        }
    }
}
