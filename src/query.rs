//! Read-side resolution of decl/def/uses queries.
//!
//! A position names a file and a 1-based line/column. When the file is a
//! header, any of its includers serves as the resolution context: header
//! symbols are recorded in the including TU's view, and symbol ids are USR
//! digests, so every context names the same symbol. Cross-TU answers are
//! assembled by walking the includer sets of the headers that declare the
//! symbol; the file digest is the only reference between records, and every
//! hop goes back through the store.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::ids::FileId;
use crate::record::{SymbolData, SymbolLoc, SymbolLocReq, TuRecord};
use crate::store::{StoreError, SymbolStore};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Symbol use not found")]
    SymbolNotFound,

    #[error("Definition not found")]
    DefinitionNotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Context {
    record: Arc<TuRecord>,
    file: FileId,
}

/// Declarations of the symbol at `req`.
pub fn decls_at(
    store: &mut SymbolStore,
    req: &SymbolLocReq,
) -> Result<Vec<SymbolLocReq>, QueryError> {
    let (loc, ctx) = resolve_context(store, req, QueryError::SymbolNotFound)?;
    let data = data_at(&ctx, &loc).ok_or(QueryError::SymbolNotFound)?;

    Ok(data
        .decls
        .iter()
        .filter_map(|decl| to_req(store, decl))
        .collect())
}

/// All uses of the symbol at `req`, unioned across every TU that includes a
/// header declaring it, deduplicated by location.
pub fn uses_at(store: &mut SymbolStore, req: &SymbolLocReq) -> Result<Vec<SymbolLocReq>, QueryError> {
    let (loc, ctx) = resolve_context(store, req, QueryError::SymbolNotFound)?;
    let id = *ctx
        .record
        .sym_loc
        .get(&loc)
        .ok_or(QueryError::SymbolNotFound)?;
    let data = ctx
        .record
        .sym_data
        .get(&id)
        .ok_or(QueryError::SymbolNotFound)?;

    let mut seen: HashSet<SymbolLoc> = data.uses.iter().map(|u| u.loc).collect();

    for decl in &data.decls {
        if decl.file == ctx.file {
            continue;
        }
        let Some(header) = store.load(decl.file)? else {
            continue;
        };
        for &other in &header.includers {
            if other == ctx.file {
                continue;
            }
            let Some(other_record) = store.load(other)? else {
                continue;
            };
            if let Some(other_data) = other_record.sym_data.get(&id) {
                seen.extend(other_data.uses.iter().map(|u| u.loc));
            }
        }
    }

    Ok(seen.iter().filter_map(|loc| to_req(store, loc)).collect())
}

/// The definition of the symbol at `req`: the context TU's own if it has
/// one, otherwise the first definition found among the other includers of a
/// declaring header.
pub fn def_at(store: &mut SymbolStore, req: &SymbolLocReq) -> Result<Vec<SymbolLocReq>, QueryError> {
    let (loc, ctx) = resolve_context(store, req, QueryError::DefinitionNotFound)?;
    let id = *ctx
        .record
        .sym_loc
        .get(&loc)
        .ok_or(QueryError::DefinitionNotFound)?;
    let data = ctx
        .record
        .sym_data
        .get(&id)
        .ok_or(QueryError::DefinitionNotFound)?;

    if let Some(def) = data.def {
        let req = to_req(store, &def).ok_or(QueryError::DefinitionNotFound)?;
        return Ok(vec![req]);
    }

    for decl in &data.decls {
        if decl.file == ctx.file {
            continue;
        }
        let Some(header) = store.load(decl.file)? else {
            continue;
        };
        for &other in &header.includers {
            if other == ctx.file {
                continue;
            }
            let Some(other_record) = store.load(other)? else {
                continue;
            };
            if let Some(def) = other_record.sym_data.get(&id).and_then(|d| d.def) {
                if let Some(req) = to_req(store, &def) {
                    return Ok(vec![req]);
                }
            }
        }
    }

    Err(QueryError::DefinitionNotFound)
}

fn resolve_context(
    store: &mut SymbolStore,
    req: &SymbolLocReq,
    miss: QueryError,
) -> Result<(SymbolLoc, Context), QueryError> {
    let Some(loc) = SymbolLoc::from_req(req) else {
        return Err(miss);
    };
    let Some(record) = store.load(loc.file)? else {
        return Err(miss);
    };

    if record.includers.is_empty() {
        return Ok((
            loc,
            Context {
                record,
                file: loc.file,
            },
        ));
    }

    // Header: any includer works as context.
    for &includer in &record.includers {
        if let Some(ctx_record) = store.load(includer)? {
            return Ok((
                loc,
                Context {
                    record: ctx_record,
                    file: includer,
                },
            ));
        }
    }

    Err(miss)
}

fn data_at<'a>(ctx: &'a Context, loc: &SymbolLoc) -> Option<&'a SymbolData> {
    let id = ctx.record.sym_loc.get(loc)?;
    ctx.record.sym_data.get(id)
}

fn to_req(store: &SymbolStore, loc: &SymbolLoc) -> Option<SymbolLocReq> {
    let path = store.path_of(loc.file)?;
    Some(SymbolLocReq::new(
        path,
        i32::from(loc.line),
        i32::from(loc.col),
    ))
}
