//! Per-translation-unit symbol records.
//!
//! A [`TuRecord`] captures everything one parse of a file produced: the
//! symbol graph observed inside the TU, the headers the preprocessor
//! reached, and (for header records) the set of compiled TUs that include
//! it. Records are immutable once a worker hands them over; only the
//! engine's reconcile step mutates stored copies, and only through the
//! store's insert/remove protocols.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ids::{FileId, SymbolId};
use crate::paths;

/// A fixed-width source position: file identity plus 1-based line/column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolLoc {
    pub file: FileId,
    pub line: i16,
    pub col: i16,
}

impl SymbolLoc {
    /// Builds a location, rejecting out-of-range coordinates. Lines and
    /// columns are 1-based; zero, negative, and >i16::MAX values are
    /// invalid.
    pub fn new(file: FileId, line: i32, col: i32) -> Option<Self> {
        let line = i16::try_from(line).ok().filter(|l| *l > 0)?;
        let col = i16::try_from(col).ok().filter(|c| *c > 0)?;
        Some(SymbolLoc { file, line, col })
    }

    pub fn from_req(req: &SymbolLocReq) -> Option<Self> {
        SymbolLoc::new(FileId::for_path(&req.file), req.line, req.col)
    }
}

/// The boundary form of a source position used on the wire and at the
/// parser seam: a path instead of a digest. `Col` is 1-based, matching the
/// analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolLocReq {
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "Line")]
    pub line: i32,
    #[serde(rename = "Col")]
    pub col: i32,
}

impl SymbolLocReq {
    pub fn new(file: impl Into<String>, line: i32, col: i32) -> Self {
        SymbolLocReq {
            file: file.into(),
            line,
            col,
        }
    }
}

/// One occurrence of a symbol being used. `func_call` is sticky: a location
/// that is both a call expression and a reference keeps `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolUse {
    pub loc: SymbolLoc,
    pub func_call: bool,
}

/// Everything a TU knows about one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolData {
    pub name: String,
    pub decls: Vec<SymbolLoc>,
    pub uses: Vec<SymbolUse>,
    pub def: Option<SymbolLoc>,
}

/// A symbol occurrence as extracted from a cursor: spelling, USR, and the
/// position of the occurrence.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub usr: String,
    pub loc: SymbolLocReq,
}

/// The record of one parsed translation unit, or of one header reached by a
/// parse. Serialized whole; replaced whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuRecord {
    /// Cleaned path of the file this record covers.
    pub file: String,
    /// Modification time captured at parse. `UNIX_EPOCH` marks a phantom
    /// header that had no on-disk file.
    pub mtime: SystemTime,
    /// Every header transitively reached during the parse, with the mtime
    /// observed for it.
    pub headers: HashMap<FileId, SystemTime>,
    /// Every symbol occurrence inside this TU's files.
    pub sym_loc: HashMap<SymbolLoc, SymbolId>,
    /// The symbol graph for this TU.
    pub sym_data: HashMap<SymbolId, SymbolData>,
    /// For header records: the compiled TUs that include this header.
    pub includers: HashSet<FileId>,

    /// Header paths seen during the parse, keyed back to their observed
    /// mtimes. Carried from parser to insertion only; never persisted.
    #[serde(skip)]
    pub header_paths: HashMap<String, SystemTime>,
}

impl Default for TuRecord {
    fn default() -> Self {
        TuRecord {
            file: String::new(),
            mtime: SystemTime::UNIX_EPOCH,
            headers: HashMap::new(),
            sym_loc: HashMap::new(),
            sym_data: HashMap::new(),
            includers: HashSet::new(),
            header_paths: HashMap::new(),
        }
    }
}

impl TuRecord {
    pub fn new(file: impl Into<String>, mtime: SystemTime) -> Self {
        TuRecord {
            file: file.into(),
            mtime,
            ..Default::default()
        }
    }

    /// True for records of headers the analyzer could not resolve.
    pub fn is_phantom(&self) -> bool {
        self.mtime == SystemTime::UNIX_EPOCH
    }

    pub fn insert_decl(&mut self, sym: &SymbolInfo) {
        self.insert_decl_inner(sym, None);
    }

    pub fn insert_decl_with_def(&mut self, sym: &SymbolInfo, def: &SymbolInfo) {
        self.insert_decl_inner(sym, Some(def));
    }

    fn insert_decl_inner(&mut self, sym: &SymbolInfo, def: Option<&SymbolInfo>) {
        let Some(loc) = SymbolLoc::from_req(&sym.loc) else {
            return;
        };
        let id = SymbolId::for_usr(&sym.usr);

        let data = self.data_for(id, &sym.name);
        data.decls.push(loc);
        if let Some(def) = def {
            if let Some(def_loc) = SymbolLoc::from_req(&def.loc) {
                data.def = Some(def_loc);
            }
        }

        self.sym_loc.insert(loc, id);
    }

    /// Records a use of the symbol declared with `decl_usr` at `sym`'s
    /// location.
    ///
    /// Two occurrences can land on the same location. If they resolve to
    /// different symbols the later one is dropped (a macro expanded there;
    /// keeping the first is the conservative choice). If the same symbol is
    /// seen again at the location of its latest use, the `func_call` flags
    /// are merged instead of recording a duplicate.
    pub fn insert_use(&mut self, sym: &SymbolInfo, decl_usr: &str, func_call: bool) {
        let Some(loc) = SymbolLoc::from_req(&sym.loc) else {
            return;
        };
        let id = SymbolId::for_usr(decl_usr);

        if let Some(&existing) = self.sym_loc.get(&loc) {
            if existing != id {
                debug!(file = %self.file, name = %sym.name, "masked use at occupied location, dropping");
                return;
            }
            if let Some(data) = self.sym_data.get_mut(&id) {
                if let Some(last) = data.uses.last_mut() {
                    if last.loc == loc {
                        last.func_call = last.func_call || func_call;
                        return;
                    }
                }
            }
        }

        let data = self.data_for(id, &sym.name);
        data.uses.push(SymbolUse { loc, func_call });
        self.sym_loc.insert(loc, id);
    }

    /// Records a header reached by the preprocessor. `resolved` carries the
    /// on-disk path and mtime when the analyzer found the file; `None`
    /// produces a phantom entry under a synthetic name so the includer
    /// relationship survives until the header materialises.
    pub fn insert_header(&mut self, include_spelling: &str, resolved: Option<(&str, SystemTime)>) {
        let (path, mtime) = match resolved {
            Some((path, mtime)) => (paths::clean(path), mtime),
            None => (paths::phantom_name(include_spelling), SystemTime::UNIX_EPOCH),
        };

        self.headers.insert(FileId::for_path(&path), mtime);
        self.header_paths.insert(path, mtime);
    }

    fn data_for(&mut self, id: SymbolId, name: &str) -> &mut SymbolData {
        self.sym_data.entry(id).or_insert_with(|| SymbolData {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Checks that every entry in `sym_loc` is backed by a decl, def, or use
    /// in the symbol data, and every recorded use is reachable from
    /// `sym_loc`.
    pub fn locations_consistent(&self) -> bool {
        for (loc, id) in &self.sym_loc {
            let Some(data) = self.sym_data.get(id) else {
                return false;
            };
            let covered = data.decls.contains(loc)
                || data.def.as_ref() == Some(loc)
                || data.uses.iter().any(|u| u.loc == *loc);
            if !covered {
                return false;
            }
        }
        self.sym_data
            .values()
            .flat_map(|d| d.uses.iter())
            .all(|u| self.sym_loc.contains_key(&u.loc))
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// A completed parse: the record plus its serialised form, encoded on the
/// worker thread so the reconcile task installs bytes it never has to
/// produce itself.
#[derive(Debug)]
pub struct ParsedUnit {
    pub record: TuRecord,
    pub encoded: Vec<u8>,
}

impl ParsedUnit {
    pub fn new(record: TuRecord) -> bincode::Result<Self> {
        let encoded = record.to_bytes()?;
        Ok(ParsedUnit { record, encoded })
    }
}
