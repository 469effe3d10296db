//! The persistent symbol store.
//!
//! A sled database maps `FileId` keys to bincode-encoded [`TuRecord`] blobs;
//! replacing one key is atomic, which is exactly the crash-consistency
//! granularity the index needs. On top of the database sits a slot cache
//! holding decoded records, their path/mtime metadata, and a dirty flag for
//! writes deferred to the next flush tick.
//!
//! Every record on disk has a slot; the slot map doubles as the full
//! in-memory index of known files. All mutating calls happen on the engine's
//! reconcile task.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ids::FileId;
use crate::record::{ParsedUnit, TuRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A completed parse is older than the record it tried to replace. The
    /// scheduler never hands out work that can finish in this order, so
    /// seeing it means a bookkeeping bug, not a user condition.
    #[error("stale parse for {file}: the stored record is newer than the parsed one")]
    StaleParse { file: String },

    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("record encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct CacheSlot {
    /// Decoded record; `None` means evicted, reload from the database.
    record: Option<Arc<TuRecord>>,
    mtime: SystemTime,
    path: String,
    last_access: Instant,
    /// Pending write. Implies `record` is present.
    dirty: bool,
}

/// Durable mapping from file identity to TU record, plus the includer-graph
/// maintenance that keeps the header links symmetric.
pub struct SymbolStore {
    db: sled::Db,
    cache: HashMap<FileId, CacheSlot>,
}

impl SymbolStore {
    /// Opens (or creates) the store under `dir` and seeds one cache slot per
    /// record found on disk. Blobs that fail to decode are dropped so their
    /// files get re-parsed.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let db = sled::open(dir)?;
        let mut cache = HashMap::new();
        let now = Instant::now();
        let mut corrupt = Vec::new();

        for entry in db.iter() {
            let (key, value) = entry?;
            let Some(id) = FileId::from_bytes(&key) else {
                warn!("dropping record with malformed key ({} bytes)", key.len());
                corrupt.push(key.to_vec());
                continue;
            };
            match TuRecord::from_bytes(&value) {
                Ok(record) => {
                    cache.insert(
                        id,
                        CacheSlot {
                            record: None,
                            mtime: record.mtime,
                            path: record.file,
                            last_access: now,
                            dirty: false,
                        },
                    );
                }
                Err(err) => {
                    warn!(?id, "dropping corrupt record: {err}");
                    corrupt.push(key.to_vec());
                }
            }
        }

        for key in corrupt {
            db.remove(key)?;
        }

        info!(records = cache.len(), dir = %dir.display(), "symbol store opened");
        Ok(SymbolStore { db, cache })
    }

    /// Number of records currently known.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Whether any record (including phantoms) covers `path`.
    pub fn has_record(&self, path: &str) -> bool {
        self.cache.contains_key(&FileId::for_path(path))
    }

    /// Path recorded for an identifier, from slot metadata alone.
    pub fn path_of(&self, id: FileId) -> Option<&str> {
        self.cache.get(&id).map(|slot| slot.path.as_str())
    }

    /// Loads a record, decoding from the database when the slot was evicted.
    /// Returns `None` for unknown ids and for records whose blob turned out
    /// corrupt (those are deleted on the spot).
    pub fn load(&mut self, id: FileId) -> Result<Option<Arc<TuRecord>>, StoreError> {
        let needs_decode = match self.cache.get_mut(&id) {
            None => return Ok(None),
            Some(slot) => {
                slot.last_access = Instant::now();
                slot.record.is_none()
            }
        };

        if needs_decode {
            let decoded = self
                .db
                .get(id.as_bytes())?
                .and_then(|bytes| match TuRecord::from_bytes(&bytes) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(?id, "corrupt record on disk, treating as absent: {err}");
                        None
                    }
                });
            match decoded {
                Some(record) => {
                    if let Some(slot) = self.cache.get_mut(&id) {
                        slot.record = Some(Arc::new(record));
                    }
                }
                None => {
                    self.db.remove(id.as_bytes())?;
                    self.cache.remove(&id);
                    return Ok(None);
                }
            }
        }

        Ok(self.cache.get(&id).and_then(|slot| slot.record.clone()))
    }

    pub fn load_path(&mut self, path: &str) -> Result<Option<Arc<TuRecord>>, StoreError> {
        self.load(FileId::for_path(path))
    }

    /// Installs a completed parse.
    ///
    /// Rejects parses older than the stored record, removes the previous
    /// record (unlinking its header references), bumps the includer set of
    /// every header the new parse reached (creating fresh or phantom header
    /// records as needed), and finally installs the worker's pre-encoded
    /// blob under the file's key. That last write is the atomic commit
    /// point: a crash before it leaves the old record, a crash after it the
    /// new one.
    pub fn insert_tur(&mut self, unit: ParsedUnit) -> Result<(), StoreError> {
        let record = unit.record;
        let id = FileId::for_path(&record.file);

        if let Some(slot) = self.cache.get(&id) {
            if slot.mtime > record.mtime {
                return Err(StoreError::StaleParse {
                    file: record.file.clone(),
                });
            }
            self.remove_id(id)?;
        }

        for (header_path, header_mtime) in &record.header_paths {
            let hid = FileId::for_path(header_path);
            let updated = self.mutate(hid, |header| {
                header.includers.insert(id);
            })?;
            if !updated {
                let mut header = TuRecord::new(header_path.clone(), *header_mtime);
                header.includers.insert(id);
                self.install_deferred(hid, header);
            }
        }

        self.db.insert(id.as_bytes(), unit.encoded)?;
        self.cache.insert(
            id,
            CacheSlot {
                mtime: record.mtime,
                path: record.file.clone(),
                record: Some(Arc::new(record)),
                last_access: Instant::now(),
                dirty: false,
            },
        );

        Ok(())
    }

    /// Removes a record and unlinks it from the includer set of every header
    /// it mentioned; headers left with no includers are deleted. Returns
    /// false when nothing covered `path`.
    pub fn remove(&mut self, path: &str) -> Result<bool, StoreError> {
        self.remove_id(FileId::for_path(path))
    }

    fn remove_id(&mut self, id: FileId) -> Result<bool, StoreError> {
        let Some(record) = self.load(id)? else {
            return Ok(false);
        };

        let headers: Vec<FileId> = record.headers.keys().copied().collect();
        for hid in headers {
            let mut now_empty = false;
            let known = self.mutate(hid, |header| {
                header.includers.remove(&id);
                now_empty = header.includers.is_empty();
            })?;
            if !known {
                debug!(?hid, "header record missing while unlinking includer");
                continue;
            }
            if now_empty {
                self.delete_id(hid)?;
            }
        }

        self.delete_id(id)?;
        Ok(true)
    }

    /// Removes every compiled TU that includes `path` and returns their
    /// paths so the caller can queue reparses. Removing the last includer
    /// deletes the header record itself. Unknown paths yield an empty list.
    pub fn remove_dependents(&mut self, path: &str) -> Result<Vec<String>, StoreError> {
        let id = FileId::for_path(path);
        let Some(record) = self.load(id)? else {
            return Ok(Vec::new());
        };

        let includers: Vec<FileId> = record.includers.iter().copied().collect();
        let mut files = Vec::with_capacity(includers.len());
        for includer in includers {
            if let Some(p) = self.path_of(includer) {
                files.push(p.to_string());
            }
        }

        for file in &files {
            self.remove(file)?;
        }

        Ok(files)
    }

    /// `(exists, current)` for a file on disk: whether any record covers it,
    /// and whether that record is at least as fresh as the file's mtime.
    pub fn uptodate(&self, path: &str) -> Result<(bool, bool), StoreError> {
        let disk_mtime = fs::metadata(path)?.modified()?;
        match self.cache.get(&FileId::for_path(path)) {
            None => Ok((false, false)),
            Some(slot) => Ok((true, slot.mtime >= disk_mtime)),
        }
    }

    /// Paths of all records that correspond to files on disk. Phantom
    /// headers are excluded.
    pub fn files_on_disk(&self) -> HashSet<String> {
        self.cache
            .values()
            .filter(|slot| slot.mtime != SystemTime::UNIX_EPOCH)
            .map(|slot| slot.path.clone())
            .collect()
    }

    /// Paths of the compiled TUs that include the header at `path`, or
    /// `None` when no record covers it.
    pub fn includers_of(&mut self, path: &str) -> Result<Option<Vec<String>>, StoreError> {
        let Some(record) = self.load_path(path)? else {
            return Ok(None);
        };
        let ids: Vec<FileId> = record.includers.iter().copied().collect();
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.path_of(id) {
                files.push(p.to_string());
            }
        }
        Ok(Some(files))
    }

    /// Writes every dirty slot not accessed since `cutoff` and evicts the
    /// decoded records of all such slots. Hot slots stay decoded. Pass
    /// `Instant::now()` to flush everything (shutdown).
    pub fn flush(&mut self, cutoff: Instant) -> Result<(), StoreError> {
        let mut written = 0usize;
        for (id, slot) in self.cache.iter_mut() {
            if slot.last_access > cutoff {
                continue;
            }
            if slot.dirty {
                if let Some(record) = slot.record.as_ref() {
                    self.db.insert(id.as_bytes(), record.to_bytes()?)?;
                    written += 1;
                }
                slot.dirty = false;
            }
            slot.record = None;
        }
        self.db.flush()?;
        debug!(written, "store flush complete");
        Ok(())
    }

    /// Applies `f` to a loaded record and marks its slot dirty. Returns
    /// false when no record covers `id`.
    fn mutate(
        &mut self,
        id: FileId,
        f: impl FnOnce(&mut TuRecord),
    ) -> Result<bool, StoreError> {
        if self.load(id)?.is_none() {
            return Ok(false);
        }
        if let Some(slot) = self.cache.get_mut(&id) {
            if let Some(record) = slot.record.as_mut() {
                f(Arc::make_mut(record));
                slot.dirty = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Installs a freshly created record with its write deferred to the
    /// next flush.
    fn install_deferred(&mut self, id: FileId, record: TuRecord) {
        self.cache.insert(
            id,
            CacheSlot {
                mtime: record.mtime,
                path: record.file.clone(),
                record: Some(Arc::new(record)),
                last_access: Instant::now(),
                dirty: true,
            },
        );
    }

    fn delete_id(&mut self, id: FileId) -> Result<(), StoreError> {
        self.db.remove(id.as_bytes())?;
        self.cache.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SymbolInfo, SymbolLocReq};
    use std::time::Duration;
    use tempfile::TempDir;

    fn mtime(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn unit_with_header(file: &str, secs: u64, header: &str) -> ParsedUnit {
        let mut record = TuRecord::new(file, mtime(secs));
        let sym = SymbolInfo {
            name: "f".to_string(),
            usr: format!("c:@F@f@{file}"),
            loc: SymbolLocReq::new(file, 1, 1),
        };
        record.insert_decl_with_def(&sym, &sym);
        record.insert_header(header, Some((header, mtime(secs.saturating_sub(10)))));
        ParsedUnit::new(record).unwrap()
    }

    fn plain_unit(file: &str, secs: u64) -> ParsedUnit {
        ParsedUnit::new(TuRecord::new(file, mtime(secs))).unwrap()
    }

    #[test]
    fn insert_links_header_includers() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        store.insert_tur(unit_with_header("a.c", 100, "a.h")).unwrap();
        store.insert_tur(unit_with_header("b.c", 100, "a.h")).unwrap();

        let mut incl = store.includers_of("a.h").unwrap().unwrap();
        incl.sort();
        assert_eq!(incl, vec!["a.c".to_string(), "b.c".to_string()]);
    }

    #[test]
    fn remove_drops_orphaned_headers() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        store.insert_tur(unit_with_header("a.c", 100, "a.h")).unwrap();
        store.insert_tur(unit_with_header("b.c", 100, "a.h")).unwrap();

        assert!(store.remove("a.c").unwrap());
        assert_eq!(
            store.includers_of("a.h").unwrap().unwrap(),
            vec!["b.c".to_string()]
        );

        assert!(store.remove("b.c").unwrap());
        assert!(store.includers_of("a.h").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn stale_insert_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        store.insert_tur(plain_unit("a.c", 150)).unwrap();
        let err = store.insert_tur(plain_unit("a.c", 100)).unwrap_err();
        assert!(matches!(err, StoreError::StaleParse { ref file } if file == "a.c"));

        // The fresher record is untouched.
        let rec = store.load_path("a.c").unwrap().unwrap();
        assert_eq!(rec.mtime, mtime(150));
    }

    #[test]
    fn equal_mtime_reinsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        store.insert_tur(unit_with_header("a.c", 100, "a.h")).unwrap();
        let before_files = store.files_on_disk();
        let before = store.load_path("a.c").unwrap().unwrap();

        store.insert_tur(unit_with_header("a.c", 100, "a.h")).unwrap();
        let after = store.load_path("a.c").unwrap().unwrap();

        assert_eq!(store.files_on_disk(), before_files);
        assert_eq!(before.sym_loc, after.sym_loc);
        assert_eq!(before.sym_data, after.sym_data);
        assert_eq!(
            store.includers_of("a.h").unwrap().unwrap(),
            vec!["a.c".to_string()]
        );
    }

    #[test]
    fn replacement_never_lowers_mtime() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        store.insert_tur(plain_unit("a.c", 100)).unwrap();
        store.insert_tur(plain_unit("a.c", 200)).unwrap();
        let rec = store.load_path("a.c").unwrap().unwrap();
        assert_eq!(rec.mtime, mtime(200));
    }

    #[test]
    fn flush_evicts_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = SymbolStore::open(dir.path()).unwrap();
            store.insert_tur(unit_with_header("a.c", 100, "a.h")).unwrap();
            store.flush(Instant::now()).unwrap();
            // Evicted but still known and reloadable.
            assert!(store.has_record("a.c"));
            assert!(store.load_path("a.c").unwrap().is_some());
        }

        let mut store = SymbolStore::open(dir.path()).unwrap();
        assert!(store.has_record("a.c"));
        assert!(store.has_record("a.h"));
        assert_eq!(
            store.includers_of("a.h").unwrap().unwrap(),
            vec!["a.c".to_string()]
        );
    }

    #[test]
    fn corrupt_blob_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = SymbolStore::open(dir.path()).unwrap();
            store.insert_tur(plain_unit("a.c", 100)).unwrap();
            store.flush(Instant::now()).unwrap();
            // Clobber the stored blob behind the store's back.
            let id = FileId::for_path("a.c");
            store.db.insert(id.as_bytes(), &b"not bincode"[..]).unwrap();
            assert!(store.load_path("a.c").unwrap().is_none());
            assert!(!store.has_record("a.c"));
        }
    }

    #[test]
    fn phantom_headers_are_not_files_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        let mut record = TuRecord::new("a.c", mtime(100));
        record.insert_header("ghost.h", None);
        store.insert_tur(ParsedUnit::new(record).unwrap()).unwrap();

        let files = store.files_on_disk();
        assert!(files.contains("a.c"));
        assert_eq!(files.len(), 1);
        assert!(store.has_record("?ghost.h"));
    }

    #[test]
    fn remove_dependents_returns_and_removes_includers() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        store.insert_tur(unit_with_header("a.c", 100, "a.h")).unwrap();
        store.insert_tur(unit_with_header("b.c", 100, "a.h")).unwrap();

        let mut deps = store.remove_dependents("a.h").unwrap();
        deps.sort();
        assert_eq!(deps, vec!["a.c".to_string(), "b.c".to_string()]);

        // Everything including the header itself is gone.
        assert!(!store.has_record("a.c"));
        assert!(!store.has_record("b.c"));
        assert!(!store.has_record("a.h"));
    }

    #[test]
    fn uptodate_compares_against_disk() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::open(dir.path()).unwrap();

        let file = dir.path().join("x.c");
        fs::write(&file, "int main(void) { return 0; }\n").unwrap();
        let path = file.to_string_lossy().to_string();

        assert_eq!(store.uptodate(&path).unwrap(), (false, false));

        let disk_mtime = fs::metadata(&file).unwrap().modified().unwrap();
        store
            .insert_tur(
                ParsedUnit::new(TuRecord::new(
                    path.clone(),
                    disk_mtime - Duration::from_secs(5),
                ))
                .unwrap(),
            )
            .unwrap();
        assert_eq!(store.uptodate(&path).unwrap(), (true, false));

        store
            .insert_tur(ParsedUnit::new(TuRecord::new(path.clone(), disk_mtime)).unwrap())
            .unwrap();
        assert_eq!(store.uptodate(&path).unwrap(), (true, true));

        assert!(store.uptodate("no/such/file.c").is_err());
    }
}
