//! Store protocol tests over hand-built TU graphs: includer symmetry,
//! orphan cleanup, freshness, idempotence, and cold restarts. No libclang
//! involved; records are constructed the way the parser would build them.

use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime};

use navcd::{FileId, ParsedUnit, SymbolInfo, SymbolLocReq, SymbolStore, TuRecord};
use tempfile::TempDir;

fn mtime(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn sym(file: &str, line: i32, col: i32, name: &str, usr: &str) -> SymbolInfo {
    SymbolInfo {
        name: name.to_string(),
        usr: usr.to_string(),
        loc: SymbolLocReq::new(file, line, col),
    }
}

/// A compiled TU including one header, declaring and defining a handful of
/// its own symbols.
fn compiled_unit(file: &str, header: &str, secs: u64) -> ParsedUnit {
    let mut record = TuRecord::new(file, mtime(secs));
    record.insert_header(header, Some((header, mtime(secs.saturating_sub(10)))));

    for i in 1..=5 {
        let s = sym(file, i * 3, 1, &format!("sym{i}"), &format!("c:@{file}@sym{i}"));
        if i % 3 == 0 {
            record.insert_decl(&s);
        } else {
            record.insert_decl_with_def(&s, &s);
        }
    }

    ParsedUnit::new(record).unwrap()
}

/// Ten headers, each included by ten compiled TUs.
fn build_graph(store: &mut SymbolStore, secs: u64) -> Vec<(String, Vec<String>)> {
    let mut expected = Vec::new();
    for h in 0..10 {
        let header = format!("include/h{h}.h");
        let mut includers = Vec::new();
        for c in 0..10 {
            let file = format!("src/c{h}_{c}.c");
            store
                .insert_tur(compiled_unit(&file, &header, secs))
                .unwrap();
            includers.push(file);
        }
        expected.push((header, includers));
    }
    expected
}

#[test]
fn includer_sets_match_the_inclusion_graph() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();
    let expected = build_graph(&mut store, 100);

    for (header, includers) in &expected {
        let mut got = store.includers_of(header).unwrap().unwrap();
        got.sort();
        let mut want = includers.clone();
        want.sort();
        assert_eq!(&got, &want, "includers of {header}");
    }
}

#[test]
fn header_links_are_symmetric() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();
    let expected = build_graph(&mut store, 100);

    // Forward: every header of a compiled TU knows that TU as an includer.
    for (header, includers) in &expected {
        let header_record = store.load_path(header).unwrap().unwrap();
        for includer in includers {
            assert!(
                header_record.includers.contains(&FileId::for_path(includer)),
                "{header} missing includer {includer}"
            );
        }

        // Backward: every includer of a header lists it among its headers.
        let hid = FileId::for_path(header);
        for includer in includers {
            let record = store.load_path(includer).unwrap().unwrap();
            assert!(
                record.headers.contains_key(&hid),
                "{includer} missing header {header}"
            );
        }
    }
}

#[test]
fn every_stored_location_is_covered_by_symbol_data() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();
    let expected = build_graph(&mut store, 100);

    for (_, includers) in &expected {
        for includer in includers {
            let record = store.load_path(includer).unwrap().unwrap();
            assert!(record.locations_consistent(), "coverage broken in {includer}");
        }
    }
}

#[test]
fn files_on_disk_reports_the_full_graph() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();
    let expected = build_graph(&mut store, 100);

    let mut want = HashSet::new();
    for (header, includers) in &expected {
        want.insert(header.clone());
        want.extend(includers.iter().cloned());
    }
    assert_eq!(store.files_on_disk(), want);
}

#[test]
fn removing_every_includer_removes_the_header() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();
    let expected = build_graph(&mut store, 100);

    for (header, includers) in &expected {
        for includer in includers {
            assert!(store.remove(includer).unwrap());
        }
        assert!(
            store.includers_of(header).unwrap().is_none(),
            "{header} should be gone after its last includer"
        );
    }
    assert!(store.is_empty());
}

#[test]
fn removing_one_includer_keeps_a_shared_header() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();

    store.insert_tur(compiled_unit("a.c", "a.h", 100)).unwrap();
    store.insert_tur(compiled_unit("b.c", "a.h", 100)).unwrap();

    assert!(store.remove("a.c").unwrap());

    assert_eq!(
        store.includers_of("a.h").unwrap().unwrap(),
        vec!["b.c".to_string()]
    );
    let header = store.load_path("a.h").unwrap().unwrap();
    assert_eq!(header.includers.len(), 1);
}

#[test]
fn reinsert_with_equal_mtime_leaves_identical_state() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();

    store.insert_tur(compiled_unit("a.c", "a.h", 100)).unwrap();
    let first = store.load_path("a.c").unwrap().unwrap();
    let first_files = store.files_on_disk();

    store.insert_tur(compiled_unit("a.c", "a.h", 100)).unwrap();
    let second = store.load_path("a.c").unwrap().unwrap();

    assert_eq!(first.sym_loc, second.sym_loc);
    assert_eq!(first.sym_data, second.sym_data);
    assert_eq!(first.headers, second.headers);
    assert_eq!(store.files_on_disk(), first_files);
    assert_eq!(
        store.includers_of("a.h").unwrap().unwrap(),
        vec!["a.c".to_string()]
    );
}

#[test]
fn freshness_is_monotone() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();

    store.insert_tur(compiled_unit("a.c", "a.h", 100)).unwrap();
    store.insert_tur(compiled_unit("a.c", "a.h", 150)).unwrap();
    assert_eq!(store.load_path("a.c").unwrap().unwrap().mtime, mtime(150));

    // An older parse arriving after a newer one is a scheduling fault and
    // must be refused.
    let err = store
        .insert_tur(compiled_unit("a.c", "a.h", 120))
        .unwrap_err();
    assert!(err.to_string().contains("stale parse"));
    assert_eq!(store.load_path("a.c").unwrap().unwrap().mtime, mtime(150));
}

#[test]
fn cold_restart_preserves_the_graph_without_reparses() {
    let dir = TempDir::new().unwrap();
    let tree = TempDir::new().unwrap();

    // Real files so uptodate can stat them after the restart.
    let a_c = tree.path().join("a.c");
    std::fs::write(&a_c, "#include \"a.h\"\n").unwrap();
    let a_c = a_c.to_string_lossy().to_string();
    let disk_mtime = std::fs::metadata(&a_c).unwrap().modified().unwrap();

    {
        let mut store = SymbolStore::open(dir.path()).unwrap();
        let mut record = TuRecord::new(a_c.clone(), disk_mtime);
        record.insert_header("a.h", Some(("a.h", mtime(90))));
        let f = sym(&a_c, 3, 5, "f", "c:@F@f");
        record.insert_decl_with_def(&f, &f);
        store.insert_tur(ParsedUnit::new(record).unwrap()).unwrap();
        store.flush(Instant::now()).unwrap();
    }

    let mut store = SymbolStore::open(dir.path()).unwrap();
    assert_eq!(store.uptodate(&a_c).unwrap(), (true, true));
    assert_eq!(
        store.includers_of("a.h").unwrap().unwrap(),
        vec![a_c.clone()]
    );
    let record = store.load_path(&a_c).unwrap().unwrap();
    assert!(record.locations_consistent());
    assert_eq!(record.sym_data.len(), 1);
}

#[test]
fn header_change_fans_out_to_every_includer() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();

    store.insert_tur(compiled_unit("a.c", "a.h", 100)).unwrap();
    store.insert_tur(compiled_unit("b.c", "a.h", 100)).unwrap();
    store.insert_tur(compiled_unit("c.c", "other.h", 100)).unwrap();

    let mut deps = store.remove_dependents("a.h").unwrap();
    deps.sort();
    assert_eq!(deps, vec!["a.c".to_string(), "b.c".to_string()]);

    // The fan-out removed its own header but left unrelated TUs alone.
    assert!(!store.has_record("a.h"));
    assert!(store.has_record("c.c"));
    assert!(store.has_record("other.h"));

    // Reparses arrive with the new header mtime and rebuild the links.
    store.insert_tur(compiled_unit("a.c", "a.h", 200)).unwrap();
    store.insert_tur(compiled_unit("b.c", "a.h", 200)).unwrap();
    let mut includers = store.includers_of("a.h").unwrap().unwrap();
    includers.sort();
    assert_eq!(includers, vec!["a.c".to_string(), "b.c".to_string()]);
}

#[test]
fn flush_cutoff_keeps_hot_slots_decoded() {
    let dir = TempDir::new().unwrap();
    let mut store = SymbolStore::open(dir.path()).unwrap();

    store.insert_tur(compiled_unit("a.c", "a.h", 100)).unwrap();

    // A cutoff in the past flushes dirty data but evicts nothing recent.
    let old_cutoff = Instant::now()
        .checked_sub(Duration::from_secs(60))
        .unwrap_or_else(Instant::now);
    store.flush(old_cutoff).unwrap();
    assert!(store.has_record("a.c"));
    assert!(store.has_record("a.h"));

    // Shutdown-style flush evicts everything; records stay loadable.
    store.flush(Instant::now()).unwrap();
    let record = store.load_path("a.c").unwrap().unwrap();
    assert_eq!(record.mtime, mtime(100));
}
