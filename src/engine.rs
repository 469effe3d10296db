//! The indexing engine.
//!
//! One reconcile task multiplexes every event source — completed parses,
//! filesystem notifications, walker output, periodic flush ticks, and
//! client connections — and is the only code that mutates the symbol store.
//! Parsing happens on a pool of OS threads that may block inside libclang;
//! they communicate exclusively through bounded channels, so a saturated
//! pool backpressures the feeders instead of growing queues.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::compile_args::CompileArgsDb;
use crate::ipc::IpcListener;
use crate::parser;
use crate::paths::{self, FileKind};
use crate::protocol::{self, methods, MessageCodec, RpcRequest, RpcResponse};
use crate::query;
use crate::record::ParsedUnit;
use crate::store::{StoreError, SymbolStore};
use crate::walker;
use crate::watcher::{FsEvent, FsOp, WatchHandle};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the persistent store.
    pub db_dir: PathBuf,
    /// Unix socket queries are served on.
    pub socket_path: PathBuf,
    /// Directories to index.
    pub roots: Vec<PathBuf>,
    /// Parser worker count.
    pub num_workers: usize,
    /// Cadence of the store flush, and the hotness horizon of its cache.
    pub flush_interval: Duration,
    /// Files under these prefixes are re-checked rather than dropped when
    /// the walk no longer reports them.
    pub sys_include_prefixes: Vec<String>,
    /// Log and discard parses that lost a scheduling race instead of
    /// treating them as a fatal bookkeeping bug.
    pub tolerate_stale: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            db_dir: PathBuf::from(".navc_dbsymbols"),
            socket_path: PathBuf::from(".navc.sock"),
            roots: vec![PathBuf::from(".")],
            num_workers: num_cpus::get(),
            flush_interval: Duration::from_secs(10),
            sys_include_prefixes: vec!["/usr/include/".to_string(), "/usr/lib/".to_string()],
            tolerate_stale: false,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    store: SymbolStore,
    watch: WatchHandle,
    parse_tx: Option<crossbeam_channel::Sender<String>>,
    found_file_tx: mpsc::Sender<String>,
    found_header_tx: mpsc::Sender<String>,
}

impl Engine {
    /// Builds the whole daemon and runs its reconcile loop until SIGINT or
    /// SIGTERM. Returns an error only for startup failures.
    pub async fn run(config: EngineConfig) -> Result<()> {
        let store = SymbolStore::open(&config.db_dir)
            .with_context(|| format!("opening store at {}", config.db_dir.display()))?;
        let args_db = Arc::new(CompileArgsDb::load(&config.roots)?);

        let queue_depth = config.num_workers.max(1);
        let (parse_tx, parse_rx) = crossbeam_channel::bounded::<String>(queue_depth);
        let (done_tx, mut done_rx) = mpsc::channel::<ParsedUnit>(queue_depth);
        let (fs_tx, mut fs_rx) = mpsc::channel::<FsEvent>(256);
        let (found_file_tx, mut found_file_rx) = mpsc::channel::<String>(queue_depth.max(16));
        let (found_header_tx, mut found_header_rx) = mpsc::channel::<String>(queue_depth.max(16));
        let (remove_tx, mut remove_rx) = mpsc::channel::<String>(queue_depth.max(16));
        let (conn_tx, mut conn_rx) = mpsc::channel::<UnixStream>(16);

        let watch = WatchHandle::new(fs_tx)?;

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(config.num_workers);
        for i in 0..config.num_workers {
            let args_db = Arc::clone(&args_db);
            let files = parse_rx.clone();
            let done = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("navcd-parser-{i}"))
                .spawn(move || parser::run_worker(args_db, files, done))?;
            workers.push(handle);
        }
        drop(parse_rx);
        drop(done_tx);
        info!(workers = workers.len(), "parser pool started");

        let listener = IpcListener::bind(&config.socket_path)?;
        info!(socket = %config.socket_path.display(), "serving queries");
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        if conn_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        });

        let mut engine = Engine {
            config,
            store,
            watch,
            parse_tx: Some(parse_tx),
            found_file_tx: found_file_tx.clone(),
            found_header_tx: found_header_tx.clone(),
        };

        engine.spawn_initial_walk(found_file_tx, found_header_tx, remove_tx);

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let mut flush_tick = tokio::time::interval(engine.config.flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_tick.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                Some(unit) = done_rx.recv() => engine.on_parsed(unit),
                Some(event) = fs_rx.recv() => engine.on_fs_event(event),
                Some(path) = found_file_rx.recv() => engine.on_found_file(&path),
                Some(path) = found_header_rx.recv() => engine.on_found_header(&path),
                Some(path) = remove_rx.recv() => engine.on_remove(&path),
                Some(stream) = conn_rx.recv() => engine.on_connection(stream).await,
                _ = flush_tick.tick() => engine.on_flush_tick(),
                _ = sigint.recv() => { info!("interrupt received"); break; }
                _ = sigterm.recv() => { info!("termination requested"); break; }
            }
        }

        engine.shutdown(done_rx, workers, accept_task).await
    }

    /// Walks the roots, registering directories with the watcher and
    /// reporting candidates back to the reconcile loop. Files known to the
    /// store but absent from the walk are either re-checked (system include
    /// trees) or removed.
    fn spawn_initial_walk(
        &self,
        found_file: mpsc::Sender<String>,
        found_header: mpsc::Sender<String>,
        remove: mpsc::Sender<String>,
    ) {
        let mut unseen = self.store.files_on_disk();
        let roots = self.config.roots.clone();
        let sys_prefixes = self.config.sys_include_prefixes.clone();
        let watch = self.watch.clone();

        tokio::task::spawn_blocking(move || {
            for root in &roots {
                walker::walk(
                    root,
                    |dir| {
                        if let Err(err) = watch.watch_dir(dir) {
                            warn!(dir = %dir.display(), "cannot watch: {err}");
                        }
                    },
                    |file, kind| {
                        let path = paths::clean(&file.to_string_lossy());
                        if kind == FileKind::CSource {
                            unseen.remove(&path);
                            let _ = found_file.blocking_send(path);
                        } else if unseen.remove(&path) {
                            let _ = found_header.blocking_send(path);
                        }
                    },
                );
            }

            for path in unseen {
                if sys_prefixes.iter().any(|prefix| path.starts_with(prefix)) {
                    let _ = found_header.blocking_send(path);
                } else {
                    let _ = remove.blocking_send(path);
                }
            }

            debug!("initial walk complete");
        });
    }

    /// Hands files to the parser pool without ever blocking the reconcile
    /// loop: the bounded queue is fed from a detached task.
    fn queue_parse(&self, files: Vec<String>) {
        if files.is_empty() {
            return;
        }
        let Some(tx) = self.parse_tx.clone() else {
            return;
        };
        tokio::task::spawn_blocking(move || {
            for file in files {
                if tx.send(file).is_err() {
                    break;
                }
            }
        });
    }

    fn on_parsed(&mut self, unit: ParsedUnit) {
        let file = unit.record.file.clone();
        match self.store.insert_tur(unit) {
            Ok(()) => debug!(%file, "record installed"),
            Err(err @ StoreError::StaleParse { .. }) => {
                if self.config.tolerate_stale {
                    warn!("{err}, discarding");
                } else {
                    panic!("{err}");
                }
            }
            Err(err) => error!(%file, "failed to install record: {err}"),
        }
    }

    fn on_fs_event(&mut self, event: FsEvent) {
        if paths::is_hidden(&event.path) {
            return;
        }
        let path = paths::clean(&event.path.to_string_lossy());

        match std::fs::metadata(&event.path) {
            Ok(meta) if meta.is_dir() => self.on_dir_event(&event),
            Ok(_) => self.on_file_event(&path, event.op),
            // The path is gone (the usual case for remove and rename) or
            // unreadable; classify by name alone.
            Err(_) => match paths::classify(Path::new(&path)) {
                FileKind::CSource | FileKind::Header => self.on_file_event(&path, event.op),
                FileKind::Other => {
                    let _ = self.watch.unwatch(&event.path);
                }
            },
        }
    }

    fn on_dir_event(&mut self, event: &FsEvent) {
        match event.op {
            FsOp::Create => {
                debug!(dir = %event.path.display(), "new directory");
                let watch = self.watch.clone();
                let found_file = self.found_file_tx.clone();
                let found_header = self.found_header_tx.clone();
                let root = event.path.clone();
                tokio::task::spawn_blocking(move || {
                    walker::walk(
                        &root,
                        |dir| {
                            if let Err(err) = watch.watch_dir(dir) {
                                warn!(dir = %dir.display(), "cannot watch: {err}");
                            }
                        },
                        |file, kind| {
                            let path = paths::clean(&file.to_string_lossy());
                            match kind {
                                FileKind::CSource => {
                                    let _ = found_file.blocking_send(path);
                                }
                                FileKind::Header => {
                                    let _ = found_header.blocking_send(path);
                                }
                                FileKind::Other => {}
                            }
                        },
                    );
                });
            }
            FsOp::Remove | FsOp::Rename => {
                let _ = self.watch.unwatch(&event.path);
            }
            FsOp::Write | FsOp::Chmod => {}
        }
    }

    fn on_file_event(&mut self, path: &str, op: FsOp) {
        match paths::classify(Path::new(path)) {
            FileKind::CSource => match op {
                FsOp::Create | FsOp::Write => self.queue_parse(vec![path.to_string()]),
                FsOp::Remove | FsOp::Rename => self.on_remove(path),
                FsOp::Chmod => {}
            },
            FileKind::Header => self.on_header_event(path, op),
            FileKind::Other => {}
        }
    }

    fn on_header_event(&mut self, path: &str, op: FsOp) {
        if matches!(op, FsOp::Create | FsOp::Write) {
            // A header appearing on disk may satisfy includes that failed
            // to resolve earlier; reparse those includers so they attach to
            // the real file.
            let phantom = paths::phantom_name(path);
            if self.store.has_record(&phantom) {
                info!(header = %path, "previously unresolved header materialised");
                self.invalidate_header(&phantom);
            }
        }

        match op {
            FsOp::Create | FsOp::Write => match self.store.uptodate(path) {
                Ok((true, false)) => self.invalidate_header(path),
                Ok(_) => {}
                Err(err) => debug!(%path, "skipping header event: {err}"),
            },
            FsOp::Remove | FsOp::Rename => {
                if self.store.has_record(path) {
                    self.invalidate_header(path);
                }
            }
            FsOp::Chmod => {}
        }
    }

    fn on_found_file(&mut self, path: &str) {
        match self.store.uptodate(path) {
            Ok((exists, current)) if exists && current => {}
            Ok(_) => self.queue_parse(vec![path.to_string()]),
            Err(err) => debug!(%path, "skipping found file: {err}"),
        }
    }

    fn on_found_header(&mut self, path: &str) {
        match self.store.uptodate(path) {
            Ok((true, false)) => self.invalidate_header(path),
            Ok(_) => {}
            Err(err) => debug!(%path, "skipping found header: {err}"),
        }
    }

    /// Drops every TU that includes `path` and queues them for reparse.
    fn invalidate_header(&mut self, path: &str) {
        match self.store.remove_dependents(path) {
            Ok(deps) if deps.is_empty() => {}
            Ok(deps) => {
                info!(header = %path, includers = deps.len(), "header changed, reparsing includers");
                self.queue_parse(deps);
            }
            Err(err) => error!(header = %path, "header fan-out failed: {err}"),
        }
    }

    fn on_remove(&mut self, path: &str) {
        match self.store.remove(path) {
            Ok(true) => debug!(%path, "record removed"),
            Ok(false) => {}
            Err(err) => error!(%path, "remove failed: {err}"),
        }
    }

    fn on_flush_tick(&mut self) {
        let cutoff = Instant::now()
            .checked_sub(self.config.flush_interval)
            .unwrap_or_else(Instant::now);
        if let Err(err) = self.store.flush(cutoff) {
            error!("store flush failed: {err}");
        }
    }

    /// Serves one request on a freshly accepted connection. Queries run
    /// inline on the reconcile task, which is what keeps reads and writes
    /// serialised against each other.
    async fn on_connection(&mut self, mut stream: UnixStream) {
        let request = match protocol::read_frame(&mut stream).await {
            Ok(frame) => match MessageCodec::decode_request(&frame) {
                Ok(request) => request,
                Err(err) => {
                    warn!("undecodable request: {err}");
                    return;
                }
            },
            Err(err) => {
                debug!("client read failed: {err}");
                return;
            }
        };

        let response = self.dispatch(request);
        match MessageCodec::encode_response(&response) {
            Ok(frame) => {
                if let Err(err) = protocol::write_frame(&mut stream, &frame).await {
                    debug!("client write failed: {err}");
                }
            }
            Err(err) => error!("response encoding failed: {err}"),
        }
    }

    fn dispatch(&mut self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        let Some(loc) = request.params.first() else {
            return RpcResponse::failure(id, "missing position parameter");
        };

        let result = match request.method.as_str() {
            methods::GET_SYMBOL_DECLS => query::decls_at(&mut self.store, loc),
            methods::GET_SYMBOL_USES => query::uses_at(&mut self.store, loc),
            methods::GET_SYMBOL_DEF => query::def_at(&mut self.store, loc),
            other => return RpcResponse::failure(id, format!("unknown method: {other}")),
        };

        match result {
            Ok(locs) => RpcResponse::success(id, locs),
            Err(err) => RpcResponse::failure(id, err.to_string()),
        }
    }

    /// Ordered teardown: close the parse queue, drain completed parses,
    /// stop the watcher and listener, then flush everything to disk.
    async fn shutdown(
        mut self,
        mut done_rx: mpsc::Receiver<ParsedUnit>,
        workers: Vec<JoinHandle<()>>,
        accept_task: tokio::task::JoinHandle<()>,
    ) -> Result<()> {
        info!("shutting down");

        self.parse_tx = None;
        while let Some(unit) = done_rx.recv().await {
            self.on_parsed(unit);
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("a parser worker panicked");
            }
        }

        drop(self.watch);
        accept_task.abort();
        let _ = accept_task.await;

        self.store.flush(Instant::now())?;
        info!("shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_published_surface() {
        let config = EngineConfig::default();
        assert_eq!(config.db_dir, PathBuf::from(".navc_dbsymbols"));
        assert_eq!(config.socket_path, PathBuf::from(".navc.sock"));
        assert_eq!(config.roots, vec![PathBuf::from(".")]);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(
            config.sys_include_prefixes,
            vec!["/usr/include/".to_string(), "/usr/lib/".to_string()]
        );
        assert!(!config.tolerate_stale);
        assert!(config.num_workers >= 1);
    }
}
