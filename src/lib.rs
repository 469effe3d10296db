//! navcd - a C source indexing daemon.
//!
//! The daemon watches one or more source roots, parses every translation
//! unit through libclang, and keeps a persistent symbol index keyed by file
//! identity. Editor clients connect over a unix socket and ask three
//! questions about a source position: where is this symbol declared, where
//! is it defined, and where is it used.
//!
//! The two central pieces are the symbol store ([`store::SymbolStore`]),
//! which owns the per-TU records and the header includer graph, and the
//! indexing engine ([`engine::Engine`]), a single reconcile loop that
//! multiplexes parser results, filesystem events, walker output, flush
//! ticks, and client connections.

pub mod compile_args;
pub mod engine;
pub mod ids;
pub mod ipc;
pub mod parser;
pub mod paths;
pub mod protocol;
pub mod query;
pub mod record;
pub mod store;
pub mod walker;
pub mod watcher;

pub use compile_args::CompileArgsDb;
pub use engine::{Engine, EngineConfig};
pub use ids::{FileId, SymbolId};
pub use protocol::{MessageCodec, RpcRequest, RpcResponse};
pub use record::{ParsedUnit, SymbolData, SymbolInfo, SymbolLoc, SymbolLocReq, SymbolUse, TuRecord};
pub use store::{StoreError, SymbolStore};
