//! # ctxmem core
//!
//! Session-scoped memory store for agent context. Callers open a session,
//! then store, retrieve, update, and delete memory records through one
//! [`MemoryStore`]. Records are routed to storage backends by tier:
//!
//! - **Memory type** says what a record is (episodic, semantic, procedural,
//!   working, archival) and is fixed at creation.
//! - **Storage tier** says where a backend keeps it (main context, external
//!   context, vector store, graph store, temporal store).
//!
//! Routing from type to tiers is configuration. Retrieval merges every
//! eligible backend's matches into one ranked page. Consolidation folds
//! records with the same normalized text into the oldest copy.
//!
//! ## Layout
//!
//! - [`store`]: the facade
//! - [`dispatcher`]: routing and fan-out across backends
//! - [`backend`]: the backend trait plus in-memory and `SQLite` backends
//! - [`retrieval`] / [`consolidation`]: the scoring and merge engines
//! - [`session`] / [`events`]: session contexts and the event channel

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod consolidation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod types;

pub use backend::StorageBackend;
pub use config::CtxMemConfig;
pub use error::{CtxMemError, ErrorKind, Result};
pub use events::StoreEvent;
pub use memory::{MemoryPatch, MemoryRecord, MetadataPatch, StoreOptions};
pub use retrieval::{MemoryQuery, MemorySearchResult, ScoredMemory};
pub use store::{MemoryStore, QueryOptions};
pub use types::*;
