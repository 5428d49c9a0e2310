//! # ctxmem-protocol: request envelope for the memory store
//!
//! A thin message layer over [`ctxmem_core::MemoryStore`]. Requests are
//! `{id, method, params}`; responses are `{id, result}` or
//! `{id, error: {code, message, data}}`.
//!
//! | method            | params                                      |
//! |-------------------|---------------------------------------------|
//! | `session/create`  | `user_id?`, `agent_id?`                     |
//! | `session/close`   | `session_id`                                |
//! | `memory/store`    | `session_id`, `text`, `memory_type`, options |
//! | `memory/retrieve` | `session_id`, `query`, filters and paging   |
//! | `memory/update`   | `session_id`, `memory_id`, patch            |
//! | `memory/delete`   | `session_id`, `memory_id`                   |
//!
//! Envelope errors use the JSON-RPC codes (`-32700`, `-32600`, `-32601`,
//! `-32602`). Store errors use `-32001..=-32005` and carry their kind in
//! `data.kind`. A retrieve without a threshold gets the configured request
//! threshold, which is stricter than the store's own default.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handler;
pub mod types;

pub use error::ProtocolError;
pub use handler::RequestHandler;
pub use types::{Method, Request, RequestId, Response, RpcError};
