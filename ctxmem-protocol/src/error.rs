//! Protocol error types and their wire codes.

use serde_json::{Value, json};
use thiserror::Error;

use ctxmem_core::{CtxMemError, ErrorKind};

use crate::types::RpcError;

/// Malformed JSON.
pub const PARSE_ERROR: i32 = -32700;
/// Valid JSON that is not a request envelope.
pub const INVALID_REQUEST: i32 = -32600;
/// Unknown method name.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Parameters that do not fit the method.
pub const INVALID_PARAMS: i32 = -32602;
/// Result could not be encoded.
pub const INTERNAL_ERROR: i32 = -32603;

/// Errors surfaced to protocol callers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Input was not JSON.
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON that is not a request envelope.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown method.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Parameters did not deserialize.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The store rejected the call.
    #[error(transparent)]
    Store(#[from] CtxMemError),

    /// Result encoding failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Wire code. Store errors map to `-32001..=-32005` by kind.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::Store(e) => kind_code(e.kind()),
        }
    }

    /// `data` payload; `None` for envelope-level errors.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        let Self::Store(e) = self else {
            return None;
        };
        let mut data = json!({ "kind": e.kind().as_str() });
        if let CtxMemError::StorageFailure {
            backend, succeeded, ..
        } = e
        {
            data["backend"] = json!(backend);
            data["succeeded"] = json!(succeeded);
        }
        Some(data)
    }

    /// Wire representation.
    #[must_use]
    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data: self.data(),
        }
    }
}

/// Code for a store error kind.
#[must_use]
pub const fn kind_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::NotFound => -32001,
        ErrorKind::AlreadyInitialized => -32002,
        ErrorKind::NotInitialized => -32003,
        ErrorKind::StorageFailure => -32004,
        ErrorKind::ValidationFailure => -32005,
    }
}
