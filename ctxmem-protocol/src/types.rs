//! Envelope and parameter types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ctxmem_core::{
    MemoryId, MemoryPatch, MemoryRecord, MemoryType, QueryOptions, ScoredMemory, SessionId,
    StoreOptions,
};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Caller-chosen request id, echoed in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// `{id, method, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Echoed in the response.
    pub id: RequestId,
    /// Method name, e.g. `memory/store`.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Request for `method` with serialized `params`.
    ///
    /// # Errors
    /// Fails if `params` does not serialize to JSON.
    pub fn new<P: Serialize>(
        id: RequestId,
        method: Method,
        params: &P,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            id,
            method: method.as_str().to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

/// `{id, result}` or `{id, error}`. The id is `null` when the request
/// could not be parsed far enough to read one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request answered.
    pub id: Option<RequestId>,
    /// Method result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    #[must_use]
    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this is an error response.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Structured detail; always carries `kind` for store errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// Methods the handler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `memory/store`
    MemoryStore,
    /// `memory/retrieve`
    MemoryRetrieve,
    /// `memory/update`
    MemoryUpdate,
    /// `memory/delete`
    MemoryDelete,
    /// `session/create`
    SessionCreate,
    /// `session/close`
    SessionClose,
}

impl Method {
    /// Every method.
    pub const ALL: [Self; 6] = [
        Self::MemoryStore,
        Self::MemoryRetrieve,
        Self::MemoryUpdate,
        Self::MemoryDelete,
        Self::SessionCreate,
        Self::SessionClose,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MemoryStore => "memory/store",
            Self::MemoryRetrieve => "memory/retrieve",
            Self::MemoryUpdate => "memory/update",
            Self::MemoryDelete => "memory/delete",
            Self::SessionCreate => "session/create",
            Self::SessionClose => "session/close",
        }
    }

    /// Look up a wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// `memory/store` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreParams {
    /// Issuing session.
    pub session_id: SessionId,
    /// The fact.
    pub text: String,
    /// Semantic category.
    pub memory_type: MemoryType,
    /// Metadata overrides.
    #[serde(flatten)]
    pub options: StoreOptions,
}

/// `memory/retrieve` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveParams {
    /// Issuing session.
    pub session_id: SessionId,
    /// Free-text query.
    #[serde(default)]
    pub query: String,
    /// Filters and paging.
    #[serde(flatten)]
    pub options: QueryOptions,
}

/// `memory/update` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateParams {
    /// Issuing session.
    pub session_id: SessionId,
    /// Record to change.
    pub memory_id: MemoryId,
    /// The changes.
    #[serde(flatten)]
    pub patch: MemoryPatch,
}

/// `memory/delete` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteParams {
    /// Issuing session.
    pub session_id: SessionId,
    /// Record to remove.
    pub memory_id: MemoryId,
}

/// `session/create` parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCreateParams {
    /// Optional end-user id.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Optional agent id.
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// `session/close` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCloseParams {
    /// Session to close.
    pub session_id: SessionId,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// `memory/store` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResult {
    /// Id of the new record.
    pub memory_id: MemoryId,
}

/// `memory/retrieve` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveResult {
    /// The page, best first.
    pub memories: Vec<ScoredMemory>,
    /// Matches before pagination.
    pub total_count: usize,
    /// Search time in milliseconds.
    pub took_ms: f64,
}

/// `memory/update` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// The record after the update.
    pub memory: MemoryRecord,
}

/// `memory/delete` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// The removed record.
    pub memory_id: MemoryId,
    /// Always `true`.
    pub deleted: bool,
}

/// `session/create` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCreateResult {
    /// The new session.
    pub session_id: SessionId,
}

/// `session/close` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCloseResult {
    /// The closed session.
    pub session_id: SessionId,
    /// Always `true`.
    pub closed: bool,
}
