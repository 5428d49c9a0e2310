//! Maps request envelopes onto a [`MemoryStore`].

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use ctxmem_core::MemoryStore;

use crate::error::{INTERNAL_ERROR, ProtocolError};
use crate::types::{
    DeleteParams, DeleteResult, Method, Request, RequestId, Response, RetrieveParams,
    RetrieveResult, SessionCloseParams, SessionCloseResult, SessionCreateParams,
    SessionCreateResult, StoreParams, StoreResult, UpdateParams, UpdateResult,
};

/// Serves protocol requests against one shared store.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    store: Arc<MemoryStore>,
    request_threshold: f64,
}

impl RequestHandler {
    /// Handler using the store's configured request threshold for
    /// retrieve calls that carry none.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        let request_threshold = store.config().retrieval.request_threshold;
        Self {
            store,
            request_threshold,
        }
    }

    /// Override the retrieve threshold default.
    #[must_use]
    pub fn with_request_threshold(mut self, threshold: f64) -> Self {
        self.request_threshold = threshold;
        self
    }

    /// The store behind this handler.
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Handle one raw JSON request and return the JSON response.
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match parse_request(raw) {
            Ok(request) => self.handle(request).await,
            Err((id, e)) => {
                debug!(error = %e, "Rejected request envelope");
                Response::failure(id, e.to_rpc())
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            warn!(error = %e, "Response encoding failed");
            format!(
                r#"{{"id":null,"error":{{"code":{INTERNAL_ERROR},"message":"response encoding failed"}}}}"#
            )
        })
    }

    /// Handle one parsed request.
    pub async fn handle(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        debug!(request = %id, %method, "Handling request");
        match self.dispatch(&method, params).await {
            Ok(result) => Response::success(Some(id), result),
            Err(e) => {
                debug!(request = %id, %method, code = e.code(), error = %e, "Request failed");
                Response::failure(Some(id), e.to_rpc())
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        let method =
            Method::from_wire(method).ok_or_else(|| ProtocolError::MethodNotFound(method.into()))?;
        let store = &self.store;

        match method {
            Method::SessionCreate => {
                let p: SessionCreateParams = parse_params(params)?;
                let session_id = store.create_session(p.user_id, p.agent_id);
                encode(&SessionCreateResult { session_id })
            }
            Method::SessionClose => {
                let p: SessionCloseParams = parse_params(params)?;
                store.close_session(p.session_id)?;
                encode(&SessionCloseResult {
                    session_id: p.session_id,
                    closed: true,
                })
            }
            Method::MemoryStore => {
                let p: StoreParams = parse_params(params)?;
                let memory_id = store
                    .store(p.text, p.memory_type, p.session_id, p.options)
                    .await?;
                encode(&StoreResult { memory_id })
            }
            Method::MemoryRetrieve => {
                let mut p: RetrieveParams = parse_params(params)?;
                if p.options.threshold.is_none() {
                    p.options.threshold = Some(self.request_threshold);
                }
                let result = store.retrieve(p.query, p.session_id, p.options).await?;
                encode(&RetrieveResult {
                    took_ms: result.took.as_secs_f64() * 1000.0,
                    total_count: result.total_count,
                    memories: result.memories,
                })
            }
            Method::MemoryUpdate => {
                let p: UpdateParams = parse_params(params)?;
                let memory = store.update(p.memory_id, p.patch, p.session_id).await?;
                encode(&UpdateResult { memory })
            }
            Method::MemoryDelete => {
                let p: DeleteParams = parse_params(params)?;
                store.delete(p.memory_id, p.session_id).await?;
                encode(&DeleteResult {
                    memory_id: p.memory_id,
                    deleted: true,
                })
            }
        }
    }
}

/// Parse an envelope, recovering the id when only the rest is malformed.
fn parse_request(raw: &str) -> Result<Request, (Option<RequestId>, ProtocolError)> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| (None, ProtocolError::Parse(e.to_string())))?;
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
    serde_json::from_value(value).map_err(|e| (id, ProtocolError::InvalidRequest(e.to_string())))
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ProtocolError> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

fn encode<T: Serialize>(result: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(result).map_err(|e| ProtocolError::Internal(e.to_string()))
}
