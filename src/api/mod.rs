//! HTTP API
//!
//! Routing and the shared pieces the handlers build on: application state,
//! the client-facing error body, and identifier validation. Endpoint
//! handlers live in [`v0`].
//!
//! Handlers never hold a lock across network I/O: all store/resolver/queue
//! work happens inside `spawn_blocking` closures that acquire and release
//! the process-wide locks synchronously.

pub mod v0;

use std::sync::{Arc, Mutex, MutexGuard};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::blueprint::BlueprintError;
use crate::compose::ComposeError;
use crate::config::Config;
use crate::customize::CustomizeError;
use crate::queue::{Queue, QueueError};
use crate::resolver::{ResolverError, ResolverHandle};
use crate::store::{BlueprintStore, StoreError};

/// Characters allowed in path-segment and query-string identifiers.
static VALID_API_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_,.:+*-]+$").expect("valid identifier regex"));

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<Mutex<BlueprintStore>>,
    pub resolver: Arc<Mutex<ResolverHandle>>,
    pub queue: Queue,
}

impl AppState {
    pub fn store(&self) -> MutexGuard<'_, BlueprintStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn resolver(&self) -> MutexGuard<'_, ResolverHandle> {
        self.resolver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One error record in a client-facing error body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorEntry {
    pub id: String,
    pub msg: String,
}

/// A client-facing error: HTTP status plus the stable error identifier.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub id: &'static str,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, id: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            id,
            msg: msg.into(),
        }
    }

    pub fn bad_request(id: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, id, msg)
    }

    pub fn invalid_chars(what: &str) -> Self {
        Self::bad_request("InvalidChars", format!("Invalid characters in {what}"))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
    }

    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            id: self.id.to_string(),
            msg: self.msg.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": false,
            "errors": [ { "id": self.id, "msg": self.msg } ],
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::UnknownBlueprint(_) => Self::bad_request("UnknownBlueprint", err.to_string()),
            StoreError::UnknownCommit(_) => Self::bad_request("UnknownCommit", err.to_string()),
            StoreError::Blueprint(_) => Self::bad_request("BlueprintsError", err.to_string()),
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "BlueprintsError",
                err.to_string(),
            ),
        }
    }
}

impl From<BlueprintError> for ApiError {
    fn from(err: BlueprintError) -> Self {
        Self::bad_request("BlueprintsError", err.to_string())
    }
}

impl From<ResolverError> for ApiError {
    fn from(err: ResolverError) -> Self {
        match &err {
            ResolverError::Projects(_) => Self::bad_request("ProjectsError", err.to_string()),
            ResolverError::UnknownSource(_) => Self::bad_request("UnknownSource", err.to_string()),
            ResolverError::SystemSource(_) => Self::bad_request("SystemSource", err.to_string()),
            ResolverError::InvalidUrl { .. } => Self::bad_request("ProjectsError", err.to_string()),
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ProjectsError",
                err.to_string(),
            ),
        }
    }
}

impl From<ComposeError> for ApiError {
    fn from(err: ComposeError) -> Self {
        match &err {
            ComposeError::BadType(_, _) | ComposeError::DisabledType(_) => {
                Self::bad_request("BadComposeType", err.to_string())
            }
            ComposeError::Store(store) => match store {
                StoreError::UnknownBlueprint(_) => {
                    Self::bad_request("UnknownBlueprint", err.to_string())
                }
                _ => Self::bad_request("BadCompose", err.to_string()),
            },
            ComposeError::Depsolve(_, _) => Self::bad_request("BlueprintsError", err.to_string()),
            ComposeError::BuildFailed(_) => Self::bad_request("BuildFailed", err.to_string()),
            ComposeError::Customize(_) => Self::bad_request("BadCompose", err.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "BadCompose", err.to_string()),
        }
    }
}

impl From<CustomizeError> for ApiError {
    fn from(err: CustomizeError) -> Self {
        Self::bad_request("BadCompose", err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match &err {
            QueueError::UnknownUuid(_) => Self::bad_request("UnknownUUID", err.to_string()),
            QueueError::WrongState { .. } => {
                Self::bad_request("BuildInQueueError", err.to_string())
            }
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                err.to_string(),
            ),
        }
    }
}

/// Validate an identifier from the API path or query string.
pub fn check_chars(value: &str, what: &str) -> Result<(), ApiError> {
    if value.is_empty() || VALID_API_STRING.is_match(value) {
        Ok(())
    } else {
        Err(ApiError::invalid_chars(what))
    }
}

/// Run blocking store/resolver/queue work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("blocking task failed: {e}")))?
}

/// Build the `/api/v0` router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v0/status", get(v0::status))
        .route("/api/v0/blueprints/list", get(v0::blueprints_list))
        .route("/api/v0/blueprints/info/:names", get(v0::blueprints_info))
        .route("/api/v0/blueprints/new", post(v0::blueprints_new))
        .route("/api/v0/blueprints/workspace", post(v0::blueprints_workspace))
        .route(
            "/api/v0/blueprints/workspace/:name",
            delete(v0::blueprints_workspace_delete),
        )
        .route("/api/v0/blueprints/delete/:name", delete(v0::blueprints_delete))
        .route("/api/v0/blueprints/changes/:names", get(v0::blueprints_changes))
        .route("/api/v0/blueprints/undo/:name/:commit", post(v0::blueprints_undo))
        .route("/api/v0/blueprints/tag/:name", post(v0::blueprints_tag))
        .route("/api/v0/blueprints/diff/:name/:from/:to", get(v0::blueprints_diff))
        .route("/api/v0/blueprints/depsolve/:names", get(v0::blueprints_depsolve))
        .route("/api/v0/blueprints/freeze/:names", get(v0::blueprints_freeze))
        .route("/api/v0/projects/list", get(v0::projects_list))
        .route("/api/v0/projects/info/:names", get(v0::projects_info))
        .route("/api/v0/projects/depsolve/:names", get(v0::projects_depsolve))
        .route("/api/v0/projects/source/list", get(v0::sources_list))
        .route("/api/v0/projects/source/info/:ids", get(v0::sources_info))
        .route("/api/v0/projects/source/new", post(v0::sources_new))
        .route("/api/v0/projects/source/delete/:id", delete(v0::sources_delete))
        .route("/api/v0/modules/list", get(v0::modules_list))
        .route("/api/v0/modules/list/:names", get(v0::modules_list_names))
        .route("/api/v0/modules/info/:names", get(v0::modules_info))
        .route("/api/v0/compose", post(v0::compose_start))
        .route("/api/v0/compose/types", get(v0::compose_types))
        .route("/api/v0/compose/queue", get(v0::compose_queue))
        .route("/api/v0/compose/finished", get(v0::compose_finished))
        .route("/api/v0/compose/failed", get(v0::compose_failed))
        .route("/api/v0/compose/status/:uuids", get(v0::compose_status))
        .route("/api/v0/compose/cancel/:uuid", delete(v0::compose_cancel))
        .route("/api/v0/compose/delete/:uuids", delete(v0::compose_delete))
        .route("/api/v0/compose/info/:uuid", get(v0::compose_info))
        .route("/api/v0/compose/metadata/:uuid", get(v0::compose_metadata))
        .route("/api/v0/compose/results/:uuid", get(v0::compose_results))
        .route("/api/v0/compose/logs/:uuid", get(v0::compose_logs))
        .route("/api/v0/compose/log/:uuid", get(v0::compose_log))
        .route("/api/v0/compose/image/:uuid", get(v0::compose_image))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_allowlist() {
        assert!(check_chars("example-glusterfs", "blueprint name").is_ok());
        assert!(check_chars("0.0.1,tag:r1+x*", "query").is_ok());
        assert!(check_chars("bad name", "blueprint name").is_err());
        assert!(check_chars("caf\u{e9}", "blueprint name").is_err());
        assert!(check_chars("semi;colon", "blueprint name").is_err());
    }

    #[test]
    fn error_body_shape() {
        let err = ApiError::invalid_chars("branch argument");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.entry().id, "InvalidChars");
        assert!(err.entry().msg.contains("branch argument"));
    }
}
