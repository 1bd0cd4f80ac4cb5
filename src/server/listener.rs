use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::action::CloudAction;
use crate::model::error::ErrorKind;
use crate::model::identity::GUEST_USER;
use crate::services::directory::Directory;
use crate::services::dispatcher::ActionEnvelope;

use super::rate_limit::RateLimiter;

pub const ERROR_HEADER: &str = "x-cirrus-error";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerKind {
    Public,
    Private,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::Public => "public",
            ListenerKind::Private => "private",
        }
    }
}

/// Shared state of one listener. `trust_executor` is true when the transport
/// itself authenticates the peer: mTLS on the private listener, or the
/// development plain-TCP fallback.
pub struct ListenerState {
    pub kind: ListenerKind,
    pub trust_executor: bool,
    pub actions: mpsc::UnboundedSender<ActionEnvelope>,
    pub directory: Arc<Directory>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn build_router(state: Arc<ListenerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/action/:name", post(resolve))
        .with_state(state)
}

async fn healthz() -> Response {
    axum::Json(serde_json::json!({"status": "ok"})).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ActionQuery {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    executor: Option<String>,
    #[serde(default)]
    resource_name: Option<String>,
    #[serde(default)]
    resource_id: Option<Uuid>,
}

/// Translate one HTTP request into a `CloudAction`, hand it to the
/// dispatcher, and await the resolved reply.
async fn resolve(
    State(state): State<Arc<ListenerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.rate_limiter.check(peer.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded\n").into_response();
    }

    let mut executor = query.executor.unwrap_or_default();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if state.kind == ListenerKind::Public {
        match bearer {
            Some(token) => {
                // One-shot validation: the token is consumed even when this
                // request is rejected.
                if executor.is_empty() || !state.directory.validate_token(&executor, token) {
                    warn!("rejected bearer authentication for \"{executor}\" from {peer}");
                    return (StatusCode::UNAUTHORIZED, "Invalid authentication token\n")
                        .into_response();
                }
            }
            None if !state.trust_executor => {
                // Anonymous public callers act as guest regardless of the
                // executor they claim.
                executor.clear();
            }
            None => {}
        }
    }

    let action = CloudAction {
        id: query.id.unwrap_or_else(Uuid::new_v4),
        executor: executor.clone(),
        action: name,
        resource_name: query.resource_name.unwrap_or_default(),
        resource_id: query.resource_id.unwrap_or_else(Uuid::nil),
        data: body.to_vec(),
        error: ErrorKind::None,
    };
    debug!(
        "{} listener accepted action \"{}\" id=\"{}\" from {}",
        state.kind.as_str(),
        action.action,
        action.id,
        peer
    );

    let owner = if executor.is_empty() {
        GUEST_USER
    } else {
        &executor
    };
    let from = format!("{owner}@{peer}");

    let (reply_tx, reply_rx) = oneshot::channel();
    let envelope = ActionEnvelope {
        action,
        from,
        reply: reply_tx,
    };
    if state.actions.send(envelope).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Server is shutting down\n").into_response();
    }

    match reply_rx.await {
        Ok(resolved) => reply_response(resolved),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Request was dropped\n").into_response(),
    }
}

fn reply_response(resolved: CloudAction) -> Response {
    let status = match resolved.error {
        ErrorKind::None => StatusCode::OK,
        ErrorKind::InvalidInput | ErrorKind::InvalidFileName => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = (status, resolved.data).into_response();
    if resolved.error != ErrorKind::None {
        if let Ok(value) = resolved.error.as_str().parse() {
            response.headers_mut().insert(ERROR_HEADER, value);
        }
    }
    response
}
