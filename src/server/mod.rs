//! Gateway HTTP server
//!
//! Axum router exposing the client-facing endpoints:
//! - `POST /v1/chat/completions` - OpenAI shape
//! - `POST /v1/messages` - Anthropic shape
//! - `POST /cc/v1/messages` - Anthropic shape, buffered streaming
//!
//! Clients authenticate with `Authorization: Bearer` or `x-api-key`.
//! The gateway master key maps to the public pool; user keys resolve
//! through the store to that user's private credentials.

pub mod external;
pub mod handler;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_stream::stream;
use axum::body::Body;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::GatewayError;
use crate::pool::Allocator;
use crate::store::Store;
use crate::util::hash_api_key;

/// Shared state for the gateway server
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub allocator: Allocator,
    /// HTTP client for upstream and external calls
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        let allocator = Allocator::new(store.clone(), &config);
        // No total timeout: streamed responses outlive any fixed budget.
        // Per-chunk deadlines are enforced by the streaming engine.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            // Force HTTP/1.1 to avoid HTTP/2 connection reset issues
            .http1_only()
            .build()
            .unwrap_or_default();
        Self {
            config,
            store,
            allocator,
            http,
        }
    }

    pub(crate) fn record_external_outcome(&self, account_id: i64, success: bool) {
        if let Err(e) = self.store.record_external_usage(account_id, success) {
            tracing::error!("Failed to record external account usage: {}", e);
        }
    }
}

/// Build the router with all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(handler::openai_chat_completions))
        .route("/v1/messages", post(handler::anthropic_messages))
        .route("/cc/v1/messages", post(handler::anthropic_messages_buffered))
        .with_state(state)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(
    state: Arc<AppState>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = router(state);

    tracing::info!("Starting gateway on {}", bind_addr);
    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Pull the client key from `x-api-key` or `Authorization: Bearer`.
pub(crate) fn extract_client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

/// Resolve the caller: `Ok(None)` is the gateway master key (public
/// pool), `Ok(Some(uid))` a known user key.
pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<i64>, GatewayError> {
    let key = extract_client_key(headers).ok_or_else(|| {
        GatewayError::Authentication("Missing API key".to_string())
    })?;

    if let Some(master) = &state.config.proxy_api_key {
        if &key == master {
            return Ok(None);
        }
    }

    match state.store.resolve_api_key(&key) {
        Ok(Some(user_id)) => {
            tracing::debug!("Authenticated user {} (key {})", user_id, hash_api_key(&key));
            Ok(Some(user_id))
        }
        Ok(None) => {
            tracing::warn!("Rejected unknown API key {}", hash_api_key(&key));
            Err(GatewayError::Authentication("Invalid API key".to_string()))
        }
        Err(e) => Err(GatewayError::Internal(e.to_string())),
    }
}

/// SSE response wrapping a string stream.
pub(crate) fn sse_response(stream: impl Stream<Item = String> + Send + 'static) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(
            stream.map(Ok::<_, std::convert::Infallible>),
        ))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// JSON response for non-streaming results.
pub(crate) fn json_response(value: &Value) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Run `on_done` after the inner stream finishes cleanly. A cancelled
/// stream (client disconnect) or one that surfaced an SSE error event
/// never reaches the callback.
pub(crate) fn with_completion(
    inner: impl Stream<Item = String>,
    on_done: impl FnOnce() + Send + 'static,
) -> impl Stream<Item = String> {
    stream! {
        let mut errored = false;
        futures::pin_mut!(inner);
        while let Some(item) = inner.next().await {
            if item.starts_with("event: error") {
                errored = true;
            }
            yield item;
        }
        if !errored {
            on_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state_with_key(master: Option<&str>) -> AppState {
        let mut config = Config::default();
        config.proxy_api_key = master.map(String::from);
        AppState::new(config, Store::open_in_memory().unwrap())
    }

    #[test]
    fn test_extract_key_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-x"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-b"));
        assert_eq!(extract_client_key(&headers).as_deref(), Some("sk-x"));
    }

    #[test]
    fn test_extract_key_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-b"));
        assert_eq!(extract_client_key(&headers).as_deref(), Some("sk-b"));
    }

    #[test]
    fn test_authenticate_master_key_is_anonymous() {
        let state = state_with_key(Some("master"));
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("master"));
        assert_eq!(authenticate(&state, &headers).unwrap(), None);
    }

    #[test]
    fn test_authenticate_user_key() {
        let state = state_with_key(None);
        state.store.insert_api_key(7, "sk-user").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-user"));
        assert_eq!(authenticate(&state, &headers).unwrap(), Some(7));
    }

    #[test]
    fn test_authenticate_rejects_unknown() {
        let state = state_with_key(Some("master"));
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("nope"));
        assert!(matches!(
            authenticate(&state, &headers),
            Err(GatewayError::Authentication(_))
        ));
    }

    #[test]
    fn test_authenticate_requires_key() {
        let state = state_with_key(Some("master"));
        let headers = HeaderMap::new();
        assert!(matches!(
            authenticate(&state, &headers),
            Err(GatewayError::Authentication(_))
        ));
    }
}
