//! Request orchestration
//!
//! The pipeline shared by all three endpoints: authenticate, normalize
//! the client request, pick a credential (or delegate to an external
//! account), build the upstream payload, open the upstream stream, and
//! wire it through the matching SSE generator or collector. Errors are
//! mapped to the client's wire format at the boundary.

use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::Stream;

use crate::config::adaptive_timeout;
use crate::convert::anthropic::{normalize_anthropic_request, AnthropicMessagesRequest};
use crate::convert::openai::{normalize_openai_request, OpenAiChatRequest};
use crate::convert::upstream::{build_upstream_payload, PayloadOptions};
use crate::convert::ConversationRequest;
use crate::error::{
    classify_upstream_error, upstream_error_to_gateway, GatewayError, UpstreamErrorKind,
    WireFormat,
};
use crate::pool::Allocation;
use crate::stream::anthropic_sse::{collect_anthropic_response, stream_to_anthropic};
use crate::stream::buffered::stream_to_anthropic_buffered;
use crate::stream::openai_sse::{collect_openai_response, stream_to_openai};
use crate::stream::{open_upstream_stream, StreamContext, UpstreamOpen};
use crate::util::{generate_conversation_id, truncate_utf8_safe};

use super::{
    authenticate, external, json_response, sse_response, with_completion, AppState,
};

/// POST /v1/chat/completions
pub async fn openai_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let debug_mode = state.config.debug_mode;
    let result: Result<_, GatewayError> = async {
        let user_id = authenticate(&state, &headers)?;
        let request: OpenAiChatRequest = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid request body: {}", e)))?;
        let normalized = normalize_openai_request(request);
        Ok((user_id, normalized))
    }
    .await;

    match result {
        Ok((user_id, normalized)) => {
            process_request(
                state,
                user_id,
                normalized,
                WireFormat::OpenAi,
                false,
                "/v1/chat/completions",
            )
            .await
        }
        Err(e) => e.into_response_for(WireFormat::OpenAi, debug_mode),
    }
}

/// POST /v1/messages
pub async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    anthropic_endpoint(state, headers, body, false, "/v1/messages").await
}

/// POST /cc/v1/messages - buffered streaming semantics
pub async fn anthropic_messages_buffered(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    anthropic_endpoint(state, headers, body, true, "/cc/v1/messages").await
}

async fn anthropic_endpoint(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    buffered: bool,
    endpoint: &'static str,
) -> Response {
    let debug_mode = state.config.debug_mode;
    let result: Result<_, GatewayError> = async {
        let user_id = authenticate(&state, &headers)?;
        let request: AnthropicMessagesRequest = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid request body: {}", e)))?;
        let normalized = normalize_anthropic_request(request);
        Ok((user_id, normalized))
    }
    .await;

    match result {
        Ok((user_id, normalized)) => {
            process_request(state, user_id, normalized, WireFormat::Anthropic, buffered, endpoint)
                .await
        }
        Err(e) => e.into_response_for(WireFormat::Anthropic, debug_mode),
    }
}

/// Core pipeline once the request is normalized.
async fn process_request(
    state: Arc<AppState>,
    user_id: Option<i64>,
    request: ConversationRequest,
    format: WireFormat,
    buffered: bool,
    endpoint: &'static str,
) -> Response {
    let debug_mode = state.config.debug_mode;
    match run_pipeline(state, user_id, request, format, buffered, endpoint).await {
        Ok(response) => response,
        Err(e) => e.into_response_for(format, debug_mode),
    }
}

async fn run_pipeline(
    state: Arc<AppState>,
    user_id: Option<i64>,
    request: ConversationRequest,
    format: WireFormat,
    buffered: bool,
    endpoint: &'static str,
) -> Result<Response, GatewayError> {
    tracing::debug!(
        "POST {} model={} stream={} user={:?}",
        endpoint,
        request.model,
        request.stream,
        user_id
    );

    let allocation = state.allocator.allocate(user_id, &request.model).await?;

    let (credential, manager) = match allocation {
        Allocation::External(account) => {
            return Ok(
                external::handle_external(state, account, request, format, endpoint).await,
            );
        }
        Allocation::Credential { credential, manager } => (credential, manager),
    };

    let access_token = match manager.get_access_token().await {
        Ok(token) => token,
        Err(e) => {
            // Refresh rejection: this credential no longer authenticates
            state.allocator.mark_invalid(&credential).await;
            state.allocator.record_outcome(credential.id, false);
            return Err(GatewayError::UpstreamAuth(format!(
                "Upstream authentication failed: {}",
                e
            )));
        }
    };

    let conversation_id = generate_conversation_id();
    let profile_arn = match manager.profile_arn().await {
        Some(arn) => Some(arn),
        None => state.config.profile_arn.clone(),
    };
    let payload = build_upstream_payload(
        &request,
        &PayloadOptions {
            conversation_id: &conversation_id,
            profile_arn: profile_arn.as_deref(),
            tool_description_max_length: state.config.tool_description_max_length,
        },
    );

    let url = format!("{}/generateAssistantResponse", manager.api_host());
    let open = match open_upstream_stream(
        &state.http,
        &url,
        &access_token,
        &payload,
        state.config.first_token_timeout,
        state.config.first_token_max_retries,
    )
    .await
    {
        Ok(open) => open,
        Err(e) => {
            state.allocator.record_outcome(credential.id, false);
            return Err(e);
        }
    };

    let upstream = match open {
        UpstreamOpen::Stream(upstream) => upstream,
        UpstreamOpen::ErrorStatus { status, body } => {
            let info = classify_upstream_error(&body);
            tracing::error!(
                "Error from upstream API: {} - {}",
                status,
                truncate_utf8_safe(&info.message, 200)
            );
            if info.kind == UpstreamErrorKind::Quota {
                state.allocator.mark_expired(&credential).await;
            }
            state.allocator.record_outcome(credential.id, false);
            return Err(upstream_error_to_gateway(status, &info));
        }
    };

    let ctx = StreamContext {
        model: request.model.clone(),
        thinking_enabled: request.thinking.is_enabled(),
        request_messages: request.messages_for_tokenizer(),
        request_tools: request.tools_for_tokenizer(),
        read_timeout: adaptive_timeout(&request.model, state.config.stream_read_timeout),
        max_consecutive_timeouts: state.config.max_consecutive_timeouts,
    };

    if request.stream {
        let generator: Pin<Box<dyn Stream<Item = String> + Send>> = match (format, buffered) {
            (WireFormat::Anthropic, true) => {
                Box::pin(stream_to_anthropic_buffered(upstream, ctx))
            }
            (WireFormat::Anthropic, false) => Box::pin(stream_to_anthropic(upstream, ctx)),
            (WireFormat::OpenAi, _) => Box::pin(stream_to_openai(upstream, ctx)),
        };

        let credential_id = credential.id;
        let done_state = state.clone();
        let stream = with_completion(generator, move || {
            done_state.allocator.record_outcome(credential_id, true);
            tracing::info!("HTTP 200 - POST {} (streaming) - completed", endpoint);
        });
        Ok(sse_response(stream))
    } else {
        let collected = match format {
            WireFormat::Anthropic => collect_anthropic_response(upstream, ctx).await,
            WireFormat::OpenAi => collect_openai_response(upstream, ctx).await,
        };
        match collected {
            Ok(value) => {
                state.allocator.record_outcome(credential.id, true);
                tracing::info!("HTTP 200 - POST {} (non-streaming) - completed", endpoint);
                Ok(json_response(&value))
            }
            Err(e) => {
                state.allocator.record_outcome(credential.id, false);
                Err(e)
            }
        }
    }
}
