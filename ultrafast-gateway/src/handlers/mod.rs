//! # HTTP Request Handlers Module
//!
//! This module contains all HTTP request handlers for the Ultrafast Gateway API.
//! It provides endpoints for chat completions, embeddings, image generation,
//! audio processing, responses, and administrative functions.
//!
//! ## Overview
//!
//! The handlers module provides:
//! - **Core API Endpoints**: Chat completions, embeddings, image generation,
//!   audio, and the `responses` capability, all routed through the
//!   admission-pipeline orchestrator
//! - **Streaming Support**: Server-sent events for real-time responses
//! - **Admin Endpoints**: Health checks, metrics, and configuration
//!
//! ## API Endpoints
//!
//! ### Core API Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion API with streaming support
//! - `POST /v1/embeddings` - Text embedding generation
//! - `POST /v1/images/generations` - Image generation from text prompts
//! - `POST /v1/audio/transcriptions` - Audio transcription
//! - `POST /v1/audio/speech` - Text-to-speech conversion
//! - `POST /v1/responses` - Responses API with streaming support
//! - `GET /v1/models` - List available models
//!
//! ### Admin Endpoints
//!
//! - `GET /health` - Service health check
//! - `GET /metrics` - Performance metrics in JSON format
//! - `GET /metrics/prometheus` - Prometheus-compatible metrics
//! - `GET /admin/providers` - Provider status and health
//! - `GET /admin/config` - Current configuration status
//! - `GET /admin/circuit-breaker` - Circuit breaker metrics
//!
//! ## Request Flow
//!
//! Each request follows the orchestrator's admission pipeline:
//!
//! 1. **Validate**: Request shape and model existence
//! 2. **Screen**: Content moderation
//! 3. **Authorize**: Plan access and IP allowlist checks
//! 4. **Reserve**: Concurrency-slot and credit reservation
//! 5. **Call**: Dispatch to the selected sub-provider, with retry
//! 6. **Record**: Per-sub-provider health/latency/token bookkeeping
//! 7. **Bill**: Ledger completion against the reserved credits
//!
//! ## Streaming Support
//!
//! The gateway supports streaming responses for chat completions and the
//! responses capability:
//!
//! - **Server-Sent Events**: Real-time token streaming
//! - **Chunked Responses**: Progressive response delivery
//! - **Error Handling**: Graceful error propagation
//!
//! ## Error Handling
//!
//! All handlers include comprehensive error handling:
//!
//! - **Validation Errors**: Request validation and sanitization
//! - **Provider Errors**: Graceful provider error handling
//! - **Rate Limit Errors**: Proper rate limit responses
//! - **Network Errors**: Retry logic and timeouts

use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
    response::Json,
};
use serde_json::{json, Value};
use ultrafast_models_sdk::models::{
    AudioRequest, AudioResponse, ChatRequest, EmbeddingRequest, EmbeddingResponse, ImageRequest,
    ImageResponse, SpeechRequest,
};

/// Resolves the [`AuthenticatedUser`] and [`ClientInfo`] the orchestrator
/// needs, from whatever the auth middleware left in request extensions plus
/// the raw headers. Falls back to an anonymous, low-trust profile when no
/// request context was injected (auth disabled) or no profile is on file.
async fn resolve_caller(
    state: &AppState,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: &axum::http::HeaderMap,
) -> (crate::domain::AuthenticatedUser, crate::domain::ClientInfo) {
    let user_id = ctx
        .and_then(|axum::extract::Extension(ctx)| ctx.user_id)
        .unwrap_or_else(|| "anonymous".to_string());

    let user = state
        .user_profiles
        .profile(&user_id)
        .await
        .unwrap_or(crate::domain::AuthenticatedUser {
            id: user_id,
            plan: "free".to_string(),
            credits: 0,
            is_master_admin: false,
            is_rp_verified: false,
            ip_whitelist: Vec::new(),
            max_concurrent_requests: 1,
        });

    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    let client = crate::domain::ClientInfo {
        ip: header_str("x-forwarded-for"),
        user_agent: header_str("user-agent"),
        origin: header_str("origin"),
    };

    (user, client)
}

/// Chat completions routed through the admission-pipeline orchestrator
/// (validate -> screen -> authorize -> reserve -> call -> record -> bill).
/// Streaming requests are delegated to [`orchestrated_stream_chat_completions`].
pub async fn orchestrated_chat_completions(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    if request.stream.unwrap_or(false) {
        return orchestrated_stream_chat_completions(State(state), ctx, headers, Json(request)).await;
    }

    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let response = state.orchestrator.chat_completion(&user, &client, request).await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&response)?))
        .unwrap())
}

async fn orchestrated_stream_chat_completions(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let stream = state
        .orchestrator
        .stream_chat_completion(user, client, request)
        .await?;

    let body = Body::from_stream(async_stream::stream! {
        use futures::StreamExt;
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let event_data = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok::<axum::body::Bytes, std::io::Error>(format!("data: {event_data}\n\n").into());
                }
                Err(e) => {
                    yield Ok::<axum::body::Bytes, std::io::Error>(format!("data: {{\"error\": \"{e}\"}}\n\n").into());
                    break;
                }
            }
        }
        yield Ok::<axum::body::Bytes, std::io::Error>("data: [DONE]\n\n".into());
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap())
}

/// Embeddings routed through the same orchestrator admission pipeline as
/// [`orchestrated_chat_completions`].
pub async fn orchestrated_embeddings(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, GatewayError> {
    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let response = state.orchestrator.create_embeddings(&user, &client, request).await?;
    Ok(Json(response))
}

/// Image generation routed through the orchestrator admission pipeline.
pub async fn orchestrated_image_generations(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ImageRequest>,
) -> Result<Json<ImageResponse>, GatewayError> {
    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let response = state.orchestrator.generate_images(&user, &client, request).await?;
    Ok(Json(response))
}

/// Audio transcription routed through the orchestrator admission pipeline.
pub async fn orchestrated_audio_transcriptions(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<AudioRequest>,
) -> Result<Json<AudioResponse>, GatewayError> {
    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let response = state.orchestrator.audio_transcription(&user, &client, request).await?;
    Ok(Json(response))
}

/// Text-to-speech routed through the orchestrator admission pipeline.
/// Returns raw audio bytes with the adapter-reported content type.
pub async fn orchestrated_text_to_speech(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<SpeechRequest>,
) -> Result<Response<Body>, GatewayError> {
    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let response = state.orchestrator.text_to_speech(&user, &client, request).await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", response.content_type)
        .body(Body::from(response.audio))
        .unwrap())
}

/// Responses API routed through the orchestrator admission pipeline. Unlike
/// the typed capabilities above, `/v1/responses` has no dedicated SDK
/// request struct, so the raw JSON body is forwarded untouched and the
/// `stream` flag (if present and truthy) dispatches to
/// [`orchestrated_stream_responses`].
pub async fn orchestrated_responses(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<Value>,
) -> Result<Response<Body>, GatewayError> {
    let wants_stream = request.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if wants_stream {
        return orchestrated_stream_responses(State(state), ctx, headers, Json(request)).await;
    }

    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let response = state.orchestrator.create_response(&user, &client, request).await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&response)?))
        .unwrap())
}

async fn orchestrated_stream_responses(
    State(state): State<AppState>,
    ctx: Option<axum::extract::Extension<crate::request_context::RequestContext>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<Value>,
) -> Result<Response<Body>, GatewayError> {
    let (user, client) = resolve_caller(&state, ctx, &headers).await;
    let stream = state
        .orchestrator
        .stream_create_response(user, client, request)
        .await?;

    let body = Body::from_stream(async_stream::stream! {
        use futures::StreamExt;
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    let event_data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok::<axum::body::Bytes, std::io::Error>(format!("data: {event_data}\n\n").into());
                }
                Err(e) => {
                    yield Ok::<axum::body::Bytes, std::io::Error>(format!("data: {{\"error\": \"{e}\"}}\n\n").into());
                    break;
                }
            }
        }
        yield Ok::<axum::body::Bytes, std::io::Error>("data: [DONE]\n\n".into());
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap())
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let mut all_models = Vec::new();

    // Get models from all configured providers
    for (provider_name, provider_config) in &state.config.providers {
        if provider_config.enabled {
            // Create a list of supported models for each provider
            let models = match provider_name.as_str() {
                "openai" => vec![
                    "gpt-4",
                    "gpt-4-turbo",
                    "gpt-4-turbo-preview",
                    "gpt-3.5-turbo",
                    "gpt-3.5-turbo-16k",
                    "text-embedding-ada-002",
                    "text-embedding-3-small",
                    "text-embedding-3-large",
                    "dall-e-2",
                    "dall-e-3",
                    "whisper-1",
                    "tts-1",
                    "tts-1-hd",
                ],
                "anthropic" => vec![
                    "claude-opus-4-20250514",
                    "claude-sonnet-4-20250514",
                    "claude-3-7-sonnet-20250219",
                    "claude-3-5-sonnet-20241022",
                    "claude-3-5-haiku-20241022",
                    "claude-3-5-sonnet-20240620",
                    "claude-3-haiku-20240307",
                    "claude-3",
                    "claude",
                ],
                "azure-openai" => vec![
                    "gpt-4",
                    "gpt-4-turbo",
                    "gpt-35-turbo",
                    "text-embedding-ada-002",
                    "dall-e-3",
                ],
                "google-vertex-ai" => vec![
                    "chat-bison",
                    "text-bison",
                    "gemini-pro",
                    "textembedding-gecko",
                ],
                "gemini" => vec![
                    "gemini-1.5-pro",
                    "gemini-1.5-pro-latest",
                    "gemini-1.5-flash",
                    "gemini-1.5-flash-latest",
                    "gemini-1.0-pro",
                    "gemini-1.0-pro-vision",
                    "text-embedding-004",
                ],
                _ => vec![],
            };

            for model in models {
                all_models.push(json!({
                    "id": model,
                    "object": "model",
                    "created": 1677610602,
                    "owned_by": provider_name,
                    "provider": provider_name
                }));
            }
        }
    }

    let response = json!({
        "object": "list",
        "data": all_models
    });

    Ok(Json(response))
}

pub async fn health_check() -> Result<Json<Value>, GatewayError> {
    let response = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });

    Ok(Json(response))
}

pub async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let metrics = crate::metrics::get_aggregated_metrics().await;

    // Convert metrics to JSON for easier manipulation
    let mut provider_stats = serde_json::to_value(&metrics.provider_stats)?;
    let model_stats = serde_json::to_value(&metrics.model_stats)?;

    // If there are no provider stats from metrics (no requests made yet),
    // include configured providers from the config
    if provider_stats.as_object().unwrap().is_empty() {
        let configured_providers: serde_json::Map<String, serde_json::Value> = state
            .config
            .providers
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    json!({
                        "requests": 0,
                        "successful_requests": 0,
                        "failed_requests": 0,
                        "average_latency_ms": 0.0,
                        "p95_latency_ms": 0.0,
                        "total_cost_usd": 0.0,
                        "uptime_percentage": 100.0,
                        "error_rate": 0.0,
                        "last_request": null,
                        "enabled": config.enabled,
                        "base_url": config.base_url,
                        "timeout": config.timeout.as_secs()
                    }),
                )
            })
            .collect();
        provider_stats = serde_json::Value::Object(configured_providers);
    }

    let aggregated_metrics = json!({
        "total_requests": metrics.total_requests,
        "average_latency_ms": metrics.average_latency_ms,
        "error_rate": metrics.error_rate,
        "requests_per_minute": metrics.requests_per_minute,
        "active_connections": metrics.active_connections,
        "total_cost_usd": metrics.total_cost_usd,
        "total_tokens": metrics.total_tokens,
        "uptime_seconds": metrics.uptime_seconds,
        "provider_stats": provider_stats,
        "model_stats": model_stats,
        "error_stats": {
            "error_types": metrics.error_stats.error_types,
            "total_errors": metrics.error_stats.total_errors,
            "error_rate": metrics.error_stats.error_rate,
            "most_common_error": metrics.error_stats.most_common_error
        },
        "cache_stats": metrics.cache_stats,
        "p50_latency_ms": metrics.p50_latency_ms,
        "p90_latency_ms": metrics.p90_latency_ms,
        "p95_latency_ms": metrics.p95_latency_ms,
        "p99_latency_ms": metrics.p99_latency_ms,
        "successful_requests": metrics.successful_requests,
        "failed_requests": metrics.failed_requests
    });

    Ok(Json(aggregated_metrics))
}

pub async fn prometheus_metrics(
    State(_state): State<AppState>,
) -> Result<Response<Body>, GatewayError> {
    let prometheus_metrics = crate::metrics::get_prometheus_metrics().await;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(prometheus_metrics))
        .unwrap())
}

pub async fn list_providers(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let providers: Vec<Value> = state
        .config
        .providers
        .iter()
        .map(|(name, config)| {
            json!({
                "name": name,
                "enabled": config.enabled,
                "base_url": config.base_url,
                "timeout": config.timeout.as_secs(),
                "models": Vec::<String>::new() // Could be populated with actual supported models
            })
        })
        .collect();

    Ok(Json(json!({
        "providers": providers
    })))
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    // Return a sanitized version of the config (without sensitive data)
    let sanitized_config = json!({
        "server": {
            "host": state.config.server.host,
            "port": state.config.server.port,
            "timeout": state.config.server.timeout.as_secs()
        },
        "providers": state.config.providers.keys().collect::<Vec<_>>(),
        "routing": {
            "strategy": state.config.routing.strategy,
            "health_check_interval": state.config.routing.health_check_interval.as_secs()
        },
        "cache": {
            "enabled": state.config.cache.enabled,
            "backend": state.config.cache.backend
        },
        "metrics": {
            "enabled": state.config.metrics.enabled
        }
    });

    Ok(Json(sanitized_config))
}

/// Circuit-breaker/health rollup sourced from the per-sub-provider state
/// the orchestrator itself reserves capacity against and records outcomes
/// into, rather than from a separate client-side tracker.
pub async fn get_circuit_breaker_metrics(
    State(state): State<AppState>,
) -> Result<Json<Value>, GatewayError> {
    let mut metrics_data = json!({});

    for sub_provider_id in state.sub_provider_states.ids() {
        let Some(handle) = state.sub_provider_states.get(&sub_provider_id) else {
            continue;
        };
        let guard = handle.read().await;
        metrics_data[sub_provider_id] = json!({
            "state": format!("{:?}", guard.circuit_state()),
            "success_count": guard.success_count(),
            "error_count": guard.error_count(),
            "consecutive_errors": guard.consecutive_errors(),
            "total_requests": guard.total_requests(),
            "avg_latency_ms": guard.avg_latency_ms(),
            "total_token_usage": guard.total_token_usage(),
            "is_healthy": guard.is_healthy()
        });
    }

    Ok(Json(metrics_data))
}
