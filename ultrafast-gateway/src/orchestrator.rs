//! # Request Orchestrator (C8)
//!
//! One pipeline per capability, all following the admission order
//! SPEC_FULL.md §4.8 lays out: validate -> screen -> authorize -> reserve
//! -> call -> record -> bill. This module implements the full pipeline for
//! every capability the gateway exposes -- chat completions (sync and
//! streaming), embeddings, text-to-speech, audio transcription, image
//! generation, and `create_response`/`stream_create_response` -- all
//! sharing the same `select_and_invoke` retry loop.
//!
//! Grounded on `ultrafast-gateway/src/handlers/mod.rs`'s per-endpoint axum
//! handlers (validate -> delegate -> map errors to HTTP) and on the
//! teacher's retry-with-reselection loop, generalized from "retry the same
//! provider set" to "exclude failed ids and re-select." Token estimation's
//! `ceil(chars/4)` fallback reuses the teacher's token-estimate heuristic.
//! The SSE pass-through/accumulate/terminator shape is grounded on the
//! teacher's streaming chat-completion handler, which uses `async_stream`
//! over `data: `-prefixed chunks.

use futures::Stream;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use ultrafast_models_sdk::error::{classify_error, sanitize_error_message, ErrorType, ProviderError};
use ultrafast_models_sdk::models::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message, StreamChunk,
};

use ultrafast_models_sdk::models::{AudioRequest, AudioResponse, ImageRequest, ImageResponse, SpeechRequest, SpeechResponse};

use crate::content_screener::{ContentScreener, RiskLevel, ScreeningContext};
use crate::credits_ledger::CreditsLedger;
use crate::domain::{AuthenticatedUser, ClientInfo, EncryptedSecret, SubProvider};
use crate::load_balancer::{filter_excluded, select_candidate, Candidate, SelectionTracker};
use crate::model_catalog::ModelCatalog;
use crate::provider_registry::{ProviderRegistry, UpstreamAdapter};
use crate::repository::{ProviderRepository, Repository, SubProviderRepository, UserDiscountRepository};
use crate::sub_provider::SubProviderRegistry;

const CHAT_RETRY_BOUND: usize = 10;
const RESPONSES_RETRY_BOUND: usize = 10;
const EMBEDDING_RETRY_BOUND: usize = 5;
const SPEECH_RETRY_BOUND: usize = 5;
const AUDIO_RETRY_BOUND: usize = 5;
const IMAGE_RETRY_BOUND: usize = 5;

/// Flat per-image credit allowance: image generation has no token-shaped
/// cost, so it uses a fixed estimate the way embeddings do.
const IMAGE_TOKEN_ALLOWANCE: u64 = 512;
/// Flat allowance for one transcription call; transcription cost tracks
/// audio duration, not text length, so there is no cheap pre-call estimate.
const AUDIO_TOKEN_ALLOWANCE: u64 = 512;

#[derive(Debug, Clone)]
pub enum OrchestratorError {
    InvalidRequest(String),
    ModelNotFound,
    PlanAccessDenied,
    ContentBlocked { category: Option<String> },
    InsufficientCredits,
    IpNotAllowed,
    AllProvidersFailed { last_message: String },
}

/// Decrypts a [`EncryptedSecret`] into a usable API key. Real decryption is
/// an external collaborator (SPEC_FULL.md §1); this seam lets the
/// orchestrator stay agnostic of the key-management backend.
pub trait SecretStore: Send + Sync {
    fn decrypt(&self, secret: &EncryptedSecret) -> String;
}

/// Estimates token usage from message content using the teacher's
/// `ceil(chars/4)` heuristic.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (chars as u64).div_ceil(4) + 10
}

/// Same heuristic applied to a single string, for capabilities whose
/// billable input is plain text rather than a message list (e.g. speech).
fn estimate_text_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4) + 10
}

/// Best-effort text extraction from a `responses` request body, for content
/// screening and token estimation. The wire format is vendor-shaped JSON
/// (SPEC_FULL.md §6); `input` is either a plain string or a list of
/// message-shaped objects carrying a `content` field.
fn extract_response_text(request: &serde_json::Value) -> String {
    match request.get("input") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("content").and_then(|c| c.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Guards a streaming capability's capacity release and ledger
/// finalization so they run exactly once (SPEC_FULL.md §5's cancellation
/// contract), whether the stream runs to exhaustion or the consumer drops
/// it early. The normal end-of-stream path claims the flag and finalizes
/// with accurate data (real accumulated size, success/failure outcome);
/// `Drop` only dispatches the fallback release/fail sequence if that claim
/// never happened.
struct StreamFinalizer {
    ledger: Arc<CreditsLedger>,
    sub_provider_states: Arc<SubProviderRegistry>,
    sub_provider_id: Option<String>,
    request_id: String,
    finished: Arc<AtomicBool>,
}

impl StreamFinalizer {
    /// Called from the normal end-of-stream path. Returns `true` if this
    /// call is the one that must run finalization (`Drop` will then no-op).
    fn claim(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let ledger = self.ledger.clone();
        let sub_provider_states = self.sub_provider_states.clone();
        let sub_provider_id = self.sub_provider_id.clone();
        let request_id = self.request_id.clone();
        tokio::spawn(async move {
            if let Some(id) = &sub_provider_id {
                if let Some(state) = sub_provider_states.get(id) {
                    state.write().await.release_capacity();
                }
            }
            ledger.fail_request(&request_id, 499).await;
        });
    }
}

pub struct Orchestrator {
    catalog: Arc<ModelCatalog>,
    providers: Arc<ProviderRepository>,
    sub_providers: Arc<SubProviderRepository>,
    sub_provider_states: Arc<SubProviderRegistry>,
    provider_registry: Arc<ProviderRegistry>,
    tracker: Arc<SelectionTracker>,
    screener: Arc<ContentScreener>,
    ledger: Arc<CreditsLedger>,
    secrets: Arc<dyn SecretStore>,
    discounts: Arc<UserDiscountRepository>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<ModelCatalog>,
        providers: Arc<ProviderRepository>,
        sub_providers: Arc<SubProviderRepository>,
        sub_provider_states: Arc<SubProviderRegistry>,
        provider_registry: Arc<ProviderRegistry>,
        tracker: Arc<SelectionTracker>,
        screener: Arc<ContentScreener>,
        ledger: Arc<CreditsLedger>,
        secrets: Arc<dyn SecretStore>,
        discounts: Arc<UserDiscountRepository>,
    ) -> Self {
        Self {
            catalog,
            providers,
            sub_providers,
            sub_provider_states,
            provider_registry,
            tracker,
            screener,
            ledger,
            secrets,
            discounts,
        }
    }

    /// Step 1 (shared part): model exists, its endpoints list the
    /// capability path, and the plan (or an active discount) grants
    /// access.
    async fn validate_access(
        &self,
        model_id: &str,
        path: &str,
        user: &AuthenticatedUser,
    ) -> Result<crate::domain::Model, OrchestratorError> {
        let model = self
            .catalog
            .by_id(model_id)
            .ok_or(OrchestratorError::ModelNotFound)?;
        if !model.endpoints.contains(path) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "model '{model_id}' does not support '{path}'"
            )));
        }
        if user.is_master_admin || self.catalog.has_access(model_id, &user.plan) {
            return Ok(model);
        }
        if self.active_discount_multiplier(user, model_id).await.is_some() {
            return Ok(model);
        }
        Err(OrchestratorError::PlanAccessDenied)
    }

    async fn authorize(&self, user: &AuthenticatedUser, client: &ClientInfo, expected_credits: u64) -> Result<(), OrchestratorError> {
        if let Some(ip) = &client.ip {
            if !user.ip_whitelist.is_empty() && !user.ip_whitelist.iter().any(|w| w == ip) {
                return Err(OrchestratorError::IpNotAllowed);
            }
        }
        if user.is_master_admin {
            return Ok(());
        }
        if user.credits < expected_credits {
            return Err(OrchestratorError::InsufficientCredits);
        }
        Ok(())
    }

    /// Builds the eligible-candidate list for one model (SPEC_FULL.md §4.4
    /// step 1) by joining provider records against their sub-providers'
    /// live fast-path state.
    async fn build_candidates(
        &self,
        model_id: &str,
        estimated_tokens: u64,
        require_healthy: bool,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for provider in self.providers.find_many().await {
            if !provider.is_active || !provider.supported_models.contains(model_id) {
                continue;
            }
            if !provider.needs_sub_providers {
                candidates.push(Candidate {
                    id: provider.id.clone(),
                    provider_id: provider.id.clone(),
                    sub_provider_id: None,
                    is_healthy: provider.health_status == crate::domain::HealthStatus::Healthy,
                    is_available: provider.is_active,
                    success_rate: provider.success_rate(),
                    avg_latency_ms: provider.avg_latency_ms,
                    health_score: crate::load_balancer::provider_health_score(provider.health_status),
                    total_requests: provider.success_count + provider.error_count,
                    consecutive_errors: provider.consecutive_errors,
                    rpm_current: 0,
                    rpm_limit: 0,
                    tpm_current_with_estimate: 0,
                    tpm_limit: 0,
                    concurrency_current: 0,
                    concurrency_limit: 0,
                });
                continue;
            }

            for sub_provider in self.sub_providers.find_many().await {
                if sub_provider.provider_id != provider.id || !sub_provider.enabled {
                    continue;
                }
                let Some(state) = self.sub_provider_states.get(&sub_provider.id) else {
                    continue;
                };
                let mut guard = state.write().await;
                let is_healthy = guard.is_healthy();
                if require_healthy && !is_healthy {
                    continue;
                }
                candidates.push(Candidate {
                    id: sub_provider.id.clone(),
                    provider_id: provider.id.clone(),
                    sub_provider_id: Some(sub_provider.id.clone()),
                    is_healthy,
                    is_available: sub_provider.enabled && is_healthy,
                    success_rate: guard.success_rate(),
                    avg_latency_ms: guard.avg_latency_ms(),
                    health_score: guard.health_score(),
                    total_requests: guard.total_requests(),
                    consecutive_errors: guard.consecutive_errors(),
                    rpm_current: guard.current_requests_per_minute(),
                    rpm_limit: sub_provider.max_requests_per_minute,
                    tpm_current_with_estimate: guard.current_tokens_per_minute() + estimated_tokens,
                    tpm_limit: sub_provider.max_tokens_per_minute,
                    concurrency_current: guard.current_concurrent_requests(),
                    concurrency_limit: sub_provider.max_concurrent_requests,
                });
            }
        }
        candidates
    }

    async fn derive_adapter_for(&self, candidate: &Candidate) -> Option<(Arc<dyn UpstreamAdapter>, SubProvider)> {
        let sub_provider_id = candidate.sub_provider_id.as_ref()?;
        let sub_provider = self.sub_providers.find_by_id(sub_provider_id).await?;
        let provider = self.providers.find_by_id(&candidate.provider_id).await?;
        let api_key = self.secrets.decrypt(&sub_provider.encrypted_api_key);
        let adapter = self.provider_registry.derive_adapter(
            &provider.name,
            &api_key,
            sub_provider.model_mapping.clone(),
        )?;
        Some((adapter, sub_provider))
    }

    /// The shared retry loop (SPEC_FULL.md §4.8 step 5): select, derive,
    /// reserve, invoke, record. Retries with the failed candidate excluded
    /// until `retry_bound` attempts are exhausted.
    async fn select_and_invoke<T, F>(
        &self,
        model_id: &str,
        estimated_tokens: u64,
        retry_bound: usize,
        mut invoke: F,
    ) -> Result<(T, Option<String>, Option<String>), OrchestratorError>
    where
        F: FnMut(Arc<dyn UpstreamAdapter>, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ProviderError>> + Send>>,
    {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error = "no eligible provider".to_string();

        for _ in 0..retry_bound {
            let candidates = self.build_candidates(model_id, estimated_tokens, false).await;
            let eligible = filter_excluded(candidates, &excluded);
            let Some(candidate) = select_candidate(&eligible, &self.tracker, &mut rand::thread_rng()) else {
                break;
            };

            let Some((adapter, sub_provider)) = self.derive_adapter_for(&candidate).await else {
                excluded.insert(candidate.id.clone());
                continue;
            };

            if let Some(sub_provider_id) = &candidate.sub_provider_id {
                if let Some(state) = self.sub_provider_states.get(sub_provider_id) {
                    let reserved = state.write().await.reserve_capacity(estimated_tokens);
                    if !reserved {
                        excluded.insert(candidate.id.clone());
                        continue;
                    }
                }
            }

            let mapped_model = adapter.get_mapped_model(model_id);
            let started = Instant::now();
            let result = invoke(adapter, mapped_model).await;
            let latency_ms = started.elapsed().as_millis() as f64;

            if let Some(sub_provider_id) = &candidate.sub_provider_id {
                if let Some(state) = self.sub_provider_states.get(sub_provider_id) {
                    let mut guard = state.write().await;
                    guard.release_capacity();
                    match &result {
                        Ok(_) => guard.record_success(latency_ms, estimated_tokens),
                        Err(e) => guard.record_error(classify_error(&e.to_string()), Some(latency_ms)),
                    }
                }
            }

            match result {
                Ok(value) => {
                    return Ok((value, Some(candidate.provider_id.clone()), candidate.sub_provider_id.clone()));
                }
                Err(e) => {
                    warn!(provider_id = %candidate.provider_id, error = %sanitize_error_message(&e.to_string()), "adapter call failed, excluding and retrying");
                    last_error = sanitize_error_message(&e.to_string());
                    excluded.insert(candidate.id.clone());
                    let _ = sub_provider; // keep borrow checker happy about unused binding in some branches
                }
            }
        }

        Err(OrchestratorError::AllProvidersFailed { last_message: last_error })
    }

    /// Non-streaming chat completion pipeline.
    pub async fn chat_completion(
        &self,
        user: &AuthenticatedUser,
        client: &ClientInfo,
        request: ChatRequest,
    ) -> Result<ChatResponse, OrchestratorError> {
        if request.messages.is_empty() {
            return Err(OrchestratorError::InvalidRequest("messages must not be empty".into()));
        }
        if let Some(temp) = request.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(OrchestratorError::InvalidRequest("temperature must be in [0, 2]".into()));
            }
        }

        let model = self.validate_access(&request.model, "/v1/chat/completions", user).await?;

        let content: String = request.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        let origin = client.origin.as_deref();
        let screening = self
            .screener
            .screen(
                &content,
                &ScreeningContext {
                    model_id: &model.id,
                    plan: &user.plan,
                    is_rp_verified: user.is_rp_verified,
                    origin,
                    is_image: false,
                },
            )
            .await;
        if screening.risk_level != RiskLevel::Safe {
            return Err(OrchestratorError::ContentBlocked { category: screening.category });
        }

        let estimated_tokens = estimate_tokens(&request.messages);
        let discount = self.active_discount_multiplier(user, &model.id).await;
        let expected_credits = self
            .catalog
            .calculate_credits(&model.id, estimated_tokens, discount)
            .unwrap_or(0);
        self.authorize(user, client, expected_credits).await?;

        let ledger_request = self
            .ledger
            .create_request(Some(user.id.clone()), "/v1/chat/completions", &model.id)
            .await;
        self.ledger.start_processing(&ledger_request.id).await;

        let request_for_retry = request.clone();
        let invoke_result = self
            .select_and_invoke(&model.id, estimated_tokens, CHAT_RETRY_BOUND, move |adapter, mapped_model| {
                let mut req = request_for_retry.clone();
                req.model = mapped_model;
                Box::pin(async move { adapter.chat_completion(req).await })
            })
            .await;

        match invoke_result {
            Ok((response, provider_id, sub_provider_id)) => {
                let output_tokens = response
                    .usage
                    .as_ref()
                    .map(|u| u.completion_tokens as u64)
                    .unwrap_or_else(|| {
                        response
                            .choices
                            .iter()
                            .map(|c| (c.message.content.len() as u64).div_ceil(4))
                            .sum()
                    });
                let total_tokens = estimated_tokens + output_tokens;
                let final_credits = self
                    .catalog
                    .calculate_credits(&model.id, total_tokens, discount)
                    .unwrap_or(expected_credits);

                if !user.is_master_admin {
                    let _ = self
                        .ledger
                        .deduct_credits(&user.id, final_credits, "chat_completion", "/v1/chat/completions", total_tokens)
                        .await;
                }
                self.ledger
                    .complete_request(
                        &ledger_request.id,
                        total_tokens,
                        final_credits,
                        provider_id,
                        sub_provider_id,
                        serde_json::to_string(&response).map(|s| s.len() as u64).unwrap_or(0),
                        200,
                    )
                    .await;
                Ok(response)
            }
            Err(e) => {
                self.ledger.fail_request(&ledger_request.id, 502).await;
                error!(model = %model.id, "chat completion exhausted all providers");
                Err(e)
            }
        }
    }

    /// Streaming chat completion: lazily establishes the upstream stream
    /// using the same selection/reservation loop, yields each chunk, then
    /// appends a synthetic terminator and finalizes accounting once the
    /// stream is exhausted. Retries only happen before the first yield
    /// (SPEC_FULL.md §4.8, "Streaming subcase").
    pub async fn stream_chat_completion(
        &self,
        user: AuthenticatedUser,
        client: ClientInfo,
        request: ChatRequest,
    ) -> Result<impl Stream<Item = Result<StreamChunk, ProviderError>>, OrchestratorError> {
        if request.messages.is_empty() {
            return Err(OrchestratorError::InvalidRequest("messages must not be empty".into()));
        }
        let model = self.validate_access(&request.model, "/v1/chat/completions", &user).await?;

        let content: String = request.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        let screening = self
            .screener
            .screen(
                &content,
                &ScreeningContext {
                    model_id: &model.id,
                    plan: &user.plan,
                    is_rp_verified: user.is_rp_verified,
                    origin: client.origin.as_deref(),
                    is_image: false,
                },
            )
            .await;
        if screening.risk_level != RiskLevel::Safe {
            return Err(OrchestratorError::ContentBlocked { category: screening.category });
        }

        let estimated_tokens = estimate_tokens(&request.messages);
        let discount = self.active_discount_multiplier(&user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(&user, &client, expected_credits).await?;

        let ledger_request = self
            .ledger
            .create_request(Some(user.id.clone()), "/v1/chat/completions", &model.id)
            .await;
        self.ledger.start_processing(&ledger_request.id).await;

        let mut excluded: HashSet<String> = HashSet::new();
        let mut established = None;
        for _ in 0..CHAT_RETRY_BOUND {
            let candidates = self.build_candidates(&model.id, estimated_tokens, false).await;
            let eligible = filter_excluded(candidates, &excluded);
            let Some(candidate) = select_candidate(&eligible, &self.tracker, &mut rand::thread_rng()) else {
                break;
            };
            let Some((adapter, _)) = self.derive_adapter_for(&candidate).await else {
                excluded.insert(candidate.id.clone());
                continue;
            };
            if let Some(sub_provider_id) = &candidate.sub_provider_id {
                if let Some(state) = self.sub_provider_states.get(sub_provider_id) {
                    if !state.write().await.reserve_capacity(estimated_tokens) {
                        excluded.insert(candidate.id.clone());
                        continue;
                    }
                }
            }
            let mut req = request.clone();
            req.model = adapter.get_mapped_model(&model.id);
            match adapter.stream_chat_completion(req).await {
                Ok(stream) => {
                    established = Some((stream, candidate));
                    break;
                }
                Err(_) => {
                    excluded.insert(candidate.id.clone());
                    continue;
                }
            }
        }

        let Some((mut upstream, candidate)) = established else {
            self.ledger.fail_request(&ledger_request.id, 502).await;
            return Err(OrchestratorError::AllProvidersFailed { last_message: "no stream established".into() });
        };

        let finalizer = StreamFinalizer {
            ledger: self.ledger.clone(),
            sub_provider_states: self.sub_provider_states.clone(),
            sub_provider_id: candidate.sub_provider_id.clone(),
            request_id: ledger_request.id.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        };
        let ledger = self.ledger.clone();
        let sub_provider_states = self.sub_provider_states.clone();
        let catalog = self.catalog.clone();
        let model_id = model.id.clone();
        let request_id = ledger_request.id.clone();
        let user_id = user.id.clone();
        let is_master_admin = user.is_master_admin;

        Ok(async_stream::stream! {
            use futures::StreamExt;
            let _finalizer = finalizer;
            let mut accumulated = String::new();
            let mut failed = false;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(choice) = chunk.choices.first() {
                            if let Some(text) = &choice.delta.content {
                                accumulated.push_str(text);
                            }
                        }
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        failed = true;
                        if let Some(sub_provider_id) = &candidate.sub_provider_id {
                            if let Some(state) = sub_provider_states.get(sub_provider_id) {
                                state.write().await.record_error(ErrorType::StreamFailure, None);
                            }
                        }
                        yield Err(e);
                        break;
                    }
                }
            }

            if _finalizer.claim() {
                if let Some(sub_provider_id) = &candidate.sub_provider_id {
                    if let Some(state) = sub_provider_states.get(sub_provider_id) {
                        let mut guard = state.write().await;
                        guard.release_capacity();
                        if !failed {
                            guard.record_success(0.0, estimated_tokens);
                        }
                    }
                }

                if failed {
                    ledger.fail_request(&request_id, 502).await;
                } else {
                    let output_tokens = (accumulated.len() as u64).div_ceil(4);
                    let total_tokens = estimated_tokens + output_tokens;
                    let credits = catalog.calculate_credits(&model_id, total_tokens, discount).unwrap_or(0);
                    if !is_master_admin {
                        let _ = ledger.deduct_credits(&user_id, credits, "chat_completion_stream", "/v1/chat/completions", total_tokens).await;
                    }
                    ledger
                        .complete_request(&request_id, total_tokens, credits, Some(candidate.provider_id.clone()), candidate.sub_provider_id.clone(), accumulated.len() as u64, 200)
                        .await;
                }
            }
        })
    }

    /// Embeddings pipeline, following the identical admission/retry shape
    /// as chat (demonstrating the "all follow the same shape" contract).
    pub async fn create_embeddings(
        &self,
        user: &AuthenticatedUser,
        client: &ClientInfo,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, OrchestratorError> {
        let input_len = match &request.input {
            ultrafast_models_sdk::models::EmbeddingInput::String(_) => 1,
            ultrafast_models_sdk::models::EmbeddingInput::StringArray(v) => v.len(),
            ultrafast_models_sdk::models::EmbeddingInput::TokenArray(_) => 1,
            ultrafast_models_sdk::models::EmbeddingInput::TokenArrayArray(v) => v.len(),
        };
        if input_len == 0 || input_len > 2048 {
            return Err(OrchestratorError::InvalidRequest("embedding inputs must be 1..=2048".into()));
        }

        let model = self.validate_access(&request.model, "/v1/embeddings", user).await?;
        let estimated_tokens = 256u64; // embeddings lack a message-based estimate; flat allowance.
        let discount = self.active_discount_multiplier(user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(user, client, expected_credits).await?;

        let ledger_request = self.ledger.create_request(Some(user.id.clone()), "/v1/embeddings", &model.id).await;
        self.ledger.start_processing(&ledger_request.id).await;

        let request_for_retry = request.clone();
        let invoke_result = self
            .select_and_invoke(&model.id, estimated_tokens, EMBEDDING_RETRY_BOUND, move |adapter, mapped_model| {
                let mut req = request_for_retry.clone();
                req.model = mapped_model;
                Box::pin(async move { adapter.create_embeddings(req).await })
            })
            .await;

        match invoke_result {
            Ok((response, provider_id, sub_provider_id)) => {
                let credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(expected_credits);
                if !user.is_master_admin {
                    let _ = self.ledger.deduct_credits(&user.id, credits, "embeddings", "/v1/embeddings", estimated_tokens).await;
                }
                self.ledger
                    .complete_request(&ledger_request.id, estimated_tokens, credits, provider_id, sub_provider_id, 0, 200)
                    .await;
                Ok(response)
            }
            Err(e) => {
                self.ledger.fail_request(&ledger_request.id, 502).await;
                Err(e)
            }
        }
    }

    /// Text-to-speech pipeline, same admission/retry shape as chat/embeddings.
    pub async fn text_to_speech(
        &self,
        user: &AuthenticatedUser,
        client: &ClientInfo,
        request: SpeechRequest,
    ) -> Result<SpeechResponse, OrchestratorError> {
        if request.input.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("input must not be empty".into()));
        }

        let model = self.validate_access(&request.model, "/v1/audio/speech", user).await?;

        let screening = self
            .screener
            .screen(
                &request.input,
                &ScreeningContext {
                    model_id: &model.id,
                    plan: &user.plan,
                    is_rp_verified: user.is_rp_verified,
                    origin: client.origin.as_deref(),
                    is_image: false,
                },
            )
            .await;
        if screening.risk_level != RiskLevel::Safe {
            return Err(OrchestratorError::ContentBlocked { category: screening.category });
        }

        let estimated_tokens = estimate_text_tokens(&request.input);
        let discount = self.active_discount_multiplier(user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(user, client, expected_credits).await?;

        let ledger_request = self.ledger.create_request(Some(user.id.clone()), "/v1/audio/speech", &model.id).await;
        self.ledger.start_processing(&ledger_request.id).await;

        let request_for_retry = request.clone();
        let invoke_result = self
            .select_and_invoke(&model.id, estimated_tokens, SPEECH_RETRY_BOUND, move |adapter, mapped_model| {
                let mut req = request_for_retry.clone();
                req.model = mapped_model;
                Box::pin(async move { adapter.text_to_speech(req).await })
            })
            .await;

        match invoke_result {
            Ok((response, provider_id, sub_provider_id)) => {
                let credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(expected_credits);
                if !user.is_master_admin {
                    let _ = self.ledger.deduct_credits(&user.id, credits, "text_to_speech", "/v1/audio/speech", estimated_tokens).await;
                }
                self.ledger
                    .complete_request(&ledger_request.id, estimated_tokens, credits, provider_id, sub_provider_id, response.audio.len() as u64, 200)
                    .await;
                Ok(response)
            }
            Err(e) => {
                self.ledger.fail_request(&ledger_request.id, 502).await;
                Err(e)
            }
        }
    }

    /// Audio transcription pipeline. Billing falls back to the flat
    /// [`AUDIO_TOKEN_ALLOWANCE`] since cost here tracks audio duration, not
    /// a text length the orchestrator can see ahead of the call.
    pub async fn audio_transcription(
        &self,
        user: &AuthenticatedUser,
        client: &ClientInfo,
        request: AudioRequest,
    ) -> Result<AudioResponse, OrchestratorError> {
        if request.file.is_empty() {
            return Err(OrchestratorError::InvalidRequest("file must not be empty".into()));
        }

        let model = self.validate_access(&request.model, "/v1/audio/transcriptions", user).await?;
        let estimated_tokens = AUDIO_TOKEN_ALLOWANCE;
        let discount = self.active_discount_multiplier(user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(user, client, expected_credits).await?;

        let ledger_request = self
            .ledger
            .create_request(Some(user.id.clone()), "/v1/audio/transcriptions", &model.id)
            .await;
        self.ledger.start_processing(&ledger_request.id).await;

        let request_for_retry = request.clone();
        let invoke_result = self
            .select_and_invoke(&model.id, estimated_tokens, AUDIO_RETRY_BOUND, move |adapter, mapped_model| {
                let mut req = request_for_retry.clone();
                req.model = mapped_model;
                Box::pin(async move { adapter.audio_transcription(req).await })
            })
            .await;

        match invoke_result {
            Ok((response, provider_id, sub_provider_id)) => {
                let credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(expected_credits);
                if !user.is_master_admin {
                    let _ = self
                        .ledger
                        .deduct_credits(&user.id, credits, "audio_transcription", "/v1/audio/transcriptions", estimated_tokens)
                        .await;
                }
                self.ledger
                    .complete_request(&ledger_request.id, estimated_tokens, credits, provider_id, sub_provider_id, response.text.len() as u64, 200)
                    .await;
                Ok(response)
            }
            Err(e) => {
                self.ledger.fail_request(&ledger_request.id, 502).await;
                Err(e)
            }
        }
    }

    /// Image generation pipeline. Screening runs in `is_image` mode, which
    /// trips the content screener's stricter image-specific categories
    /// (SPEC_FULL.md §4.7).
    pub async fn generate_images(
        &self,
        user: &AuthenticatedUser,
        client: &ClientInfo,
        request: ImageRequest,
    ) -> Result<ImageResponse, OrchestratorError> {
        if request.prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("prompt must not be empty".into()));
        }
        let model_id = request
            .model
            .clone()
            .ok_or_else(|| OrchestratorError::InvalidRequest("model is required".into()))?;

        let model = self.validate_access(&model_id, "/v1/images/generations", user).await?;

        let screening = self
            .screener
            .screen(
                &request.prompt,
                &ScreeningContext {
                    model_id: &model.id,
                    plan: &user.plan,
                    is_rp_verified: user.is_rp_verified,
                    origin: client.origin.as_deref(),
                    is_image: true,
                },
            )
            .await;
        if screening.risk_level != RiskLevel::Safe {
            return Err(OrchestratorError::ContentBlocked { category: screening.category });
        }

        let count = request.n.unwrap_or(1).max(1) as u64;
        let estimated_tokens = IMAGE_TOKEN_ALLOWANCE * count;
        let discount = self.active_discount_multiplier(user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(user, client, expected_credits).await?;

        let ledger_request = self
            .ledger
            .create_request(Some(user.id.clone()), "/v1/images/generations", &model.id)
            .await;
        self.ledger.start_processing(&ledger_request.id).await;

        let request_for_retry = request.clone();
        let invoke_result = self
            .select_and_invoke(&model.id, estimated_tokens, IMAGE_RETRY_BOUND, move |adapter, mapped_model| {
                let mut req = request_for_retry.clone();
                req.model = Some(mapped_model);
                Box::pin(async move { adapter.generate_images(req).await })
            })
            .await;

        match invoke_result {
            Ok((response, provider_id, sub_provider_id)) => {
                let credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(expected_credits);
                if !user.is_master_admin {
                    let _ = self
                        .ledger
                        .deduct_credits(&user.id, credits, "generate_images", "/v1/images/generations", estimated_tokens)
                        .await;
                }
                self.ledger
                    .complete_request(&ledger_request.id, estimated_tokens, credits, provider_id, sub_provider_id, response.data.len() as u64, 200)
                    .await;
                Ok(response)
            }
            Err(e) => {
                self.ledger.fail_request(&ledger_request.id, 502).await;
                Err(e)
            }
        }
    }

    /// Non-streaming `responses` pipeline. Wire shape is `serde_json::Value`
    /// end to end (SPEC_FULL.md §6): the only field the orchestrator reaches
    /// into is `model`, for access checks and candidate selection, and
    /// `input`, for screening/token estimation.
    pub async fn create_response(
        &self,
        user: &AuthenticatedUser,
        client: &ClientInfo,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let model_id = request
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestratorError::InvalidRequest("model is required".into()))?
            .to_string();

        let model = self.validate_access(&model_id, "/v1/responses", user).await?;

        let content = extract_response_text(&request);
        let screening = self
            .screener
            .screen(
                &content,
                &ScreeningContext {
                    model_id: &model.id,
                    plan: &user.plan,
                    is_rp_verified: user.is_rp_verified,
                    origin: client.origin.as_deref(),
                    is_image: false,
                },
            )
            .await;
        if screening.risk_level != RiskLevel::Safe {
            return Err(OrchestratorError::ContentBlocked { category: screening.category });
        }

        let estimated_tokens = estimate_text_tokens(&content);
        let discount = self.active_discount_multiplier(user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(user, client, expected_credits).await?;

        let ledger_request = self.ledger.create_request(Some(user.id.clone()), "/v1/responses", &model.id).await;
        self.ledger.start_processing(&ledger_request.id).await;

        let request_for_retry = request.clone();
        let invoke_result = self
            .select_and_invoke(&model.id, estimated_tokens, RESPONSES_RETRY_BOUND, move |adapter, mapped_model| {
                let mut req = request_for_retry.clone();
                if let Some(obj) = req.as_object_mut() {
                    obj.insert("model".to_string(), serde_json::Value::String(mapped_model));
                }
                Box::pin(async move { adapter.create_response(req).await })
            })
            .await;

        match invoke_result {
            Ok((response, provider_id, sub_provider_id)) => {
                let output_tokens = response
                    .get("output_text")
                    .and_then(|v| v.as_str())
                    .map(|s| (s.len() as u64).div_ceil(4))
                    .unwrap_or(0);
                let total_tokens = estimated_tokens + output_tokens;
                let final_credits = self.catalog.calculate_credits(&model.id, total_tokens, discount).unwrap_or(expected_credits);

                if !user.is_master_admin {
                    let _ = self
                        .ledger
                        .deduct_credits(&user.id, final_credits, "create_response", "/v1/responses", total_tokens)
                        .await;
                }
                self.ledger
                    .complete_request(
                        &ledger_request.id,
                        total_tokens,
                        final_credits,
                        provider_id,
                        sub_provider_id,
                        serde_json::to_string(&response).map(|s| s.len() as u64).unwrap_or(0),
                        200,
                    )
                    .await;
                Ok(response)
            }
            Err(e) => {
                self.ledger.fail_request(&ledger_request.id, 502).await;
                error!(model = %model.id, "responses request exhausted all providers");
                Err(e)
            }
        }
    }

    /// Streaming `responses` pipeline. Each upstream event gets a
    /// monotonically increasing `sequence_number` field injected
    /// (SPEC_FULL.md §4.8, "streaming subcase ... per-event sequence
    /// numbers"), mirroring the real Responses API's own event envelope.
    pub async fn stream_create_response(
        &self,
        user: AuthenticatedUser,
        client: ClientInfo,
        request: serde_json::Value,
    ) -> Result<impl Stream<Item = Result<serde_json::Value, ProviderError>>, OrchestratorError> {
        let model_id = request
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestratorError::InvalidRequest("model is required".into()))?
            .to_string();

        let model = self.validate_access(&model_id, "/v1/responses", &user).await?;

        let content = extract_response_text(&request);
        let screening = self
            .screener
            .screen(
                &content,
                &ScreeningContext {
                    model_id: &model.id,
                    plan: &user.plan,
                    is_rp_verified: user.is_rp_verified,
                    origin: client.origin.as_deref(),
                    is_image: false,
                },
            )
            .await;
        if screening.risk_level != RiskLevel::Safe {
            return Err(OrchestratorError::ContentBlocked { category: screening.category });
        }

        let estimated_tokens = estimate_text_tokens(&content);
        let discount = self.active_discount_multiplier(&user, &model.id).await;
        let expected_credits = self.catalog.calculate_credits(&model.id, estimated_tokens, discount).unwrap_or(0);
        self.authorize(&user, &client, expected_credits).await?;

        let ledger_request = self.ledger.create_request(Some(user.id.clone()), "/v1/responses", &model.id).await;
        self.ledger.start_processing(&ledger_request.id).await;

        let mut excluded: HashSet<String> = HashSet::new();
        let mut established = None;
        for _ in 0..RESPONSES_RETRY_BOUND {
            let candidates = self.build_candidates(&model.id, estimated_tokens, false).await;
            let eligible = filter_excluded(candidates, &excluded);
            let Some(candidate) = select_candidate(&eligible, &self.tracker, &mut rand::thread_rng()) else {
                break;
            };
            let Some((adapter, _)) = self.derive_adapter_for(&candidate).await else {
                excluded.insert(candidate.id.clone());
                continue;
            };
            if let Some(sub_provider_id) = &candidate.sub_provider_id {
                if let Some(state) = self.sub_provider_states.get(sub_provider_id) {
                    if !state.write().await.reserve_capacity(estimated_tokens) {
                        excluded.insert(candidate.id.clone());
                        continue;
                    }
                }
            }
            let mut req = request.clone();
            if let Some(obj) = req.as_object_mut() {
                obj.insert("model".to_string(), serde_json::Value::String(adapter.get_mapped_model(&model.id)));
            }
            match adapter.stream_create_response(req).await {
                Ok(stream) => {
                    established = Some((stream, candidate));
                    break;
                }
                Err(_) => {
                    excluded.insert(candidate.id.clone());
                    continue;
                }
            }
        }

        let Some((mut upstream, candidate)) = established else {
            self.ledger.fail_request(&ledger_request.id, 502).await;
            return Err(OrchestratorError::AllProvidersFailed { last_message: "no stream established".into() });
        };

        let finalizer = StreamFinalizer {
            ledger: self.ledger.clone(),
            sub_provider_states: self.sub_provider_states.clone(),
            sub_provider_id: candidate.sub_provider_id.clone(),
            request_id: ledger_request.id.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        };
        let ledger = self.ledger.clone();
        let sub_provider_states = self.sub_provider_states.clone();
        let catalog = self.catalog.clone();
        let model_id = model.id.clone();
        let request_id = ledger_request.id.clone();
        let user_id = user.id.clone();
        let is_master_admin = user.is_master_admin;

        Ok(async_stream::stream! {
            use futures::StreamExt;
            let _finalizer = finalizer;
            let mut accumulated_len: u64 = 0;
            let mut failed = false;
            let mut sequence_number: u64 = 0;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(mut event) => {
                        if let Some(obj) = event.as_object_mut() {
                            obj.insert("sequence_number".to_string(), serde_json::Value::from(sequence_number));
                        }
                        sequence_number += 1;
                        accumulated_len += serde_json::to_string(&event).map(|s| s.len() as u64).unwrap_or(0);
                        yield Ok(event);
                    }
                    Err(e) => {
                        failed = true;
                        if let Some(sub_provider_id) = &candidate.sub_provider_id {
                            if let Some(state) = sub_provider_states.get(sub_provider_id) {
                                state.write().await.record_error(ErrorType::StreamFailure, None);
                            }
                        }
                        yield Err(e);
                        break;
                    }
                }
            }

            if _finalizer.claim() {
                if let Some(sub_provider_id) = &candidate.sub_provider_id {
                    if let Some(state) = sub_provider_states.get(sub_provider_id) {
                        let mut guard = state.write().await;
                        guard.release_capacity();
                        if !failed {
                            guard.record_success(0.0, estimated_tokens);
                        }
                    }
                }

                if failed {
                    ledger.fail_request(&request_id, 502).await;
                } else {
                    let output_tokens = accumulated_len.div_ceil(4);
                    let total_tokens = estimated_tokens + output_tokens;
                    let credits = catalog.calculate_credits(&model_id, total_tokens, discount).unwrap_or(0);
                    if !is_master_admin {
                        let _ = ledger.deduct_credits(&user_id, credits, "create_response_stream", "/v1/responses", total_tokens).await;
                    }
                    ledger
                        .complete_request(&request_id, total_tokens, credits, Some(candidate.provider_id.clone()), candidate.sub_provider_id.clone(), accumulated_len, 200)
                        .await;
                }
            }
        })
    }

    /// Looks up a live, multiplier-greater-than-one discount for this
    /// user+model, if any (SPEC_FULL.md §3 UserDiscount, §8 S6).
    async fn active_discount_multiplier(&self, user: &AuthenticatedUser, model_id: &str) -> Option<f64> {
        self.discounts
            .find_active_for_user_model(&user.id, model_id, std::time::SystemTime::now())
            .map(|d| d.multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use ultrafast_models_sdk::models::{Message, Role, Usage};

    #[test]
    fn token_estimate_uses_ceil_chars_over_four_plus_buffer() {
        let messages = vec![Message {
            role: Role::User,
            content: "a".repeat(40),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }];
        assert_eq!(estimate_tokens(&messages), 10 + 10);
    }

    struct StubSecretStore;
    impl SecretStore for StubSecretStore {
        fn decrypt(&self, secret: &EncryptedSecret) -> String {
            String::from_utf8_lossy(&secret.ciphertext).into_owned()
        }
    }

    /// Always succeeds chat completions with a fixed reply, so the retry
    /// loop's happy path can be exercised without a real vendor adapter.
    struct StubChatAdapter;

    #[async_trait]
    impl UpstreamAdapter for StubChatAdapter {
        fn name(&self) -> &str {
            "stub"
        }
        fn supports_model(&self, _model: &str) -> bool {
            true
        }
        fn supports_capability(&self, capability: &str) -> bool {
            capability == "chat"
        }
        async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                id: "resp-1".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model,
                choices: vec![],
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                system_fingerprint: None,
            })
        }

        async fn stream_chat_completion(
            &self,
            _request: ChatRequest,
        ) -> Result<crate::provider_registry::ChatStream, ProviderError> {
            use futures::stream;
            let chunks = vec![Ok(StreamChunk {
                id: "chunk-1".to_string(),
                object: "chat.completion.chunk".to_string(),
                created: 0,
                model: "stub".to_string(),
                choices: vec![],
            })];
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn create_response(&self, request: serde_json::Value) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!({"id": "resp-1", "model": request.get("model"), "output_text": "hi"}))
        }

        async fn stream_create_response(
            &self,
            _request: serde_json::Value,
        ) -> Result<crate::provider_registry::ResponseStream, ProviderError> {
            use futures::stream;
            let events = vec![
                Ok(serde_json::json!({"type": "response.output_text.delta", "delta": "hi"})),
                Ok(serde_json::json!({"type": "response.completed"})),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    fn blank_secret() -> EncryptedSecret {
        EncryptedSecret {
            ciphertext: b"sk-test".to_vec(),
            iv: Vec::new(),
            auth_tag: Vec::new(),
            master_key_ref: "test".to_string(),
        }
    }

    /// Wires a fully functional orchestrator around one always-healthy
    /// sub-provider backed by [`StubChatAdapter`], so the admission pipeline
    /// can be driven end to end without a network-speaking adapter.
    async fn fixture(model: crate::domain::Model) -> (Orchestrator, AuthenticatedUser, ClientInfo) {
        use crate::config::{CacheBackend, CacheConfig};
        use crate::content_screener::ModerationBackend;
        use crate::gateway_caching::CacheManager;
        use crate::provider_registry::{AdapterFactory, ModerationResult, ProviderRegistry};
        use crate::repository::{
            ApiRequestRepository, IdSequence, ProviderRepository, Repository, SubProviderRepository,
            UserDiscountRepository,
        };
        use crate::sub_provider::{SubProviderRegistry, SubProviderState};
        use std::collections::HashMap;
        use std::time::Duration;

        struct NeverFlag;
        #[async_trait]
        impl ModerationBackend for NeverFlag {
            async fn moderate(&self, _content: &str, _model: &str) -> Result<ModerationResult, String> {
                Ok(ModerationResult { scores: HashMap::new(), flagged: false })
            }
        }

        let model_id = model.id.clone();
        let catalog = Arc::new(ModelCatalog::new(vec![model]));

        let providers = Arc::new(ProviderRepository::new());
        providers
            .save(crate::domain::Provider {
                id: "stub-provider".into(),
                name: "stub".into(),
                base_url: String::new(),
                timeout: Duration::from_secs(60),
                supported_models: [model_id.clone()].into_iter().collect(),
                needs_sub_providers: true,
                is_active: true,
                health_status: crate::domain::HealthStatus::Healthy,
                success_count: 0,
                error_count: 0,
                avg_latency_ms: 0.0,
                consecutive_errors: 0,
                last_error_at: None,
            })
            .await;

        let sub_providers = Arc::new(SubProviderRepository::new());
        sub_providers
            .save(SubProvider {
                id: "sub-1".into(),
                provider_id: "stub-provider".into(),
                name: "sub-1".into(),
                encrypted_api_key: blank_secret(),
                enabled: true,
                priority: 0,
                weight: 1.0,
                timeout: Duration::from_secs(60),
                model_mapping: HashMap::new(),
                metadata: Default::default(),
                max_requests_per_minute: 1_000,
                max_requests_per_hour: 10_000,
                max_tokens_per_minute: 1_000_000,
                max_concurrent_requests: 10,
            })
            .await;

        let sub_provider_states = Arc::new(SubProviderRegistry::new());
        sub_provider_states.insert("sub-1", SubProviderState::new(1_000, 10_000, 1_000_000, 10));

        let mut factories: HashMap<String, AdapterFactory> = HashMap::new();
        factories.insert(
            "stub".into(),
            Arc::new(|_key, _mapping| Arc::new(StubChatAdapter) as Arc<dyn UpstreamAdapter>),
        );
        let provider_registry = Arc::new(ProviderRegistry::new(factories));

        let cache = Arc::new(
            CacheManager::new(CacheConfig {
                enabled: true,
                backend: CacheBackend::Memory,
                ttl: Duration::from_secs(60),
                max_size: 1000,
            })
            .await
            .unwrap(),
        );
        let screener = Arc::new(ContentScreener::new(cache.clone(), Arc::new(NeverFlag)));
        let ledger = Arc::new(CreditsLedger::new(
            Arc::new(ApiRequestRepository::new()),
            Arc::new(IdSequence::new("req")),
            cache,
        ));
        let discounts = Arc::new(UserDiscountRepository::new());

        let orchestrator = Orchestrator::new(
            catalog,
            providers,
            sub_providers,
            sub_provider_states,
            provider_registry,
            Arc::new(SelectionTracker::new()),
            screener,
            ledger,
            Arc::new(StubSecretStore),
            discounts,
        );

        let user = AuthenticatedUser {
            id: "u1".to_string(),
            plan: "free".to_string(),
            credits: 1_000_000,
            is_master_admin: false,
            is_rp_verified: false,
            ip_whitelist: Vec::new(),
            max_concurrent_requests: 10,
        };
        let client = ClientInfo::default();
        (orchestrator, user, client)
    }

    fn gated_model(id: &str) -> crate::domain::Model {
        crate::domain::Model {
            id: id.to_string(),
            owned_by: "anthropic".to_string(),
            endpoints: ["/v1/chat/completions"].into_iter().map(String::from).collect(),
            plan_requirements: ["basic"].into_iter().map(String::from).collect(),
            cost_type: crate::domain::CostType::PerToken,
            base_cost: 0,
            multiplier: 1.0,
            supports_streaming: true,
            supports_tool_calling: true,
        }
    }

    fn open_responses_model(id: &str) -> crate::domain::Model {
        crate::domain::Model {
            id: id.to_string(),
            owned_by: "openai".to_string(),
            endpoints: ["/v1/responses"].into_iter().map(String::from).collect(),
            plan_requirements: HashSet::new(),
            cost_type: crate::domain::CostType::PerToken,
            base_cost: 0,
            multiplier: 1.0,
            supports_streaming: true,
            supports_tool_calling: false,
        }
    }

    fn chat_request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: "hello".to_string(),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn free_plan_without_a_discount_is_denied_access_s6() {
        let (orchestrator, user, client) = fixture(gated_model("claude-opus-4-5-20251101")).await;
        let result = orchestrator
            .chat_completion(&user, &client, chat_request("claude-opus-4-5-20251101"))
            .await;
        assert!(matches!(result, Err(OrchestratorError::PlanAccessDenied)));
    }

    #[tokio::test]
    async fn a_live_discount_admits_a_plan_gated_model_s6() {
        let (orchestrator, user, client) = fixture(gated_model("claude-opus-4-5-20251101")).await;
        orchestrator
            .discounts
            .save(crate::domain::UserDiscount {
                id: "disc-1".into(),
                user_id: user.id.clone(),
                model_id: "claude-opus-4-5-20251101".into(),
                multiplier: 2.0,
                expires_at: std::time::SystemTime::now() + std::time::Duration::from_secs(3600),
                created_at: std::time::SystemTime::now(),
            })
            .await;

        let result = orchestrator
            .chat_completion(&user, &client, chat_request("claude-opus-4-5-20251101"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_before_any_admission_step_runs() {
        let (orchestrator, user, client) = fixture(gated_model("claude-opus-4-5-20251101")).await;
        let result = orchestrator
            .chat_completion(&user, &client, chat_request("nonexistent-model"))
            .await;
        assert!(matches!(result, Err(OrchestratorError::ModelNotFound)));
    }

    #[tokio::test]
    async fn successful_chat_completion_is_admitted_and_billed_once() {
        let mut open_model = gated_model("gpt-4o-mini");
        open_model.plan_requirements = HashSet::new();
        let (orchestrator, user, client) = fixture(open_model).await;

        let response = orchestrator
            .chat_completion(&user, &client, chat_request("gpt-4o-mini"))
            .await
            .expect("stub adapter should succeed");
        assert_eq!(response.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn create_response_routes_through_the_admission_pipeline() {
        let (orchestrator, user, client) = fixture(open_responses_model("gpt-5-mini")).await;
        let request = serde_json::json!({"model": "gpt-5-mini", "input": "hello there"});

        let response = orchestrator
            .create_response(&user, &client, request)
            .await
            .expect("stub adapter should succeed");
        assert_eq!(response["output_text"], "hi");
    }

    #[tokio::test]
    async fn stream_create_response_assigns_monotonic_sequence_numbers() {
        use futures::StreamExt;

        let (orchestrator, user, client) = fixture(open_responses_model("gpt-5-mini")).await;
        let request = serde_json::json!({"model": "gpt-5-mini", "input": "hello there"});

        let mut stream = orchestrator
            .stream_create_response(user, client, request)
            .await
            .expect("stub adapter should establish a stream")
            .boxed();

        let mut sequence_numbers = Vec::new();
        while let Some(event) = stream.next().await {
            let event = event.expect("stub stream should not error");
            sequence_numbers.push(event["sequence_number"].as_u64().unwrap());
        }
        assert_eq!(sequence_numbers, vec![0, 1]);
    }

    #[tokio::test]
    async fn abandoning_a_chat_stream_early_still_releases_capacity_p1() {
        use futures::StreamExt;

        let mut open_model = gated_model("gpt-4o-mini");
        open_model.plan_requirements = HashSet::new();
        let (orchestrator, user, client) = fixture(open_model).await;

        let stream = orchestrator
            .stream_chat_completion(user, client, chat_request("gpt-4o-mini"))
            .await
            .expect("stub adapter should establish a stream");

        // Drop the stream without polling it to exhaustion.
        drop(stream.boxed());

        // The Drop finalizer dispatches its cleanup via `tokio::spawn`; give
        // it a chance to run before asserting on the resulting state.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let state = orchestrator
            .sub_provider_states
            .get("sub-1")
            .expect("sub-1 state should exist");
        assert_eq!(state.read().await.current_concurrent_requests(), 0);
    }
}
