//! # Provider Bootstrapper (C10)
//!
//! Builds the static [`AdapterFactory`] list and reconciles the
//! [`ProviderRepository`] against it at startup (SPEC_FULL.md §4.10,
//! §9: "deep registry reflection -> static configuration").
//!
//! Grounded directly on the teacher's `providers::create_provider` match
//! arm (`ultrafast-models-sdk/src/providers/mod.rs`), which maps a
//! provider name to a `Box<dyn Provider>` constructor. [`ProviderAdapterBridge`]
//! wraps one of those teacher providers and re-exposes it as an
//! [`UpstreamAdapter`], so `openai`/`anthropic`/`azure`/`google`/`gemini`/
//! `cohere`/`groq`/`mistral`/`perplexity`/`ollama`/`openrouter`/`custom`
//! keep their existing vendor wire logic; capabilities the teacher's
//! `Provider` trait has no slot for (moderation, responses, video) fall
//! through to `UpstreamAdapter`'s own defaults.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ultrafast_models_sdk::error::ProviderError;
use ultrafast_models_sdk::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ImageRequest, ImageResponse, AudioRequest, AudioResponse, SpeechRequest, SpeechResponse};
use ultrafast_models_sdk::providers::{self as sdk_providers, Provider, ProviderConfig};

use crate::content_screener::{ContentScreener, ModerationBackend};
use crate::credits_ledger::CreditsLedger;
use crate::discount_scheduler::{DiscountScheduler, UserDirectory, UserSummary};
use crate::domain::{AuthenticatedUser, EncryptedSecret, HealthStatus, Provider as ProviderRow};
use crate::gateway_caching::CacheManager;
use crate::health_monitor::HealthMonitor;
use crate::load_balancer::SelectionTracker;
use crate::model_catalog::ModelCatalog;
use crate::orchestrator::{Orchestrator, SecretStore};
use crate::provider_registry::{AdapterFactory, ChatStream, ModerationResult, ProviderRegistry, UpstreamAdapter};
use crate::repository::{ProviderRepository, Repositories, Repository};
use crate::sub_provider::SubProviderRegistry;

/// Every provider name the teacher's `create_provider` factory recognizes.
/// Kept as one place to extend when a new vendor adapter is onboarded.
pub const SUPPORTED_PROVIDER_NAMES: &[&str] = &[
    "openai",
    "anthropic",
    "azure",
    "google",
    "gemini",
    "cohere",
    "groq",
    "mistral",
    "perplexity",
    "ollama",
    "openrouter",
    "custom",
];

/// Wraps a teacher `Box<dyn Provider>` behind the gateway's own
/// [`UpstreamAdapter`] contract. Delegates every operation the wrapped
/// provider already implements; capabilities the teacher trait never
/// defined (moderation, OpenAI-style responses, video) fall through to
/// `UpstreamAdapter`'s default `FeatureNotSupported` methods.
struct ProviderAdapterBridge {
    inner: Box<dyn Provider>,
    model_mapping: HashMap<String, String>,
}

#[async_trait]
impl UpstreamAdapter for ProviderAdapterBridge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_model(&self, model: &str) -> bool {
        self.model_mapping.contains_key(model) || self.inner.supported_models().iter().any(|m| m == model)
    }

    fn supports_capability(&self, capability: &str) -> bool {
        match capability {
            "chat" => true,
            "streaming" => self.inner.supports_streaming(),
            "function_calling" => self.inner.supports_function_calling(),
            _ => false,
        }
    }

    fn get_mapped_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.inner.chat_completion(request).await
    }

    async fn stream_chat_completion(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        self.inner.stream_chat_completion(request).await
    }

    async fn create_embeddings(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        self.inner.embedding(request).await
    }

    async fn text_to_speech(&self, request: SpeechRequest) -> Result<SpeechResponse, ProviderError> {
        self.inner.text_to_speech(request).await
    }

    async fn audio_transcription(&self, request: AudioRequest) -> Result<AudioResponse, ProviderError> {
        self.inner.audio_transcription(request).await
    }

    async fn generate_images(&self, request: ImageRequest) -> Result<ImageResponse, ProviderError> {
        self.inner.image_generation(request).await
    }
}

/// Builds one `ProviderConfig` for a derived adapter: a bare name/key pair
/// plus the sub-provider's model mapping, with the teacher's own defaults
/// for timeout/retries (SPEC_FULL.md §4.3 -- derived adapters are
/// short-lived, so they don't need rate-limit or header customization
/// beyond what the vendor config already provides).
fn base_config(name: &str, api_key: &str, model_mapping: HashMap<String, String>) -> ProviderConfig {
    let mut config = ProviderConfig::new(name, api_key).with_timeout(Duration::from_secs(60));
    config.model_mapping = model_mapping;
    config
}

fn factory_for(name: &'static str) -> AdapterFactory {
    Arc::new(move |api_key: &str, model_mapping: HashMap<String, String>| {
        let config = base_config(name, api_key, model_mapping.clone());
        let adapter: Arc<dyn UpstreamAdapter> = match sdk_providers::create_provider(config) {
            Ok(inner) => Arc::new(ProviderAdapterBridge { inner, model_mapping }),
            Err(err) => {
                warn!(provider = name, error = %err, "falling back to custom provider shape");
                let fallback_config = base_config(name, api_key, model_mapping.clone());
                let inner = sdk_providers::create_provider(ProviderConfig {
                    name: "custom".to_string(),
                    ..fallback_config
                })
                .expect("custom provider construction is infallible for a bare config");
                Arc::new(ProviderAdapterBridge { inner, model_mapping })
            }
        };
        adapter
    })
}

/// Builds the static [`ProviderRegistry`] covering every name in
/// [`SUPPORTED_PROVIDER_NAMES`].
pub fn build_provider_registry() -> ProviderRegistry {
    let mut factories: HashMap<String, AdapterFactory> = HashMap::new();
    for name in SUPPORTED_PROVIDER_NAMES {
        factories.insert((*name).to_string(), factory_for(name));
    }
    ProviderRegistry::new(factories)
}

/// Seeds a [`Provider`] row for every registered adapter name that the
/// repository doesn't already carry, so the load balancer and health
/// monitor always have a domain record to roll health/stats into
/// (SPEC_FULL.md §3: "Provider ... created on bootstrap sync from the
/// adapter registry"). Existing rows (and their accumulated stats) are
/// left untouched.
pub async fn reconcile_providers(registry: &ProviderRegistry, repo: &ProviderRepository) {
    for name in registry.provider_names() {
        if repo.find_by_id(&name).await.is_some() {
            continue;
        }
        let row = ProviderRow {
            id: name.clone(),
            name: name.clone(),
            base_url: String::new(),
            timeout: Duration::from_secs(60),
            supported_models: Default::default(),
            needs_sub_providers: true,
            is_active: true,
            health_status: HealthStatus::Healthy,
            success_count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
            consecutive_errors: 0,
            last_error_at: None,
        };
        info!(provider = %name, "seeding provider record at bootstrap");
        repo.save(row).await;
    }
}

/// Decrypts an [`EncryptedSecret`] by treating its ciphertext as plaintext
/// UTF-8 (lossily). Real key management is an external collaborator
/// (SPEC_FULL.md §1); this keeps the orchestrator constructible without one,
/// the same way the teacher's `create_server` wires an Ollama provider in
/// when no providers are configured rather than refusing to start.
struct DevSecretStore;

impl SecretStore for DevSecretStore {
    fn decrypt(&self, secret: &EncryptedSecret) -> String {
        String::from_utf8_lossy(&secret.ciphertext).into_owned()
    }
}

/// Resolves the [`AuthenticatedUser`] behind a request. The real identity
/// store (plan, credits, admin flags) is an external collaborator
/// (SPEC_FULL.md §1); this seam lets the HTTP layer stay agnostic of it.
#[async_trait]
pub trait UserProfileStore: Send + Sync {
    async fn profile(&self, user_id: &str) -> Option<AuthenticatedUser>;
}

/// Grants every user a generous, unrestricted profile. Stands in for a real
/// user directory until one is wired up.
struct DevUserProfileStore;

#[async_trait]
impl UserProfileStore for DevUserProfileStore {
    async fn profile(&self, user_id: &str) -> Option<AuthenticatedUser> {
        Some(AuthenticatedUser {
            id: user_id.to_string(),
            plan: "free".to_string(),
            credits: 1_000_000,
            is_master_admin: false,
            is_rp_verified: false,
            ip_whitelist: Vec::new(),
            max_concurrent_requests: 100,
        })
    }
}

/// Empty user directory: the discount scheduler's tick becomes a no-op
/// until a real user store is wired up.
struct DevUserDirectory;

#[async_trait]
impl UserDirectory for DevUserDirectory {
    async fn list_users(&self) -> Vec<UserSummary> {
        Vec::new()
    }
}

/// Never flags content. Stands in for a moderation-capable adapter until
/// one is wired up; real deployments should supply a backend that calls
/// out to an actual moderation model.
struct NoFlagModerationBackend;

#[async_trait]
impl ModerationBackend for NoFlagModerationBackend {
    async fn moderate(&self, _content: &str, _model: &str) -> Result<ModerationResult, String> {
        Ok(ModerationResult {
            scores: HashMap::new(),
            flagged: false,
        })
    }
}

/// Seed catalog entries covering the discount scheduler's eligible-model
/// allowlist plus a couple of non-chat capabilities, standing in for a
/// persisted model catalog until one exists.
fn seed_models() -> Vec<crate::domain::Model> {
    use crate::domain::CostType;
    use std::collections::HashSet;

    let chat = |id: &str| crate::domain::Model {
        id: id.to_string(),
        owned_by: id.split('-').next().unwrap_or("unknown").to_string(),
        endpoints: ["/v1/chat/completions", "/v1/embeddings", "/v1/responses"]
            .into_iter()
            .map(String::from)
            .collect(),
        plan_requirements: HashSet::new(),
        cost_type: CostType::PerToken,
        base_cost: 0,
        multiplier: 1.0,
        supports_streaming: true,
        supports_tool_calling: true,
    };

    vec![
        chat("gpt-4o"),
        chat("gpt-4o-mini"),
        chat("claude-opus-4-5-20251101"),
        chat("claude-sonnet-4-5-20251022"),
        chat("gemini-2.5-pro"),
    ]
}

/// Every component `server::create_server` needs to wire the orchestrator
/// path in alongside the legacy client-based handlers.
pub struct Bootstrapped {
    pub catalog: Arc<ModelCatalog>,
    pub provider_registry: Arc<ProviderRegistry>,
    pub sub_provider_states: Arc<SubProviderRegistry>,
    pub tracker: Arc<SelectionTracker>,
    pub screener: Arc<ContentScreener>,
    pub ledger: Arc<CreditsLedger>,
    pub orchestrator: Arc<Orchestrator>,
    pub health_monitor: Arc<HealthMonitor>,
    pub discount_scheduler: Arc<DiscountScheduler>,
    pub user_profiles: Arc<dyn UserProfileStore>,
}

/// Builds every C1-C9 component and reconciles the provider registry, so
/// `create_server` has one call to make instead of hand-wiring a dozen
/// constructors (SPEC_FULL.md §4.10).
pub async fn bootstrap(repos: &Repositories, cache: Arc<CacheManager>) -> Bootstrapped {
    let catalog = Arc::new(ModelCatalog::new(seed_models()));
    let provider_registry = Arc::new(build_provider_registry());
    reconcile_providers(&provider_registry, &repos.providers).await;

    let sub_provider_states = Arc::new(SubProviderRegistry::new());
    let tracker = Arc::new(SelectionTracker::new());
    let screener = Arc::new(ContentScreener::new(cache.clone(), Arc::new(NoFlagModerationBackend)));
    let ledger = Arc::new(CreditsLedger::new(repos.requests.clone(), repos.request_ids.clone(), cache));

    let orchestrator = Arc::new(Orchestrator::new(
        catalog.clone(),
        repos.providers.clone(),
        repos.sub_providers.clone(),
        sub_provider_states.clone(),
        provider_registry.clone(),
        tracker.clone(),
        screener.clone(),
        ledger.clone(),
        Arc::new(DevSecretStore),
        repos.discounts.clone(),
    ));

    let health_monitor = Arc::new(HealthMonitor::new(repos.providers.clone(), sub_provider_states.clone()));
    let discount_scheduler = Arc::new(DiscountScheduler::new(
        repos.discounts.clone(),
        repos.discount_ids.clone(),
        catalog.clone(),
        Arc::new(DevUserDirectory),
    ));

    Bootstrapped {
        catalog,
        provider_registry,
        sub_provider_states,
        tracker,
        screener,
        ledger,
        orchestrator,
        health_monitor,
        discount_scheduler,
        user_profiles: Arc::new(DevUserProfileStore),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_supported_provider_name() {
        let registry = build_provider_registry();
        for name in SUPPORTED_PROVIDER_NAMES {
            assert!(registry.has_provider(name), "missing factory for {name}");
        }
    }

    #[test]
    fn derived_openai_adapter_reports_the_requested_model_mapping() {
        let registry = build_provider_registry();
        let mut mapping = HashMap::new();
        mapping.insert("gpt-4o-mini".to_string(), "gpt-4o-mini-2024-07-18".to_string());
        let adapter = registry
            .derive_adapter("openai", "sk-test", mapping)
            .expect("openai factory should be registered");
        assert_eq!(
            adapter.get_mapped_model("gpt-4o-mini"),
            "gpt-4o-mini-2024-07-18"
        );
    }

    #[tokio::test]
    async fn reconcile_seeds_a_row_per_registered_provider_once() {
        let registry = build_provider_registry();
        let repo = ProviderRepository::new();

        reconcile_providers(&registry, &repo).await;
        let seeded = repo.find_many().await.len();
        assert_eq!(seeded, SUPPORTED_PROVIDER_NAMES.len());

        // A second reconcile pass must not duplicate or reset existing rows.
        if let Some(mut openai) = repo.find_by_id("openai").await {
            openai.success_count = 42;
            repo.save(openai).await;
        }
        reconcile_providers(&registry, &repo).await;
        assert_eq!(repo.find_many().await.len(), SUPPORTED_PROVIDER_NAMES.len());
        assert_eq!(repo.find_by_id("openai").await.unwrap().success_count, 42);
    }

    #[tokio::test]
    async fn bootstrap_wires_every_component_and_seeds_the_catalog() {
        use crate::config::{CacheBackend, CacheConfig};

        let repos = Repositories::default();
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

        let bootstrapped = bootstrap(&repos, cache).await;

        assert!(bootstrapped.catalog.by_id("gpt-4o").is_some());
        for name in SUPPORTED_PROVIDER_NAMES {
            assert!(bootstrapped.provider_registry.has_provider(name));
        }
        assert_eq!(repos.providers.find_many().await.len(), SUPPORTED_PROVIDER_NAMES.len());
        assert!(bootstrapped.user_profiles.profile("u1").await.is_some());
    }
}
