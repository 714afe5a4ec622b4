//! # HTTP Server Module
//!
//! This module provides the HTTP server setup and configuration for the Ultrafast Gateway.
//! It handles server initialization, middleware setup, routing, and application state management.
//!
//! ## Overview
//!
//! The server module is responsible for:
//! - **Server Initialization**: Setting up the HTTP server with Axum
//! - **Middleware Configuration**: Authentication, CORS, logging, and metrics
//! - **Route Registration**: API endpoints for chat, embeddings, and admin functions
//! - **Application State**: Shared state across all handlers
//!
//! ## Architecture
//!
//! The server uses Axum as the web framework with the following layers:
//!
//! 1. **Timeout Layer**: Request timeout handling
//! 2. **CORS Middleware**: Cross-origin resource sharing
//! 3. **Authentication Middleware**: API key and JWT validation
//! 4. **Logging Middleware**: Request/response logging
//! 5. **Metrics Middleware**: Performance monitoring
//!
//! ## API Endpoints
//!
//! ### Core API Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion API
//! - `POST /v1/embeddings` - Text embedding API
//! - `POST /v1/images/generations` - Image generation API
//! - `POST /v1/responses` - Responses API
//!
//! ### Admin Endpoints
//!
//! - `GET /health` - Health check endpoint
//! - `GET /metrics` - Performance metrics
//! - `GET /admin/providers` - Provider status
//! - `GET /admin/config` - Configuration status
//!
//! ## Usage
//!
//! ```rust
//! use ultrafast_gateway::server::create_server;
//! use ultrafast_gateway::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let app = create_server(config).await?;
//!
//!     // The server is ready to handle requests
//!     Ok(())
//! }
//! ```
//!
//! ## Middleware Stack
//!
//! The server applies middleware in the following order:
//!
//! 1. **Timeout**: Ensures requests don't hang indefinitely
//! 2. **CORS**: Handles cross-origin requests
//! 3. **Authentication**: Validates API keys and JWT tokens
//! 4. **Logging**: Records request/response details
//! 5. **Metrics**: Tracks performance metrics
//!
//! ## Application State
//!
//! The `AppState` struct contains shared state accessible to all handlers:
//!
//! - **Configuration**: Server and provider configuration
//! - **Cache Manager**: Redis and in-memory caching
//! - **Orchestrator**: Per-capability admission pipeline
//!
//! ## Error Handling
//!
//! The server includes comprehensive error handling:
//!
//! - **Timeout Errors**: Automatic request cancellation
//! - **Authentication Errors**: Proper HTTP status codes
//! - **Validation Errors**: Detailed error messages
//! - **Provider Errors**: Graceful fallback handling

use crate::bootstrap::{self, Bootstrapped, UserProfileStore};
use crate::config::Config;
use crate::content_screener::ContentScreener;
use crate::credits_ledger::CreditsLedger;
use crate::discount_scheduler::DiscountScheduler;
use crate::gateway_caching::CacheManager;
use crate::handlers;
use crate::health_monitor::{HealthMonitor, HEALTH_CHECK_INTERVAL};
use crate::load_balancer::SelectionTracker;
use crate::middleware::{auth_middleware, cors_middleware, logging_middleware, metrics_middleware};
use crate::model_catalog::ModelCatalog;
use crate::orchestrator::Orchestrator;
use crate::provider_registry::ProviderRegistry;
use crate::repository::Repositories;
use crate::sub_provider::SubProviderRegistry;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

/// Application state shared across all HTTP handlers.
///
/// Contains all the necessary components for handling requests:
/// configuration, caching, and the admission-pipeline orchestrator.
///
/// # Thread Safety
///
/// All fields are wrapped in `Arc` for thread-safe sharing across
/// multiple request handlers.
pub struct AppState {
    /// Server and provider configuration
    pub config: Arc<Config>,
    /// Redis and in-memory caching layer
    pub cache_manager: Arc<CacheManager>,
    /// Advertised model catalog (plan access, credit pricing)
    pub catalog: Arc<ModelCatalog>,
    /// Static per-vendor adapter factories, derived per sub-provider
    pub provider_registry: Arc<ProviderRegistry>,
    /// Fast-path rolling-window/circuit-breaker state per sub-provider
    pub sub_provider_states: Arc<SubProviderRegistry>,
    /// Selection-history tracker feeding the load balancer's exploration step
    pub tracker: Arc<SelectionTracker>,
    /// Moderation gate the orchestrator admits requests through
    pub screener: Arc<ContentScreener>,
    /// Credit ledger and request lifecycle tracker
    pub ledger: Arc<CreditsLedger>,
    /// Admission-pipeline orchestrator for chat/embeddings
    pub orchestrator: Arc<Orchestrator>,
    /// Circuit-breaker auto-recovery and provider health rollup
    pub health_monitor: Arc<HealthMonitor>,
    /// Daily discount rollout scheduler
    pub discount_scheduler: Arc<DiscountScheduler>,
    /// Resolves the authenticated identity behind a request
    pub user_profiles: Arc<dyn UserProfileStore>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            cache_manager: self.cache_manager.clone(),
            catalog: self.catalog.clone(),
            provider_registry: self.provider_registry.clone(),
            sub_provider_states: self.sub_provider_states.clone(),
            tracker: self.tracker.clone(),
            screener: self.screener.clone(),
            ledger: self.ledger.clone(),
            orchestrator: self.orchestrator.clone(),
            health_monitor: self.health_monitor.clone(),
            discount_scheduler: self.discount_scheduler.clone(),
            user_profiles: self.user_profiles.clone(),
        }
    }
}

/// Create and configure the HTTP server with all middleware and routes.
///
/// This function initializes all components of the gateway:
/// - Cache manager (Redis or in-memory)
/// - Authentication service and rate limiter
/// - Metrics collection system
/// - The C1-C9 business-logic components via [`bootstrap::bootstrap`]
/// - HTTP server with middleware stack and routes
///
/// # Arguments
///
/// * `config` - The gateway configuration containing all settings
///
/// # Returns
///
/// Returns a configured Axum router ready to handle HTTP requests.
///
/// # Errors
///
/// Returns an error if:
/// - Cache manager cannot be initialized
/// - Authentication service cannot be set up
/// - Metrics system cannot be initialized
///
/// # Example
///
/// ```rust
/// let config = Config::load("config.toml")?;
/// let app = create_server(config).await?;
/// ```
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    // Initialize cache manager with the configured backend
    let cache_manager = Arc::new(CacheManager::new(config.cache.clone()).await?);

    // Initialize authentication service and rate limiter with cache manager
    crate::auth::initialize_auth_service(config.auth.clone(), cache_manager.clone()).await;

    // Perform security sanity check for JWT secrets
    if let Err(e) = {
        // Create a temporary auth service instance for sanity checking
        let tmp = crate::auth::AuthService::new(config.auth.clone());
        tmp.sanity_check()
    } {
        return Err(anyhow::anyhow!(e.to_string()));
    }

    // Initialize rate limiter with cache manager for distributed rate limiting
    crate::auth::initialize_rate_limiter(cache_manager.clone()).await?;

    // Initialize metrics collector with configuration
    let metrics_config = crate::metrics::MetricsConfig {
        enabled: config.metrics.enabled,
        max_requests: config.metrics.max_requests,
        retention_duration: config.metrics.retention_duration,
        cleanup_interval: config.metrics.cleanup_interval,
    };
    crate::metrics::initialize_metrics(metrics_config).await;

    // Build the C1-C9 business-logic components (model catalog, load
    // balancer, content screener, credits ledger, orchestrator) and
    // reconcile the provider registry against persisted provider rows.
    let repos = Repositories::default();
    let Bootstrapped {
        catalog,
        provider_registry,
        sub_provider_states,
        tracker,
        screener,
        ledger,
        orchestrator,
        health_monitor,
        discount_scheduler,
        user_profiles,
    } = bootstrap::bootstrap(&repos, cache_manager.clone()).await;

    // Background ticks mirroring the teacher's `ws_manager.start_background_tasks`
    // fixed-interval spawn shape.
    if config.ops.auto_recovery_enabled {
        let health_monitor = health_monitor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                health_monitor.tick().await;
            }
        });
    }
    {
        let discount_scheduler = discount_scheduler.clone();
        let discount_check_interval = config.ops.discount_check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(discount_check_interval);
            loop {
                interval.tick().await;
                discount_scheduler.tick().await;
            }
        });
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        cache_manager,
        catalog,
        provider_registry,
        sub_provider_states,
        tracker,
        screener,
        ledger,
        orchestrator,
        health_monitor,
        discount_scheduler,
        user_profiles,
    };

    // Warn if permissive CORS is used in production-like settings
    if config.server.cors.enabled && config.server.cors.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!(
            "CORS is enabled with wildcard origins. This is unsafe for production. Configure explicit allowed_origins."
        );
    }

    // Create the main router. The entire `/v1/*` capability surface is
    // routed through the orchestrator's admission pipeline (validate ->
    // screen -> authorize -> reserve -> call -> record -> bill).
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(handlers::orchestrated_chat_completions),
        )
        .route("/v1/embeddings", post(handlers::orchestrated_embeddings))
        .route(
            "/v1/images/generations",
            post(handlers::orchestrated_image_generations),
        )
        .route(
            "/v1/audio/transcriptions",
            post(handlers::orchestrated_audio_transcriptions),
        )
        .route(
            "/v1/audio/speech",
            post(handlers::orchestrated_text_to_speech),
        )
        .route("/v1/responses", post(handlers::orchestrated_responses))
        .route("/v1/models", get(handlers::list_models))
        // Health and admin endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/metrics/prometheus", get(handlers::prometheus_metrics))
        .route("/admin/providers", get(handlers::list_providers))
        .route("/admin/config", get(handlers::get_config))
        .route(
            "/admin/circuit-breakers",
            get(handlers::get_circuit_breaker_metrics),
        )
        .layer(
            ServiceBuilder::new()
                .layer(cors_middleware(&config.server.cors)) // 1. CORS (first)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                )) // 2. Authentication (includes rate limiting)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    logging_middleware,
                )) // 3. Logging (only authenticated requests)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                )) // 4. Metrics (only authenticated requests)
                .layer(TimeoutLayer::new(config.server.timeout)), // 5. Timeout (last)
        )
        .with_state(state);

    Ok(app)
}
