//! # Ultrafast Models SDK
//!
//! The upstream-facing half of the gateway: wire types (`ChatRequest`,
//! `EmbeddingRequest`, ...), the per-vendor `Provider` adapters, the
//! generic circuit breaker, and the `ClientError`/`ProviderError`
//! taxonomy. The gateway crate's `provider_registry::UpstreamAdapter`
//! wraps a `Provider` from this crate per sub-provider, so this crate
//! never makes routing, credit, or admission decisions itself -- it
//! only speaks the vendor wire formats.
//!
//! ## Overview
//!
//! This crate provides:
//! - **Unified Request/Response Types**: One shape per capability across
//!   every vendor (chat, embeddings, images, audio, speech)
//! - **Provider Trait**: The per-vendor adapter contract
//!   (`providers::Provider`) that each vendor module implements
//! - **Circuit Breaker**: Generic failure-threshold/open-timeout state
//!   machine reused per sub-provider by the gateway
//! - **Error Taxonomy**: `ClientError`/`ProviderError` with an
//!   `ErrorType` classification used for circuit-breaker trip decisions
//!
//! ## Supported Providers
//!
//! - **OpenAI**: GPT-4, GPT-3.5, and other OpenAI models
//! - **Anthropic**: Claude-3, Claude-2, and Claude Instant
//! - **Google / Gemini**: Gemini Pro, Gemini Pro Vision, and PaLM
//! - **Azure OpenAI**: Azure-hosted OpenAI models
//! - **Ollama**: Local and remote Ollama instances
//! - **Mistral AI**: Mistral 7B, Mixtral, and other models
//! - **Cohere**: Command, Command R, and other Cohere models
//! - **Groq**, **Perplexity**, **OpenRouter**: Additional hosted vendors
//! - **Custom Providers**: Extensible provider system for any OpenAI-shaped endpoint
//!
//! ## Building a Provider
//!
//! ```rust
//! use ultrafast_models_sdk::providers::{create_provider, ProviderConfig};
//!
//! let config = ProviderConfig::new("openai", "your-openai-key");
//! let provider = create_provider(config)?;
//! # Ok::<(), ultrafast_models_sdk::ProviderError>(())
//! ```
//!
//! ## Contributing
//!
//! We welcome contributions! Please see our contributing guide for details on:
//!
//! - Code style and formatting
//! - Testing requirements
//! - Documentation standards
//! - Pull request process
//!
//! ## License
//!
//! This project is licensed under the MIT License - see the [LICENSE](LICENSE) file for details.
//!
//! ## Support
//!
//! For support and questions:
//!
//! - **Issues**: [GitHub Issues](https://github.com/techgopal/ultrafast-ai-gateway/issues)
//! - **Discussions**: [GitHub Discussions](https://github.com/techgopal/ultrafast-ai-gateway/discussions)
//! - **Documentation**: [Project Wiki](https://github.com/techgopal/ultrafast-ai-gateway/wiki)

pub mod cache;
pub mod circuit_breaker;
pub mod common;
pub mod error;
pub mod models;
pub mod providers;
pub mod routing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{ClientError, ProviderError};
pub use models::{
    AudioRequest, AudioResponse, ChatRequest, ChatResponse, Choice, EmbeddingRequest,
    EmbeddingResponse, ImageRequest, ImageResponse, Message, Role, SpeechRequest, SpeechResponse,
    Usage,
};
pub use providers::{
    create_provider_with_circuit_breaker, Provider, ProviderConfig, ProviderMetrics,
};
pub use routing::{Condition, RoutingRule, RoutingStrategy};

/// Result type for SDK operations.
///
/// This is a convenience type alias for SDK operations that can fail.
/// It uses `ClientError` as the error type.
pub type Result<T> = std::result::Result<T, ClientError>;
