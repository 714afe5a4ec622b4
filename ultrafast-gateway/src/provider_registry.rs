//! # Provider Registry (C3)
//!
//! Maps a provider name to an [`UpstreamAdapter`] trait object, exactly as
//! the teacher's `providers::create_provider` factory maps a config name to
//! a `Box<dyn Provider>` (`ultrafast-models-sdk/src/providers/mod.rs`).
//! Extended per SPEC_FULL.md §4.3/§6: the trait gains the capability
//! operations the spec's adapter contract table names (moderation,
//! responses, video), and the registry can produce a **derived adapter**
//! bound to one sub-provider's decrypted API key and model mapping.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use ultrafast_models_sdk::error::ProviderError;
use ultrafast_models_sdk::models::{
    AudioRequest, AudioResponse, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
    ImageRequest, ImageResponse, SpeechRequest, SpeechResponse, StreamChunk,
};

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Value, ProviderError>> + Send>>;

/// Category scores returned by a moderation call, keyed by category name
/// (e.g. `"sexual/minors"`), plus the aggregate flag (SPEC_FULL.md §6).
#[derive(Debug, Clone, Default)]
pub struct ModerationResult {
    pub scores: HashMap<String, f64>,
    pub flagged: bool,
}

/// Video capability response shapes. These lean on `serde_json::Value`
/// rather than fully-typed structs: the spec treats adapter wire formats as
/// out of scope to redesign (SPEC_FULL.md §1), and video generation's JSON
/// shape varies the most across vendors of anything in the contract table.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: Option<String>,
    pub model: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct VideoResponse {
    pub id: String,
    pub status: String,
    pub payload: Value,
}

/// The egress contract every upstream-speaking adapter implements
/// (SPEC_FULL.md §6). Default-erroring methods mirror the teacher's
/// `Provider` trait defaults for `embedding`/`image_generation`/
/// `audio_transcription`/`text_to_speech`, so a new capability (video) can
/// be added here without breaking existing adapter implementations.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports_model(&self, model: &str) -> bool;
    fn supports_capability(&self, capability: &str) -> bool;
    /// Advertised model id -> upstream model id, or the input unchanged if
    /// this adapter has no mapping for it.
    fn get_mapped_model(&self, model: &str) -> String {
        model.to_string()
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    async fn stream_chat_completion(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "streaming".to_string(),
        })
    }

    /// OpenAI "responses" API equivalent. Value-typed for the same reason
    /// as the video operations above.
    async fn create_response(&self, request: Value) -> Result<Value, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "responses".to_string(),
        })
    }

    /// Streaming counterpart to [`Self::create_response`], mirroring
    /// `stream_chat_completion`'s default-erroring shape.
    async fn stream_create_response(&self, request: Value) -> Result<ResponseStream, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "responses_streaming".to_string(),
        })
    }

    async fn moderate_content(
        &self,
        input: &str,
        model: &str,
    ) -> Result<ModerationResult, ProviderError> {
        let _ = (input, model);
        Err(ProviderError::FeatureNotSupported {
            feature: "moderation".to_string(),
        })
    }

    async fn create_embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "embeddings".to_string(),
        })
    }

    async fn text_to_speech(&self, request: SpeechRequest) -> Result<SpeechResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "text_to_speech".to_string(),
        })
    }

    async fn audio_transcription(&self, request: AudioRequest) -> Result<AudioResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "audio_transcription".to_string(),
        })
    }

    async fn generate_images(&self, request: ImageRequest) -> Result<ImageResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "image_generation".to_string(),
        })
    }

    async fn edit_images(&self, request: ImageRequest) -> Result<ImageResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "image_editing".to_string(),
        })
    }

    async fn create_video(&self, request: VideoRequest) -> Result<VideoResponse, ProviderError> {
        let _ = request;
        Err(ProviderError::FeatureNotSupported {
            feature: "video".to_string(),
        })
    }

    async fn get_video_status(&self, id: &str) -> Result<VideoResponse, ProviderError> {
        let _ = id;
        Err(ProviderError::FeatureNotSupported {
            feature: "video".to_string(),
        })
    }

    async fn download_video(&self, id: &str) -> Result<Vec<u8>, ProviderError> {
        let _ = id;
        Err(ProviderError::FeatureNotSupported {
            feature: "video".to_string(),
        })
    }

    async fn list_videos(&self) -> Result<Vec<VideoResponse>, ProviderError> {
        Err(ProviderError::FeatureNotSupported {
            feature: "video".to_string(),
        })
    }

    async fn delete_video(&self, id: &str) -> Result<(), ProviderError> {
        let _ = id;
        Err(ProviderError::FeatureNotSupported {
            feature: "video".to_string(),
        })
    }

    async fn remix_video(&self, id: &str, prompt: &str) -> Result<VideoResponse, ProviderError> {
        let _ = (id, prompt);
        Err(ProviderError::FeatureNotSupported {
            feature: "video".to_string(),
        })
    }
}

/// Constructs a fresh adapter for one provider name, given a decrypted API
/// key and (optional) per-sub-provider model mapping. Registered at
/// bootstrap as a static list (SPEC_FULL.md §9: "deep registry reflection
/// -> static configuration"), never discovered by directory scan.
pub type AdapterFactory =
    Arc<dyn Fn(&str, HashMap<String, String>) -> Arc<dyn UpstreamAdapter> + Send + Sync>;

/// Maps a provider name to its adapter factory, and memoizes an
/// API-key-less default instance for calls that don't need sub-provider
/// credentials (e.g. moderation against a house key).
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: Arc<HashMap<String, AdapterFactory>>,
}

impl ProviderRegistry {
    pub fn new(factories: HashMap<String, AdapterFactory>) -> Self {
        Self {
            factories: Arc::new(factories),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds a **derived adapter**: a fresh instance bound to this one
    /// sub-provider's decrypted API key and model mapping, so per-tenant
    /// credentials never leak into a shared, long-lived instance
    /// (SPEC_FULL.md §4.3).
    pub fn derive_adapter(
        &self,
        provider_name: &str,
        api_key: &str,
        model_mapping: HashMap<String, String>,
    ) -> Option<Arc<dyn UpstreamAdapter>> {
        self.factories
            .get(provider_name)
            .map(|factory| factory(api_key, model_mapping))
    }
}
