//! # Core Domain Model
//!
//! Plain records shared by the catalog, registry, load balancer, screener,
//! ledger, and orchestrator. These mirror the aggregates a real deployment
//! would keep in a persistent store; here they are owned in-memory by
//! [`crate::repository`] implementations that stand in for that store.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

/// How a model's usage is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostType {
    PerToken,
    Fixed,
}

/// A catalog entry describing one advertised model.
///
/// Immutable once loaded. See `hasAccess`/`supportsEndpoint`/`calculateCredits`
/// on [`crate::model_catalog::ModelCatalog`] for the operations defined over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub owned_by: String,
    pub endpoints: HashSet<String>,
    pub plan_requirements: HashSet<String>,
    pub cost_type: CostType,
    pub base_cost: u64,
    pub multiplier: f64,
    pub supports_streaming: bool,
    pub supports_tool_calling: bool,
}

impl Model {
    /// Validates the invariants a catalog entry must satisfy: a non-empty
    /// endpoint set, and a positive `base_cost` for fixed-cost models.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err(format!("model '{}' declares no endpoints", self.id));
        }
        if self.cost_type == CostType::Fixed && self.base_cost == 0 {
            return Err(format!(
                "model '{}' is fixed-cost but has base_cost == 0",
                self.id
            ));
        }
        Ok(())
    }
}

/// Aggregate health classification for a [`Provider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A named upstream family (e.g. "openai"). See [`crate::provider_registry`]
/// for the adapter this identity is bound to at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub timeout: std::time::Duration,
    pub supported_models: HashSet<String>,
    pub needs_sub_providers: bool,
    pub is_active: bool,
    pub health_status: HealthStatus,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub consecutive_errors: u32,
    pub last_error_at: Option<SystemTime>,
}

impl Provider {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// The three circuit breaker states a [`SubProvider`] can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// One `(minuteStamp, count)` bucket of a rolling per-minute window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowBucket {
    pub minute_stamp: u64,
    pub count: u64,
}

/// A tenant-owned API-key credential bound to one [`Provider`].
///
/// Carries both static configuration (limits, weight, model mapping) and
/// the mutable fast-path state described in SPEC_FULL.md §4.2. All mutation
/// of the fast-path fields happens through
/// [`crate::sub_provider::SubProviderState`], never directly on this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProvider {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    /// Ciphertext + iv + authTag + masterKeyRef; decrypted only on hot
    /// demand by the secret-store collaborator (out of core scope).
    pub encrypted_api_key: EncryptedSecret,
    pub enabled: bool,
    pub priority: i32,
    pub weight: f64,
    pub timeout: std::time::Duration,
    /// Advertised model id -> upstream model id. Empty means identity.
    pub model_mapping: HashMap<String, String>,
    pub metadata: SubProviderMetadata,

    pub max_requests_per_minute: u64,
    pub max_requests_per_hour: u64,
    pub max_tokens_per_minute: u64,
    pub max_concurrent_requests: u64,
}

/// Narrowed metadata record (SPEC_FULL.md §9: "stringly-typed metadata
/// should be narrowed to a concrete record").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubProviderMetadata {
    pub is_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub master_key_ref: String,
}

/// A live per-(user, model) discount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDiscount {
    pub id: String,
    pub user_id: String,
    pub model_id: String,
    pub multiplier: f64,
    pub expires_at: SystemTime,
    pub created_at: SystemTime,
}

impl UserDiscount {
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at > now && self.multiplier > 1.0
    }
}

/// Request lifecycle status for an [`ApiRequest`] ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The per-call ledger row tracked by [`crate::credits_ledger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub id: String,
    pub user_id: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    pub status: RequestStatus,
    pub total_tokens: u64,
    pub credits: u64,
    pub provider_id: Option<String>,
    pub sub_provider_id: Option<String>,
    pub response_size: u64,
    pub http_status: Option<u16>,
}

/// The post-authentication identity the orchestrator receives. Produced by
/// an external collaborator (SPEC_FULL.md §1); never constructed by the
/// core itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub plan: String,
    pub credits: u64,
    pub is_master_admin: bool,
    pub is_rp_verified: bool,
    pub ip_whitelist: Vec<String>,
    pub max_concurrent_requests: u32,
}

/// Client-supplied context carried alongside [`AuthenticatedUser`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(cost_type: CostType, base_cost: u64, endpoints: &[&str]) -> Model {
        Model {
            id: "m".into(),
            owned_by: "openai".into(),
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            plan_requirements: HashSet::new(),
            cost_type,
            base_cost,
            multiplier: 1.0,
            supports_streaming: true,
            supports_tool_calling: false,
        }
    }

    #[test]
    fn rejects_model_with_no_endpoints() {
        assert!(model(CostType::PerToken, 0, &[]).validate().is_err());
    }

    #[test]
    fn rejects_fixed_cost_model_with_zero_base_cost() {
        assert!(model(CostType::Fixed, 0, &["/v1/images/generations"])
            .validate()
            .is_err());
    }

    #[test]
    fn accepts_well_formed_model() {
        assert!(model(CostType::PerToken, 0, &["/v1/chat/completions"])
            .validate()
            .is_ok());
    }
}
