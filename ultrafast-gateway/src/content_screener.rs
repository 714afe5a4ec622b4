//! # Content Screener (C7)
//!
//! Moderation gate the orchestrator calls before admitting a chat/responses
//! request, or an image prompt, per SPEC_FULL.md §4.7: verdict cache,
//! lumina short-circuit, origin blacklist, minors-sexual critical
//! threshold, and a lower fail-closed threshold for image content.
//!
//! The verdict cache reuses the teacher's retained `gateway_caching::CacheManager`
//! (`get`/`set` by string key) rather than a bespoke cache type, keyed
//! exactly as the spec names it: `"security:" + sha256(content)`.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::gateway_caching::CacheManager;
use crate::provider_registry::ModerationResult;

const VERDICT_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);
const CRITICAL_MINOR_THRESHOLD: f64 = 0.85;
const MEDIUM_THRESHOLD: f64 = 0.85;
const IMAGE_THRESHOLD: f64 = 0.65;
const MODERATION_MODEL: &str = "omni-moderation-latest";
const MODERATION_MAX_ATTEMPTS: u32 = 5;

const ORIGIN_BLACKLIST: &[&str] = &[
    "janitor", "spicychat", "crushon", "replika", "chub", "silly", "tavern",
];

const SCAN_CATEGORIES: &[&str] = &[
    "sexual", "sexual/minors", "hate", "hate/threatening", "harassment",
    "harassment/threatening", "self-harm", "self-harm/intent",
    "self-harm/instructions", "violence", "violence/graphic",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskLevel {
    Safe,
    Medium,
    Critical,
    High,
}

#[derive(Debug, Clone)]
pub struct ScreeningVerdict {
    pub risk_level: RiskLevel,
    pub category: Option<String>,
    pub should_disable_user: bool,
    pub max_score: f64,
}

impl ScreeningVerdict {
    fn safe() -> Self {
        Self {
            risk_level: RiskLevel::Safe,
            category: None,
            should_disable_user: false,
            max_score: 0.0,
        }
    }

    fn is_blocked(&self) -> bool {
        !matches!(self.risk_level, RiskLevel::Safe)
    }
}

#[derive(Debug, Clone)]
pub struct ScreeningContext<'a> {
    pub model_id: &'a str,
    pub plan: &'a str,
    pub is_rp_verified: bool,
    pub origin: Option<&'a str>,
    pub is_image: bool,
}

/// What the screener needs from an upstream moderation call. The
/// orchestrator supplies this closure so the screener stays independent of
/// load-balancer/provider-registry wiring and is unit-testable with a
/// stub.
#[async_trait::async_trait]
pub trait ModerationBackend: Send + Sync {
    async fn moderate(&self, content: &str, model: &str) -> Result<ModerationResult, String>;
}

pub struct ContentScreener {
    cache: Arc<CacheManager>,
    backend: Arc<dyn ModerationBackend>,
}

impl ContentScreener {
    pub fn new(cache: Arc<CacheManager>, backend: Arc<dyn ModerationBackend>) -> Self {
        Self { cache, backend }
    }

    pub async fn screen(&self, content: &str, ctx: &ScreeningContext<'_>) -> ScreeningVerdict {
        let cache_key = format!("security:{}", sha256_hex(content));
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Some(verdict) = verdict_from_json(&cached) {
                return verdict;
            }
        }

        let verdict = self.screen_uncached(content, ctx).await;
        self.cache
            .set(&cache_key, verdict_to_json(&verdict), Some(VERDICT_TTL))
            .await;
        verdict
    }

    async fn screen_uncached(&self, content: &str, ctx: &ScreeningContext<'_>) -> ScreeningVerdict {
        // Step 2: lumina short-circuit.
        if ctx.model_id.to_lowercase().contains("lumina") {
            return ScreeningVerdict::safe();
        }

        // Step 3: origin blacklist, free-plan + non-RP-verified only.
        if ctx.plan == "free" && !ctx.is_rp_verified {
            if let Some(origin) = ctx.origin {
                if !origin.is_empty()
                    && ORIGIN_BLACKLIST.iter().any(|bad| origin.to_lowercase().contains(bad))
                {
                    return ScreeningVerdict {
                        risk_level: RiskLevel::Medium,
                        category: Some("blacklisted_origin".to_string()),
                        should_disable_user: false,
                        max_score: 1.0,
                    };
                }
            }
        }

        // Step 4: call moderation, retrying up to 5 attempts.
        let mut last_err = None;
        let mut scores: Option<HashMap<String, f64>> = None;
        for _ in 0..MODERATION_MAX_ATTEMPTS {
            match self.backend.moderate(content, MODERATION_MODEL).await {
                Ok(result) => {
                    scores = Some(result.scores);
                    last_err = None;
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let Some(scores) = scores else {
            if ctx.is_image {
                // Step 8: moderation failure on image content fails closed.
                return ScreeningVerdict {
                    risk_level: RiskLevel::High,
                    category: Some("moderation_unavailable".to_string()),
                    should_disable_user: false,
                    max_score: 1.0,
                };
            }
            tracing::warn!(error = ?last_err, "moderation unavailable, treating chat content as safe");
            return ScreeningVerdict::safe();
        };

        let threshold = if ctx.is_image { IMAGE_THRESHOLD } else { MEDIUM_THRESHOLD };

        // Step 5: critical minors-sexual threshold, always checked first
        // regardless of plan/verification.
        let minor_score = scores
            .get("sexual/minors")
            .or_else(|| scores.get("sexual-minors"))
            .copied()
            .unwrap_or(0.0);
        if minor_score >= CRITICAL_MINOR_THRESHOLD {
            return ScreeningVerdict {
                risk_level: RiskLevel::Critical,
                category: Some("sexual/minors".to_string()),
                should_disable_user: true,
                max_score: minor_score,
            };
        }

        // Step 7: RP-verified users only fail on the critical check above.
        if ctx.is_rp_verified && !ctx.is_image {
            return ScreeningVerdict::safe();
        }

        // Step 6 / step 8: scan the fixed category list at the applicable
        // threshold.
        if ctx.is_image || ctx.plan == "free" {
            let mut flagged: Option<(String, f64)> = None;
            for category in SCAN_CATEGORIES {
                if let Some(score) = scores.get(*category) {
                    if *score >= threshold && flagged.as_ref().map(|(_, s)| *score > *s).unwrap_or(true) {
                        flagged = Some((category.to_string(), *score));
                    }
                }
            }
            if let Some((category, score)) = flagged {
                let risk_level = if ctx.is_image { RiskLevel::High } else { RiskLevel::Medium };
                return ScreeningVerdict {
                    risk_level,
                    category: Some(category),
                    should_disable_user: false,
                    max_score: score,
                };
            }
        }

        ScreeningVerdict::safe()
    }
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn verdict_to_json(verdict: &ScreeningVerdict) -> serde_json::Value {
    serde_json::json!({
        "risk_level": format!("{:?}", verdict.risk_level),
        "category": verdict.category,
        "should_disable_user": verdict.should_disable_user,
        "max_score": verdict.max_score,
    })
}

fn verdict_from_json(value: &serde_json::Value) -> Option<ScreeningVerdict> {
    let risk_level = match value.get("risk_level")?.as_str()? {
        "Safe" => RiskLevel::Safe,
        "Medium" => RiskLevel::Medium,
        "Critical" => RiskLevel::Critical,
        "High" => RiskLevel::High,
        _ => return None,
    };
    Some(ScreeningVerdict {
        risk_level,
        category: value.get("category").and_then(|c| c.as_str()).map(String::from),
        should_disable_user: value.get("should_disable_user")?.as_bool()?,
        max_score: value.get("max_score")?.as_f64()?,
    })
}
