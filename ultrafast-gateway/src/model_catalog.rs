//! # Model Catalog (C1)
//!
//! A read-only-after-startup registry of [`Model`] entries with the access
//! and credit-calculation operations SPEC_FULL.md §4.1 defines. Grounded on
//! the teacher's `DashMap`-backed registries (e.g. `RateLimiter`'s
//! in-memory state), though this catalog never mutates after
//! [`ModelCatalog::new`] returns.

use dashmap::DashMap;
use std::collections::HashSet;

use crate::domain::{CostType, Model};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogError {
    UnknownModel,
}

pub struct ModelCatalog {
    models: DashMap<String, Model>,
}

impl ModelCatalog {
    /// Builds a catalog from a fixed set of models, validating each one.
    /// Panics on a duplicate id or an invariant violation: both are
    /// startup-time configuration bugs, not runtime conditions.
    pub fn new(models: Vec<Model>) -> Self {
        let map = DashMap::new();
        for model in models {
            model.validate().expect("invalid catalog entry");
            if map.contains_key(&model.id) {
                panic!("duplicate model id in catalog: {}", model.id);
            }
            map.insert(model.id.clone(), model);
        }
        Self { models: map }
    }

    pub fn by_id(&self, id: &str) -> Option<Model> {
        self.models.get(id).map(|m| m.clone())
    }

    pub fn all(&self) -> Vec<Model> {
        self.models.iter().map(|m| m.clone()).collect()
    }

    /// True when `plan` is one of the model's required plans, or the model
    /// declares no plan requirement at all (open access).
    pub fn has_access(&self, model_id: &str, plan: &str) -> bool {
        match self.by_id(model_id) {
            Some(m) => m.plan_requirements.is_empty() || m.plan_requirements.contains(plan),
            None => false,
        }
    }

    pub fn supports_endpoint(&self, model_id: &str, path: &str) -> bool {
        match self.by_id(model_id) {
            Some(m) => m.endpoints.contains(path),
            None => false,
        }
    }

    /// Models a given plan has direct (undiscounted) access to.
    pub fn models_for_plan(&self, plan: &str) -> HashSet<String> {
        self.models
            .iter()
            .filter(|m| m.plan_requirements.is_empty() || m.plan_requirements.contains(plan))
            .map(|m| m.id.clone())
            .collect()
    }

    /// `credits = round(tokens * multiplier)` for per-token models, or the
    /// flat `base_cost` for fixed-cost models, divided by `discount` when a
    /// multiplier greater than 1.0 applies. Rounding is half-away-from-zero
    /// to an integer at each stage (SPEC_FULL.md §4.1).
    pub fn calculate_credits(
        &self,
        model_id: &str,
        tokens: u64,
        discount: Option<f64>,
    ) -> Result<u64, CatalogError> {
        let model = self.by_id(model_id).ok_or(CatalogError::UnknownModel)?;

        let base_credits = match model.cost_type {
            CostType::PerToken => round_half_away_from_zero(tokens as f64 * model.multiplier),
            CostType::Fixed => model.base_cost,
        };

        let credits = match discount {
            Some(d) if d > 1.0 => round_half_away_from_zero(base_credits as f64 / d),
            _ => base_credits,
        };

        Ok(credits)
    }
}

/// Rounds to the nearest integer, ties away from zero, clamped to `u64`.
/// Credit amounts are never negative in practice (tokens/multipliers/
/// discounts are all non-negative), but the clamp keeps this total.
fn round_half_away_from_zero(value: f64) -> u64 {
    if value <= 0.0 {
        0
    } else {
        value.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn per_token_model() -> Model {
        Model {
            id: "gpt-4o-mini".into(),
            owned_by: "openai".into(),
            endpoints: ["/v1/chat/completions"].into_iter().map(String::from).collect(),
            plan_requirements: HashSet::new(),
            cost_type: CostType::PerToken,
            base_cost: 0,
            multiplier: 0.25,
            supports_streaming: true,
            supports_tool_calling: true,
        }
    }

    fn fixed_model() -> Model {
        Model {
            id: "dall-e-3".into(),
            owned_by: "openai".into(),
            endpoints: ["/v1/images/generations"].into_iter().map(String::from).collect(),
            plan_requirements: ["basic", "pro"].into_iter().map(String::from).collect(),
            cost_type: CostType::Fixed,
            base_cost: 40,
            multiplier: 1.0,
            supports_streaming: false,
            supports_tool_calling: false,
        }
    }

    #[test]
    fn per_token_credit_formula_matches_s1() {
        let catalog = ModelCatalog::new(vec![per_token_model()]);
        // S1: 10 estimated input + 20 output tokens, multiplier 0.25 => 8 credits.
        let credits = catalog.calculate_credits("gpt-4o-mini", 30, None).unwrap();
        assert_eq!(credits, 8);
    }

    #[test]
    fn fixed_cost_model_ignores_token_count() {
        let catalog = ModelCatalog::new(vec![fixed_model()]);
        assert_eq!(catalog.calculate_credits("dall-e-3", 1, None).unwrap(), 40);
        assert_eq!(
            catalog.calculate_credits("dall-e-3", 100_000, None).unwrap(),
            40
        );
    }

    #[test]
    fn discount_divides_computed_cost_p10() {
        let catalog = ModelCatalog::new(vec![per_token_model()]);
        let undiscounted = catalog.calculate_credits("gpt-4o-mini", 30, None).unwrap();
        let discounted = catalog
            .calculate_credits("gpt-4o-mini", 30, Some(2.0))
            .unwrap();
        assert_eq!(
            discounted,
            round_half_away_from_zero(undiscounted as f64 / 2.0)
        );
    }

    #[test]
    fn discount_of_one_or_less_is_ignored() {
        let catalog = ModelCatalog::new(vec![per_token_model()]);
        let plain = catalog.calculate_credits("gpt-4o-mini", 30, None).unwrap();
        let with_noop_discount = catalog
            .calculate_credits("gpt-4o-mini", 30, Some(1.0))
            .unwrap();
        assert_eq!(plain, with_noop_discount);
    }

    #[test]
    fn plan_access_respects_requirements() {
        let catalog = ModelCatalog::new(vec![fixed_model()]);
        assert!(!catalog.has_access("dall-e-3", "free"));
        assert!(catalog.has_access("dall-e-3", "basic"));
    }

    #[test]
    fn unknown_model_has_no_access_and_no_endpoint_support() {
        let catalog = ModelCatalog::new(vec![fixed_model()]);
        assert!(!catalog.has_access("nonexistent", "pro"));
        assert!(!catalog.supports_endpoint("nonexistent", "/v1/images/generations"));
    }

    #[test]
    #[should_panic(expected = "duplicate model id")]
    fn panics_on_duplicate_model_id() {
        ModelCatalog::new(vec![per_token_model(), per_token_model()]);
    }
}
