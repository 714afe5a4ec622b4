//! # Discount Scheduler (C6)
//!
//! Fires once per CET calendar day in the `[18:00, 18:05)` tick window,
//! rolling a random eligible-model discount for every user
//! (SPEC_FULL.md §4.6).
//!
//! Grounded on the teacher's `start_health_monitoring` interval-loop shape
//! for the tick itself, and on `start_auth_cleanup_task`'s reentry guard
//! (`ultrafast-gateway/src/auth.rs`, a fixed-interval `tokio::spawn` loop
//! that checks state size before acting) for the `last_discount_date`
//! debounce here.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::UserDiscount;
use crate::model_catalog::ModelCatalog;
use crate::repository::{IdSequence, Repository, UserDiscountRepository};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DISCOUNT_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Hard-coded model id allowlist eligible for the daily discount
/// (SPEC_FULL.md §4.6 step 2). Restricted to chat-capable models that
/// plausibly carry a per-token multiplier worth discounting.
pub const ELIGIBLE_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "claude-opus-4-5-20251101",
    "claude-sonnet-4-5-20251022",
    "gemini-2.5-pro",
];

/// Minimal view of a user the scheduler needs: enough to build the
/// eligible-model list and write the discount row against a user id. The
/// real user store is an external collaborator (SPEC_FULL.md §1).
#[derive(Debug, Clone)]
pub struct UserSummary {
    pub id: String,
    pub plan: String,
    pub is_rp_verified: bool,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Vec<UserSummary>;
}

/// CET is UTC+1, or UTC+2 during DST, approximated here as `month in
/// [March, October]` (SPEC_FULL.md §4.6, acknowledged imprecise — see §9).
fn cet_offset_hours(utc: DateTime<Utc>) -> i64 {
    if (3..=10).contains(&utc.month()) {
        2
    } else {
        1
    }
}

fn cet_now(utc: DateTime<Utc>) -> DateTime<Utc> {
    utc + ChronoDuration::hours(cet_offset_hours(utc))
}

/// True when the current CET local time falls in `[18:00, 18:05)`.
fn in_fire_window(utc: DateTime<Utc>) -> bool {
    let cet = cet_now(utc);
    cet.hour() == 18 && cet.minute() < 5
}

fn cet_date_string(utc: DateTime<Utc>) -> String {
    cet_now(utc).format("%Y-%m-%d").to_string()
}

pub struct DiscountScheduler {
    discounts: Arc<UserDiscountRepository>,
    discount_ids: Arc<IdSequence>,
    catalog: Arc<ModelCatalog>,
    users: Arc<dyn UserDirectory>,
    last_discount_date: Mutex<Option<String>>,
}

impl DiscountScheduler {
    pub fn new(
        discounts: Arc<UserDiscountRepository>,
        discount_ids: Arc<IdSequence>,
        catalog: Arc<ModelCatalog>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            discounts,
            discount_ids,
            catalog,
            users,
            last_discount_date: Mutex::new(None),
        }
    }

    /// One 5-min tick. Always purges expired rows; only rolls new discounts
    /// inside the daily CET fire window, and only once per CET date.
    pub async fn tick(&self) {
        self.tick_at(Utc::now()).await
    }

    /// Testable entry point taking an explicit "now", so CET window/DST
    /// behavior can be exercised without waiting on the wall clock.
    pub async fn tick_at(&self, utc_now: DateTime<Utc>) {
        let now = SystemTime::now();
        for expired in self.discounts.find_expired(now) {
            self.discounts.delete(&expired.id).await;
        }

        if !in_fire_window(utc_now) {
            return;
        }

        let today = cet_date_string(utc_now);
        {
            let mut guard = self.last_discount_date.lock().await;
            if guard.as_deref() == Some(today.as_str()) {
                return;
            }
            *guard = Some(today.clone());
        }

        let users = self.users.list_users().await;
        let mut rng = rand::thread_rng();
        for user in users {
            let eligible = self.eligible_models_for(&user);
            if eligible.is_empty() {
                continue;
            }
            let model_id = eligible[rng.gen_range(0..eligible.len())].clone();
            let multiplier = (rng.gen_range(1.5_f64..=3.0_f64) * 10.0).round() / 10.0;

            self.discounts.delete_all_for_user(&user.id);
            let created_at = now;
            let expires_at = created_at + DISCOUNT_DURATION;
            let discount = UserDiscount {
                id: self.discount_ids.next_id(),
                user_id: user.id.clone(),
                model_id,
                multiplier,
                expires_at,
                created_at,
            };
            self.discounts.save(discount).await;
        }

        info!(cet_date = %today, "discount rollout completed");
    }

    /// Builds the eligible-model list for one user (SPEC_FULL.md §4.6 step
    /// 2). RP-verified users always see the full allowlist; everyone else
    /// gets it intersected with their plan's accessible models, falling
    /// back to the full list if that intersection is empty.
    fn eligible_models_for(&self, user: &UserSummary) -> Vec<String> {
        if user.is_rp_verified {
            return ELIGIBLE_MODELS.iter().map(|s| s.to_string()).collect();
        }

        let plan_models = self.catalog.models_for_plan(&user.plan);
        let intersected: Vec<String> = ELIGIBLE_MODELS
            .iter()
            .filter(|m| plan_models.contains(**m))
            .map(|s| s.to_string())
            .collect();

        if intersected.is_empty() {
            ELIGIBLE_MODELS.iter().map(|s| s.to_string()).collect()
        } else {
            intersected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CostType, Model};
    use chrono::TimeZone;
    use std::collections::HashSet;

    struct FixedUsers(Vec<UserSummary>);

    #[async_trait]
    impl UserDirectory for FixedUsers {
        async fn list_users(&self) -> Vec<UserSummary> {
            self.0.clone()
        }
    }

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(ModelCatalog::new(vec![Model {
            id: "gpt-4o".into(),
            owned_by: "openai".into(),
            endpoints: ["/v1/chat/completions"].into_iter().map(String::from).collect(),
            plan_requirements: HashSet::new(),
            cost_type: CostType::PerToken,
            base_cost: 0,
            multiplier: 1.0,
            supports_streaming: true,
            supports_tool_calling: true,
        }]))
    }

    fn scheduler(users: Vec<UserSummary>) -> DiscountScheduler {
        DiscountScheduler::new(
            Arc::new(UserDiscountRepository::new()),
            Arc::new(IdSequence::new("disc")),
            catalog(),
            Arc::new(FixedUsers(users)),
        )
    }

    #[test]
    fn cet_offset_is_two_hours_during_dst_months() {
        let march = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let january = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(cet_offset_hours(march), 2);
        assert_eq!(cet_offset_hours(january), 1);
    }

    #[test]
    fn fire_window_matches_cet_18_00_to_18_05() {
        // 16:02 UTC in April is 18:02 CET (DST offset +2).
        let inside = Utc.with_ymd_and_hms(2026, 4, 1, 16, 2, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 4, 1, 16, 6, 0).unwrap();
        assert!(in_fire_window(inside));
        assert!(!in_fire_window(outside));
    }

    #[tokio::test]
    async fn rollout_assigns_exactly_one_discount_per_user_s5() {
        let users = vec![
            UserSummary { id: "u1".into(), plan: "free".into(), is_rp_verified: false },
            UserSummary { id: "u2".into(), plan: "pro".into(), is_rp_verified: false },
            UserSummary { id: "u3".into(), plan: "free".into(), is_rp_verified: true },
        ];
        let sched = scheduler(users);
        let fire_time = Utc.with_ymd_and_hms(2026, 4, 1, 16, 2, 0).unwrap();

        sched.tick_at(fire_time).await;

        let all = sched.discounts.find_many().await;
        assert_eq!(all.len(), 3);
        for d in &all {
            assert!(d.multiplier >= 1.5 && d.multiplier <= 3.0);
        }
    }

    #[tokio::test]
    async fn second_tick_within_same_window_is_a_no_op() {
        let users = vec![UserSummary { id: "u1".into(), plan: "free".into(), is_rp_verified: false }];
        let sched = scheduler(users);
        let fire_time = Utc.with_ymd_and_hms(2026, 4, 1, 16, 2, 0).unwrap();

        sched.tick_at(fire_time).await;
        let first_pass = sched.discounts.find_many().await;
        let first_id = first_pass[0].id.clone();

        sched.tick_at(fire_time + ChronoDuration::minutes(1)).await;
        let second_pass = sched.discounts.find_many().await;

        assert_eq!(second_pass.len(), 1);
        assert_eq!(second_pass[0].id, first_id);
    }

    #[tokio::test]
    async fn non_verified_user_falls_back_to_full_list_when_plan_intersection_empty() {
        let restricted_catalog = Arc::new(ModelCatalog::new(vec![Model {
            id: "gpt-4o".into(),
            owned_by: "openai".into(),
            endpoints: ["/v1/chat/completions"].into_iter().map(String::from).collect(),
            plan_requirements: ["pro"].into_iter().map(String::from).collect(),
            cost_type: CostType::PerToken,
            base_cost: 0,
            multiplier: 1.0,
            supports_streaming: true,
            supports_tool_calling: true,
        }]));
        let users = vec![UserSummary { id: "u1".into(), plan: "free".into(), is_rp_verified: false }];
        let sched = DiscountScheduler::new(
            Arc::new(UserDiscountRepository::new()),
            Arc::new(IdSequence::new("disc")),
            restricted_catalog,
            Arc::new(FixedUsers(users)),
        );
        let fire_time = Utc.with_ymd_and_hms(2026, 4, 1, 16, 2, 0).unwrap();

        sched.tick_at(fire_time).await;

        let all = sched.discounts.find_many().await;
        assert_eq!(all.len(), 1);
        assert!(ELIGIBLE_MODELS.contains(&all[0].model_id.as_str()));
    }
}
