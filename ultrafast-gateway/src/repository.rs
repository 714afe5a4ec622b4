//! # In-Memory Repositories
//!
//! The persistent store is an external collaborator (SPEC_FULL.md §1): the
//! core only needs `save`/`findById`/`findMany`/`delete`/`count` style
//! contracts over plain records. This module provides `DashMap`-backed
//! in-memory implementations that satisfy those contracts, standing in for
//! a real database the way a test double would, so the rest of the crate
//! can depend on the trait rather than a storage technology.
//!
//! Grounded on the teacher's preference for `Arc<dyn Trait>` collaborators
//! (`providers::Provider`) and `DashMap`-keyed registries
//! (`auth::RateLimiter::in_memory_state`).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::domain::{ApiRequest, Provider, SubProvider, UserDiscount};

/// Generic async CRUD contract shared by every aggregate repository.
#[async_trait]
pub trait Repository<T: Clone + Send + Sync>: Send + Sync {
    async fn save(&self, value: T) -> T;
    async fn find_by_id(&self, id: &str) -> Option<T>;
    async fn find_many(&self) -> Vec<T>;
    async fn delete(&self, id: &str) -> bool;
    async fn count(&self) -> usize;
}

macro_rules! dashmap_repository {
    ($name:ident, $item:ty, $id_field:ident) => {
        #[derive(Default)]
        pub struct $name {
            rows: DashMap<String, $item>,
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    rows: DashMap::new(),
                }
            }
        }

        #[async_trait]
        impl Repository<$item> for $name {
            async fn save(&self, value: $item) -> $item {
                self.rows.insert(value.$id_field.clone(), value.clone());
                value
            }

            async fn find_by_id(&self, id: &str) -> Option<$item> {
                self.rows.get(id).map(|r| r.clone())
            }

            async fn find_many(&self) -> Vec<$item> {
                self.rows.iter().map(|r| r.clone()).collect()
            }

            async fn delete(&self, id: &str) -> bool {
                self.rows.remove(id).is_some()
            }

            async fn count(&self) -> usize {
                self.rows.len()
            }
        }
    };
}

dashmap_repository!(ProviderRepository, Provider, id);
dashmap_repository!(SubProviderRepository, SubProvider, id);
dashmap_repository!(ApiRequestRepository, ApiRequest, id);

/// Discount repository additionally supports the lookups §4.6/§4.8 need:
/// active discounts for one user, and expired rows to purge.
#[derive(Default)]
pub struct UserDiscountRepository {
    rows: DashMap<String, UserDiscount>,
}

impl UserDiscountRepository {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    pub fn find_active_by_user_id(&self, user_id: &str, now: SystemTime) -> Vec<UserDiscount> {
        self.rows
            .iter()
            .filter(|r| r.user_id == user_id && r.is_live(now))
            .map(|r| r.clone())
            .collect()
    }

    pub fn find_active_for_user_model(
        &self,
        user_id: &str,
        model_id: &str,
        now: SystemTime,
    ) -> Option<UserDiscount> {
        self.rows
            .iter()
            .find(|r| r.user_id == user_id && r.model_id == model_id && r.is_live(now))
            .map(|r| r.clone())
    }

    pub fn find_expired(&self, now: SystemTime) -> Vec<UserDiscount> {
        self.rows
            .iter()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.clone())
            .collect()
    }

    /// Deletes every existing discount for `user_id` (§4.6 step 2: "delete
    /// user's existing active discounts") before inserting the new draw.
    pub fn delete_all_for_user(&self, user_id: &str) {
        self.rows.retain(|_, v| v.user_id != user_id);
    }
}

#[async_trait]
impl Repository<UserDiscount> for UserDiscountRepository {
    async fn save(&self, value: UserDiscount) -> UserDiscount {
        self.rows.insert(value.id.clone(), value.clone());
        value
    }

    async fn find_by_id(&self, id: &str) -> Option<UserDiscount> {
        self.rows.get(id).map(|r| r.clone())
    }

    async fn find_many(&self) -> Vec<UserDiscount> {
        self.rows.iter().map(|r| r.clone()).collect()
    }

    async fn delete(&self, id: &str) -> bool {
        self.rows.remove(id).is_some()
    }

    async fn count(&self) -> usize {
        self.rows.len()
    }
}

/// Monotonically increasing id source used in place of a database sequence.
#[derive(Default)]
pub struct IdSequence {
    next: AtomicU64,
    prefix: &'static str,
}

impl IdSequence {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            next: AtomicU64::new(1),
            prefix,
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

/// Every repository the core depends on, bundled so it can be threaded
/// through the orchestrator and schedulers as one handle (mirrors the
/// teacher's `AppState` bundling pattern in `server.rs`).
#[derive(Clone)]
pub struct Repositories {
    pub providers: Arc<ProviderRepository>,
    pub sub_providers: Arc<SubProviderRepository>,
    pub requests: Arc<ApiRequestRepository>,
    pub discounts: Arc<UserDiscountRepository>,
    pub request_ids: Arc<IdSequence>,
    pub discount_ids: Arc<IdSequence>,
}

impl Default for Repositories {
    fn default() -> Self {
        Self {
            providers: Arc::new(ProviderRepository::new()),
            sub_providers: Arc::new(SubProviderRepository::new()),
            requests: Arc::new(ApiRequestRepository::new()),
            discounts: Arc::new(UserDiscountRepository::new()),
            request_ids: Arc::new(IdSequence::new("req")),
            discount_ids: Arc::new(IdSequence::new("disc")),
        }
    }
}
