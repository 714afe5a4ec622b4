//! # Credits Ledger & Request Tracker (C9)
//!
//! Atomic credit debit plus the append-then-complete `ApiRequest` lifecycle
//! (SPEC_FULL.md §4.9).
//!
//! `deductCredits`'s compare-and-update is a per-user `Mutex<u64>` inside a
//! `DashMap<String, Mutex<u64>>`, the same per-key-lock granularity the
//! teacher uses for `RateLimiter::in_memory_state: DashMap<String,
//! RateLimitState>` (`ultrafast-gateway/src/auth.rs`). The idempotency
//! guard reuses the retained `CacheManager`, keyed by request id.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::domain::{ApiRequest, RequestStatus};
use crate::gateway_caching::CacheManager;
use crate::repository::{ApiRequestRepository, IdSequence, Repository};

const IDEMPOTENCY_TTL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductError {
    InsufficientCredits,
}

pub struct CreditsLedger {
    balances: DashMap<String, Arc<Mutex<u64>>>,
    requests: Arc<ApiRequestRepository>,
    request_ids: Arc<IdSequence>,
    idempotency_cache: Arc<CacheManager>,
}

impl CreditsLedger {
    pub fn new(
        requests: Arc<ApiRequestRepository>,
        request_ids: Arc<IdSequence>,
        idempotency_cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            balances: DashMap::new(),
            requests,
            request_ids,
            idempotency_cache,
        }
    }

    /// Seeds (or resets) a user's tracked balance. The authoritative balance
    /// lives in the external user store (SPEC_FULL.md §1); this mirrors it
    /// locally so concurrent deductions serialize without a round trip.
    pub fn set_balance(&self, user_id: &str, credits: u64) {
        let lock = self
            .balances
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .value()
            .clone();
        *lock.lock().expect("balance lock poisoned") = credits;
    }

    pub async fn balance(&self, user_id: &str) -> u64 {
        let lock = self
            .balances
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .value()
            .clone();
        *lock.lock().expect("balance lock poisoned")
    }

    /// Atomically subtracts `credits` from `user_id`'s balance. Never
    /// overdraws: two concurrent callers serialize on the same per-user
    /// lock, so the balance never drops below zero (SPEC_FULL.md §4.9, §8
    /// P3/P9).
    pub async fn deduct_credits(
        &self,
        user_id: &str,
        credits: u64,
        _reason: &str,
        _endpoint: &str,
        _tokens: u64,
    ) -> Result<u64, DeductError> {
        let lock = self
            .balances
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .value()
            .clone();
        let mut balance = lock.lock().expect("balance lock poisoned");
        if *balance < credits {
            return Err(DeductError::InsufficientCredits);
        }
        *balance -= credits;
        Ok(*balance)
    }

    pub async fn create_request(&self, user_id: Option<String>, endpoint: &str, model: &str) -> ApiRequest {
        let request = ApiRequest {
            id: self.request_ids.next_id(),
            user_id,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            started_at: SystemTime::now(),
            completed_at: None,
            status: RequestStatus::Pending,
            total_tokens: 0,
            credits: 0,
            provider_id: None,
            sub_provider_id: None,
            response_size: 0,
            http_status: None,
        };
        self.requests.save(request.clone()).await;
        request
    }

    pub async fn start_processing(&self, request_id: &str) {
        if let Some(mut request) = self.requests.find_by_id(request_id).await {
            request.status = RequestStatus::Processing;
            self.requests.save(request).await;
        }
    }

    /// Completes a request exactly once: if it has already been marked
    /// `Completed`, this call is a no-op (SPEC_FULL.md §4.9, "once
    /// completeRequest returns true it must be a no-op if retried").
    /// Idempotency is additionally guarded by caching the result against
    /// `request_id` in the retained cache manager.
    pub async fn complete_request(
        &self,
        request_id: &str,
        total_tokens: u64,
        credits: u64,
        provider_id: Option<String>,
        sub_provider_id: Option<String>,
        response_size: u64,
        http_status: u16,
    ) -> bool {
        let idempotency_key = format!("request_complete:{request_id}");
        if self.idempotency_cache.get(&idempotency_key).await.is_some() {
            return true;
        }

        let Some(mut request) = self.requests.find_by_id(request_id).await else {
            return false;
        };
        if request.status == RequestStatus::Completed {
            return true;
        }

        request.status = RequestStatus::Completed;
        request.completed_at = Some(SystemTime::now());
        request.total_tokens = total_tokens;
        request.credits = credits;
        request.provider_id = provider_id;
        request.sub_provider_id = sub_provider_id;
        request.response_size = response_size;
        request.http_status = Some(http_status);
        self.requests.save(request).await;

        self.idempotency_cache
            .set(&idempotency_key, serde_json::json!(true), Some(IDEMPOTENCY_TTL))
            .await;
        true
    }

    pub async fn fail_request(&self, request_id: &str, http_status: u16) {
        if let Some(mut request) = self.requests.find_by_id(request_id).await {
            if request.status == RequestStatus::Completed {
                return;
            }
            request.status = RequestStatus::Failed;
            request.completed_at = Some(SystemTime::now());
            request.http_status = Some(http_status);
            self.requests.save(request).await;
        }
    }
}
