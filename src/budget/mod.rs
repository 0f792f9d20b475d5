//! Per-organization monthly token budgets.
//!
//! Periods roll over lazily: whenever a check, record or status call sees the
//! current time at or past the stored reset instant, usage drops to zero and
//! the reset moves to the first instant of the next calendar month.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::DbError;
use crate::llm::TokenUsage;

pub const PLAN_TOKEN_BUDGETS: [(&str, u64); 4] = [
    ("free", 500_000),
    ("starter", 2_000_000),
    ("pro", 10_000_000),
    ("enterprise", 50_000_000),
];

pub fn plan_quota(plan: &str) -> Option<u64> {
    PLAN_TOKEN_BUDGETS
        .iter()
        .find(|(name, _)| *name == plan)
        .map(|(_, quota)| *quota)
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Token budget exceeded for org {org_id}: {used}/{quota} tokens used")]
    Exceeded { org_id: String, used: u64, quota: u64 },
    #[error("Organization not found: {0}")]
    NotFound(String),
    #[error("budget store error: {0}")]
    Store(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetRecord {
    pub org_id: String,
    pub plan: String,
    /// Zero means unlimited.
    pub monthly_quota: u64,
    pub usage: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

impl BudgetRecord {
    fn is_exhausted(&self) -> bool {
        self.monthly_quota > 0 && self.usage >= self.monthly_quota
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.reset_at.is_some_and(|reset_at| now >= reset_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub org_id: String,
    pub plan: String,
    pub token_budget_monthly: u64,
    pub token_usage_current: u64,
    pub tokens_remaining: u64,
    pub usage_percent: f64,
    pub budget_reset_at: Option<DateTime<Utc>>,
}

impl From<&BudgetRecord> for BudgetStatus {
    fn from(record: &BudgetRecord) -> Self {
        let usage_percent = if record.monthly_quota > 0 {
            let percent = record.usage as f64 / record.monthly_quota as f64 * 100.0;
            (percent * 10.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            org_id: record.org_id.clone(),
            plan: record.plan.clone(),
            token_budget_monthly: record.monthly_quota,
            token_usage_current: record.usage,
            tokens_remaining: record.monthly_quota.saturating_sub(record.usage),
            usage_percent,
            budget_reset_at: record.reset_at,
        }
    }
}

/// Storage for budget rows. `add_usage` must be a single atomic increment and
/// `roll_over` must only apply while the stored reset still equals
/// `expected_reset_at`, so concurrent turns neither lose tokens nor reset twice.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn load(&self, org_id: &str) -> Result<Option<BudgetRecord>, DbError>;

    async fn roll_over(
        &self,
        org_id: &str,
        expected_reset_at: Option<DateTime<Utc>>,
        next_reset_at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    async fn add_usage(&self, org_id: &str, tokens: u64) -> Result<(), DbError>;
}

/// First instant of the calendar month after `now`.
pub fn next_reset_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub struct TokenBudgetGuard {
    store: Arc<dyn BudgetStore>,
}

impl TokenBudgetGuard {
    pub fn new(store: Arc<dyn BudgetStore>) -> Self {
        Self { store }
    }

    /// Fails with [`BudgetError::Exceeded`] once usage reaches the quota.
    /// Unknown organizations and store failures pass.
    pub async fn check_budget(&self, org_id: &str) -> Result<(), BudgetError> {
        self.check_budget_at(org_id, Utc::now()).await
    }

    pub async fn check_budget_at(&self, org_id: &str, now: DateTime<Utc>) -> Result<(), BudgetError> {
        let record = match self.current(org_id, now).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Budget check for org {} failed open: {}", org_id, e);
                return Ok(());
            }
        };

        if record.is_exhausted() {
            return Err(BudgetError::Exceeded {
                org_id: record.org_id,
                used: record.usage,
                quota: record.monthly_quota,
            });
        }
        Ok(())
    }

    pub async fn record_usage(&self, org_id: &str, usage: TokenUsage) {
        self.record_usage_at(org_id, usage, Utc::now()).await
    }

    pub async fn record_usage_at(&self, org_id: &str, usage: TokenUsage, now: DateTime<Utc>) {
        let total = usage.total();
        if total == 0 {
            return;
        }

        match self.current(org_id, now).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("Not recording usage for unknown org {}", org_id);
                return;
            }
            Err(e) => {
                warn!("Failed to load budget for org {}: {}", org_id, e);
                return;
            }
        }

        match self.store.add_usage(org_id, total).await {
            Ok(()) => debug!("Recorded {} tokens for org {}", total, org_id),
            Err(e) => warn!("Failed to record {} tokens for org {}: {}", total, org_id, e),
        }
    }

    pub async fn status(&self, org_id: &str) -> Result<BudgetStatus, BudgetError> {
        self.status_at(org_id, Utc::now()).await
    }

    pub async fn status_at(&self, org_id: &str, now: DateTime<Utc>) -> Result<BudgetStatus, BudgetError> {
        let record = self
            .current(org_id, now)
            .await?
            .ok_or_else(|| BudgetError::NotFound(org_id.to_string()))?;
        Ok(BudgetStatus::from(&record))
    }

    /// Loads the record, rolling the period over first if it is due.
    async fn current(&self, org_id: &str, now: DateTime<Utc>) -> Result<Option<BudgetRecord>, DbError> {
        let Some(record) = self.store.load(org_id).await? else {
            return Ok(None);
        };
        if !record.is_due(now) {
            return Ok(Some(record));
        }

        let next_reset = next_reset_after(now);
        if self.store.roll_over(org_id, record.reset_at, next_reset).await? {
            info!("Reset token budget for org {}, next reset: {}", org_id, next_reset.to_rfc3339());
        }
        // someone else may have rolled over first; either way re-read
        self.store.load(org_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store with the same conditional/atomic semantics as the
    /// database-backed one.
    #[derive(Default)]
    pub(crate) struct MemoryBudgetStore {
        pub records: Mutex<HashMap<String, BudgetRecord>>,
    }

    impl MemoryBudgetStore {
        pub(crate) fn with(record: BudgetRecord) -> Arc<Self> {
            let store = Self::default();
            store.records.lock().unwrap().insert(record.org_id.clone(), record);
            Arc::new(store)
        }

        pub(crate) fn get(&self, org_id: &str) -> BudgetRecord {
            self.records.lock().unwrap()[org_id].clone()
        }
    }

    #[async_trait]
    impl BudgetStore for MemoryBudgetStore {
        async fn load(&self, org_id: &str) -> Result<Option<BudgetRecord>, DbError> {
            Ok(self.records.lock().unwrap().get(org_id).cloned())
        }

        async fn roll_over(
            &self,
            org_id: &str,
            expected_reset_at: Option<DateTime<Utc>>,
            next_reset_at: DateTime<Utc>,
        ) -> Result<bool, DbError> {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(org_id) {
                Some(record) if record.reset_at == expected_reset_at => {
                    record.usage = 0;
                    record.reset_at = Some(next_reset_at);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn add_usage(&self, org_id: &str, tokens: u64) -> Result<(), DbError> {
            if let Some(record) = self.records.lock().unwrap().get_mut(org_id) {
                record.usage += tokens;
            }
            Ok(())
        }
    }

    pub(crate) fn record(quota: u64, usage: u64, reset_at: DateTime<Utc>) -> BudgetRecord {
        BudgetRecord {
            org_id: "org-1".to_string(),
            plan: "free".to_string(),
            monthly_quota: quota,
            usage,
            reset_at: Some(reset_at),
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn next_reset_handles_year_rollover() {
        assert_eq!(next_reset_after(at(2025, 3, 15)), Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(next_reset_after(at(2025, 12, 31)), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn plan_quotas() {
        assert_eq!(plan_quota("free"), Some(500_000));
        assert_eq!(plan_quota("enterprise"), Some(50_000_000));
        assert_eq!(plan_quota("platinum"), None);
    }

    #[tokio::test]
    async fn exactly_at_quota_is_exceeded() {
        let now = at(2025, 6, 10);
        let guard = TokenBudgetGuard::new(MemoryBudgetStore::with(record(1000, 999, at(2025, 7, 1))));
        assert!(guard.check_budget_at("org-1", now).await.is_ok());

        let guard = TokenBudgetGuard::new(MemoryBudgetStore::with(record(1000, 1000, at(2025, 7, 1))));
        let err = guard.check_budget_at("org-1", now).await.unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { used: 1000, quota: 1000, .. }));
    }

    #[tokio::test]
    async fn past_reset_rolls_over_before_checking() {
        let store = MemoryBudgetStore::with(record(1000, 999, at(2025, 5, 1)));
        let guard = TokenBudgetGuard::new(store.clone());

        guard.check_budget_at("org-1", at(2025, 12, 20)).await.unwrap();

        let after = store.get("org-1");
        assert_eq!(after.usage, 0);
        assert_eq!(after.reset_at, Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn exhausted_budget_passes_again_after_reset() {
        let store = MemoryBudgetStore::with(record(1000, 5000, at(2025, 7, 1)));
        let guard = TokenBudgetGuard::new(store);
        assert!(guard.check_budget_at("org-1", at(2025, 6, 30)).await.is_err());
        assert!(guard.check_budget_at("org-1", at(2025, 7, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn zero_quota_is_unlimited() {
        let guard = TokenBudgetGuard::new(MemoryBudgetStore::with(record(0, 10_000_000, at(2025, 7, 1))));
        assert!(guard.check_budget_at("org-1", at(2025, 6, 1)).await.is_ok());
        let status = guard.status_at("org-1", at(2025, 6, 1)).await.unwrap();
        assert_eq!(status.usage_percent, 0.0);
        assert_eq!(status.tokens_remaining, 0);
    }

    #[tokio::test]
    async fn unknown_org_fails_open() {
        let store = MemoryBudgetStore::with(record(1000, 0, at(2025, 7, 1)));
        let guard = TokenBudgetGuard::new(store.clone());
        assert!(guard.check_budget("ghost").await.is_ok());
        guard.record_usage("ghost", TokenUsage::new(10, 10)).await;
        assert_eq!(store.get("org-1").usage, 0);
        assert!(matches!(guard.status("ghost").await, Err(BudgetError::NotFound(_))));
    }

    #[tokio::test]
    async fn records_usage_and_reports_status() {
        let store = MemoryBudgetStore::with(record(500_000, 0, at(2025, 7, 1)));
        let guard = TokenBudgetGuard::new(store.clone());
        let now = at(2025, 6, 15);

        guard.record_usage_at("org-1", TokenUsage::new(1000, 234), now).await;
        guard.record_usage_at("org-1", TokenUsage::new(100, 0), now).await;

        let status = guard.status_at("org-1", now).await.unwrap();
        assert_eq!(status.token_usage_current, 1334);
        assert_eq!(status.tokens_remaining, 498_666);
        assert_eq!(status.usage_percent, 0.3);
    }
}
