use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, OptionalExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::{from_millis, to_millis, AppDb, DbError};
use crate::budget::{next_reset_after, plan_quota, BudgetRecord, BudgetStore};

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationUpdate {
    pub name: Option<String>,
    pub plan: Option<String>,
    /// Overrides the plan's default quota; 0 means unlimited
    pub token_budget_monthly: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub plan: String,
    pub token_budget_monthly: u64,
    pub token_usage_current: u64,
    pub budget_reset_at: Option<DateTime<Utc>>,
}

/// Organization rows, including the token budget counters.
///
/// Budget writes are single statements. They are also serialized within the
/// process because DuckDB reports concurrent updates of one row as a
/// transaction conflict rather than waiting.
pub struct OrganizationStore {
    db: AppDb,
    default_plan: String,
    write_lock: Mutex<()>,
}

impl OrganizationStore {
    pub fn new(db: AppDb) -> Self {
        Self {
            db,
            default_plan: "free".to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Plan given to organizations created without one.
    pub fn with_default_plan(mut self, plan: impl Into<String>) -> Self {
        self.default_plan = plan.into();
        self
    }

    pub async fn get(&self, org_id: &str) -> Result<Option<Organization>, DbError> {
        let org_id = org_id.to_string();
        self.db
            .run(move |conn| {
                let org = conn
                    .query_row(
                        "SELECT id, name, plan, token_budget_monthly, token_usage_current, budget_reset_at
                         FROM organizations WHERE id = ?",
                        [&org_id],
                        |row| {
                            Ok(Organization {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                plan: row.get(2)?,
                                token_budget_monthly: row.get::<_, i64>(3)?.max(0) as u64,
                                token_usage_current: row.get::<_, i64>(4)?.max(0) as u64,
                                budget_reset_at: row.get::<_, Option<i64>>(5)?.and_then(from_millis),
                            })
                        },
                    )
                    .optional()?;
                Ok(org)
            })
            .await
    }

    /// Creates the organization or updates its name, plan and quota. A plan
    /// change without an explicit quota takes the plan's default.
    pub async fn upsert(&self, org_id: &str, update: OrganizationUpdate) -> Result<Organization, DbError> {
        let existing = self.get(org_id).await?;

        let plan = update
            .plan
            .clone()
            .or_else(|| existing.as_ref().map(|o| o.plan.clone()))
            .unwrap_or_else(|| self.default_plan.clone());
        let default_quota = plan_quota(&plan)
            .ok_or_else(|| DbError::Invalid(format!("Unknown plan: {}", plan)))?;
        let quota = match (update.token_budget_monthly, &existing) {
            (Some(quota), _) => quota,
            (None, Some(org)) if update.plan.is_none() => org.token_budget_monthly,
            _ => default_quota,
        };
        let name = update
            .name
            .or_else(|| existing.as_ref().map(|o| o.name.clone()))
            .unwrap_or_else(|| org_id.to_string());

        let id = org_id.to_string();
        let quota = i64::try_from(quota).map_err(|_| DbError::Invalid("quota out of range".to_string()))?;
        let _guard = self.write_lock.lock().await;
        if existing.is_some() {
            self.db
                .run(move |conn| {
                    conn.execute(
                        "UPDATE organizations SET name = ?, plan = ?, token_budget_monthly = ? WHERE id = ?",
                        params![name, plan, quota, id],
                    )?;
                    Ok(())
                })
                .await?;
        } else {
            let now = Utc::now();
            let reset_at = to_millis(next_reset_after(now));
            self.db
                .run(move |conn| {
                    conn.execute(
                        "INSERT INTO organizations
                            (id, name, plan, token_budget_monthly, token_usage_current, budget_reset_at, created_at)
                         VALUES (?, ?, ?, ?, 0, ?, ?)",
                        params![id, name, plan, quota, reset_at, to_millis(now)],
                    )?;
                    Ok(())
                })
                .await?;
            info!("Created organization {}", org_id);
        }
        drop(_guard);

        self.get(org_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Organization {} not found", org_id)))
    }
}

#[async_trait]
impl BudgetStore for OrganizationStore {
    async fn load(&self, org_id: &str) -> Result<Option<BudgetRecord>, DbError> {
        Ok(self.get(org_id).await?.map(|org| BudgetRecord {
            org_id: org.id,
            plan: org.plan,
            monthly_quota: org.token_budget_monthly,
            usage: org.token_usage_current,
            reset_at: org.budget_reset_at,
        }))
    }

    async fn roll_over(
        &self,
        org_id: &str,
        expected_reset_at: Option<DateTime<Utc>>,
        next_reset_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let id = org_id.to_string();
        let expected = expected_reset_at.map(to_millis);
        let next = to_millis(next_reset_at);
        let _guard = self.write_lock.lock().await;
        let changed = self
            .db
            .run(move |conn| {
                Ok(conn.execute(
                    "UPDATE organizations
                     SET token_usage_current = 0, budget_reset_at = ?
                     WHERE id = ? AND budget_reset_at IS NOT DISTINCT FROM ?",
                    params![next, id, expected],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn add_usage(&self, org_id: &str, tokens: u64) -> Result<(), DbError> {
        let id = org_id.to_string();
        let tokens = i64::try_from(tokens).map_err(|_| DbError::Invalid("token count out of range".to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE organizations SET token_usage_current = token_usage_current + ? WHERE id = ?",
                    params![tokens, id],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetError, TokenBudgetGuard};
    use crate::llm::TokenUsage;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn store() -> Arc<OrganizationStore> {
        Arc::new(OrganizationStore::new(AppDb::in_memory().unwrap()))
    }

    fn update(plan: Option<&str>, quota: Option<u64>) -> OrganizationUpdate {
        OrganizationUpdate {
            name: Some("Acme".to_string()),
            plan: plan.map(str::to_string),
            token_budget_monthly: quota,
        }
    }

    #[tokio::test]
    async fn upsert_applies_plan_defaults_and_overrides() {
        let store = store();
        let org = store.upsert("acme", update(None, None)).await.unwrap();
        assert_eq!(org.plan, "free");
        assert_eq!(org.token_budget_monthly, 500_000);
        assert!(org.budget_reset_at.is_some());

        let org = store.upsert("acme", update(Some("pro"), None)).await.unwrap();
        assert_eq!(org.token_budget_monthly, 10_000_000);

        let org = store.upsert("acme", update(None, Some(0))).await.unwrap();
        assert_eq!(org.plan, "pro");
        assert_eq!(org.token_budget_monthly, 0);

        assert!(store.upsert("acme", update(Some("platinum"), None)).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_usage_increments_are_not_lost() {
        let store = store();
        store.upsert("acme", update(Some("starter"), None)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.add_usage("acme", 50).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let org = store.get("acme").await.unwrap().unwrap();
        assert_eq!(org.token_usage_current, 1000);
    }

    #[tokio::test]
    async fn roll_over_is_conditional_on_the_stored_reset() {
        let store = store();
        let org = store.upsert("acme", update(None, None)).await.unwrap();
        store.add_usage("acme", 42).await.unwrap();

        let next = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        let stale = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert!(!store.roll_over("acme", Some(stale), next).await.unwrap());
        assert!(store.roll_over("acme", org.budget_reset_at, next).await.unwrap());

        let org = store.get("acme").await.unwrap().unwrap();
        assert_eq!(org.token_usage_current, 0);
        assert_eq!(org.budget_reset_at, Some(next));
    }

    #[tokio::test]
    async fn guard_over_the_database_store() {
        let store = store();
        store.upsert("acme", update(None, Some(100))).await.unwrap();
        let guard = TokenBudgetGuard::new(store.clone());

        guard.record_usage("acme", TokenUsage::new(60, 40)).await;
        assert!(matches!(guard.check_budget("acme").await, Err(BudgetError::Exceeded { .. })));
        assert_eq!(guard.status("acme").await.unwrap().usage_percent, 100.0);
    }
}
