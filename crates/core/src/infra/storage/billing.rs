use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::billing::{
    month_key, ChargeOutcome, Entitlement, SubscriptionRecord, SubscriptionStatus, UsageRecord,
};
use crate::domain::error::AppError;
use crate::domain::settings::CoreSettings;

use super::now_rfc3339;

/// SQLite quota ledger.
///
/// Exclusively owns subscription, usage and charge records. Charging is
/// idempotent per job id: the charge row is looked up before every attempt
/// and created together with the usage increment in one transaction, so a
/// retried or crashed charge can never debit twice.
pub struct BillingStore {
    conn: Connection,
    settings: CoreSettings,
}

impl BillingStore {
    pub fn open(path: &str, settings: CoreSettings) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::storage(format!("billing db open failed: {e}")))?;
        let store = Self { conn, settings };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory(settings: CoreSettings) -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::storage(format!("in-memory billing db failed: {e}")))?;
        let store = Self { conn, settings };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS subscriptions (
                    user_id            TEXT PRIMARY KEY,
                    status             TEXT NOT NULL,
                    plan_id            TEXT,
                    current_period_end TEXT,
                    created_at         TEXT NOT NULL,
                    updated_at         TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS usages (
                    user_id     TEXT NOT NULL,
                    month       TEXT NOT NULL,
                    quota_total INTEGER NOT NULL,
                    quota_used  INTEGER NOT NULL DEFAULT 0,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL,
                    PRIMARY KEY (user_id, month)
                );

                CREATE TABLE IF NOT EXISTS charges (
                    job_id     TEXT PRIMARY KEY,
                    user_id    TEXT NOT NULL,
                    month      TEXT NOT NULL,
                    charged_at TEXT NOT NULL
                );
                ",
            )
            .map_err(|e| AppError::storage(format!("billing db migration failed: {e}")))?;
        Ok(())
    }

    /// Entitlement snapshot for the current month. Pure read: usage defaults
    /// to zero used and the plan's quota when no row exists yet.
    pub fn entitlement(&self, user_id: &str) -> Result<Entitlement, AppError> {
        let now = Utc::now();
        let month = month_key(now);

        let subscription = self.select_subscription(user_id)?;
        let status = subscription
            .as_ref()
            .map(|s| s.effective_status(now))
            .unwrap_or(SubscriptionStatus::Inactive);
        let plan_id = subscription.as_ref().and_then(|s| s.plan_id.clone());

        let usage = self.select_usage(user_id, &month)?;
        let quota_total = usage
            .as_ref()
            .map(|u| u.quota_total)
            .unwrap_or_else(|| self.settings.quota_for_plan(plan_id.as_deref()));
        let quota_used = usage.as_ref().map(|u| u.quota_used).unwrap_or(0);

        Ok(Entitlement {
            subscription_status: status,
            plan_id,
            month,
            quota_total,
            quota_used,
            quota_remaining: quota_total.saturating_sub(quota_used),
        })
    }

    /// Debits one quota unit for a successfully completed job, exactly once
    /// per job id ever. A second call for the same id reports
    /// `already_charged` and performs no mutation.
    pub fn charge_on_success(
        &self,
        job_id: &str,
        user_id: &str,
        charged_at: &str,
    ) -> Result<ChargeOutcome, AppError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| AppError::storage(format!("charge tx failed: {e}")))?;

        let existing_month: Option<String> = tx
            .query_row(
                "SELECT month FROM charges WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::storage(format!("charge lookup failed: {e}")))?;

        if let Some(month) = existing_month {
            let usage = self
                .select_usage(user_id, &month)?
                .unwrap_or_else(|| self.empty_usage(user_id, &month, charged_at));
            return Ok(ChargeOutcome {
                already_charged: true,
                usage,
            });
        }

        let month = chrono::DateTime::parse_from_rfc3339(charged_at)
            .map(|t| month_key(t.with_timezone(&Utc)))
            .unwrap_or_else(|_| month_key(Utc::now()));

        let plan_id = self
            .select_subscription(user_id)?
            .and_then(|s| s.plan_id);
        let quota_total = self.settings.quota_for_plan(plan_id.as_deref());

        tx.execute(
            "INSERT INTO usages (user_id, month, quota_total, quota_used, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT (user_id, month) DO UPDATE SET
                 quota_total = MAX(quota_total, excluded.quota_total),
                 quota_used  = quota_used + 1,
                 updated_at  = excluded.updated_at",
            params![user_id, month, quota_total, charged_at],
        )
        .map_err(|e| AppError::storage(format!("usage increment failed: {e}")))?;

        tx.execute(
            "INSERT INTO charges (job_id, user_id, month, charged_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, user_id, month, charged_at],
        )
        .map_err(|e| AppError::storage(format!("charge insert failed: {e}")))?;

        tx.commit()
            .map_err(|e| AppError::storage(format!("charge commit failed: {e}")))?;

        let usage = self
            .select_usage(user_id, &month)?
            .ok_or_else(|| AppError::internal("usage row missing after charge"))?;
        Ok(ChargeOutcome {
            already_charged: false,
            usage,
        })
    }

    /// Applies a subscription status change from the (out-of-scope) billing
    /// provider. Activation seeds the current month's usage row so the
    /// entitlement is visible immediately.
    pub fn upsert_subscription(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
        plan_id: Option<String>,
        current_period_end: Option<String>,
    ) -> Result<SubscriptionRecord, AppError> {
        let now = now_rfc3339();
        let prev = self.select_subscription(user_id)?;

        let record = SubscriptionRecord {
            user_id: user_id.to_string(),
            status,
            plan_id: plan_id.or_else(|| prev.as_ref().and_then(|p| p.plan_id.clone())),
            current_period_end: current_period_end
                .or_else(|| prev.as_ref().and_then(|p| p.current_period_end.clone())),
            created_at: prev
                .as_ref()
                .map(|p| p.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now.clone(),
        };

        self.conn
            .execute(
                "INSERT INTO subscriptions (user_id, status, plan_id, current_period_end,
                                            created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id) DO UPDATE SET
                     status = excluded.status,
                     plan_id = excluded.plan_id,
                     current_period_end = excluded.current_period_end,
                     updated_at = excluded.updated_at",
                params![
                    record.user_id,
                    record.status.as_str(),
                    record.plan_id,
                    record.current_period_end,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .map_err(|e| AppError::storage(format!("subscription upsert failed: {e}")))?;

        if status == SubscriptionStatus::Active {
            let month = month_key(Utc::now());
            let quota_total = self.settings.quota_for_plan(record.plan_id.as_deref());
            self.conn
                .execute(
                    "INSERT INTO usages (user_id, month, quota_total, quota_used,
                                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4, ?4)
                     ON CONFLICT (user_id, month) DO UPDATE SET
                         quota_total = MAX(quota_total, excluded.quota_total),
                         updated_at  = excluded.updated_at",
                    params![user_id, month, quota_total, now],
                )
                .map_err(|e| AppError::storage(format!("usage seed failed: {e}")))?;
        }

        Ok(record)
    }

    pub fn usage_for_month(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<Option<UsageRecord>, AppError> {
        self.select_usage(user_id, month)
    }

    fn select_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<SubscriptionRecord>, AppError> {
        self.conn
            .query_row(
                "SELECT * FROM subscriptions WHERE user_id = ?1",
                params![user_id],
                row_to_subscription,
            )
            .optional()
            .map_err(|e| AppError::storage(format!("subscription select failed: {e}")))
    }

    fn select_usage(&self, user_id: &str, month: &str) -> Result<Option<UsageRecord>, AppError> {
        self.conn
            .query_row(
                "SELECT * FROM usages WHERE user_id = ?1 AND month = ?2",
                params![user_id, month],
                row_to_usage,
            )
            .optional()
            .map_err(|e| AppError::storage(format!("usage select failed: {e}")))
    }

    fn empty_usage(&self, user_id: &str, month: &str, now: &str) -> UsageRecord {
        UsageRecord {
            user_id: user_id.to_string(),
            month: month.to_string(),
            quota_total: self.settings.quota_for_plan(None),
            quota_used: 0,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    let status: String = row.get("status")?;
    Ok(SubscriptionRecord {
        user_id: row.get("user_id")?,
        status: SubscriptionStatus::parse(&status).unwrap_or(SubscriptionStatus::Inactive),
        plan_id: row.get("plan_id")?,
        current_period_end: row.get("current_period_end")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_usage(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        user_id: row.get("user_id")?,
        month: row.get("month")?,
        quota_total: row.get("quota_total")?,
        quota_used: row.get("quota_used")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
