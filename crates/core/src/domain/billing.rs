use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription lifecycle states as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Canceled,
    PastDue,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::PastDue => "past_due",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(Self::Inactive),
            "active" => Some(Self::Active),
            "canceled" => Some(Self::Canceled),
            "past_due" => Some(Self::PastDue),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub status: SubscriptionStatus,
    pub plan_id: Option<String>,
    pub current_period_end: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SubscriptionRecord {
    /// Status as seen by admission control: an `active`/`canceled`
    /// subscription whose period end has passed reads as `expired`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        match self.status {
            SubscriptionStatus::Inactive
            | SubscriptionStatus::PastDue
            | SubscriptionStatus::Expired => self.status,
            status => {
                let Some(ref end) = self.current_period_end else {
                    return status;
                };
                match DateTime::parse_from_rfc3339(end) {
                    Ok(end) if end.with_timezone(&Utc) > now => status,
                    Ok(_) => SubscriptionStatus::Expired,
                    Err(_) => status,
                }
            }
        }
    }
}

/// Per-user-per-month quota counter; `quota_used` only ever increases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub month: String,
    pub quota_total: u32,
    pub quota_used: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl UsageRecord {
    pub fn quota_remaining(&self) -> u32 {
        self.quota_total.saturating_sub(self.quota_used)
    }
}

/// One row per billed job id; its existence makes charging idempotent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub job_id: String,
    pub user_id: String,
    pub month: String,
    pub charged_at: String,
}

/// Entitlement snapshot for admission control and the account surface
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub subscription_status: SubscriptionStatus,
    pub plan_id: Option<String>,
    pub month: String,
    pub quota_total: u32,
    pub quota_used: u32,
    pub quota_remaining: u32,
}

/// Outcome of a charge attempt
#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub already_charged: bool,
    pub usage: UsageRecord,
}

/// Billing period key for a timestamp, e.g. "2025-06"
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sub(status: SubscriptionStatus, period_end: Option<&str>) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: "u1".into(),
            status,
            plan_id: Some("basic".into()),
            current_period_end: period_end.map(str::to_string),
            created_at: "2025-01-01T00:00:00+00:00".into(),
            updated_at: "2025-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn test_month_key_format() {
        let at = Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap();
        assert_eq!(month_key(at), "2025-06");
    }

    #[test]
    fn test_active_within_period() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let s = sub(SubscriptionStatus::Active, Some("2025-07-01T00:00:00+00:00"));
        assert_eq!(s.effective_status(now), SubscriptionStatus::Active);
    }

    #[test]
    fn test_active_past_period_reads_expired() {
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let s = sub(SubscriptionStatus::Active, Some("2025-07-01T00:00:00+00:00"));
        assert_eq!(s.effective_status(now), SubscriptionStatus::Expired);

        // canceled subscriptions keep access until the period lapses
        let s = sub(SubscriptionStatus::Canceled, Some("2025-09-01T00:00:00+00:00"));
        assert_eq!(s.effective_status(now), SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_past_due_not_masked_by_period() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let s = sub(SubscriptionStatus::PastDue, Some("2025-07-01T00:00:00+00:00"));
        assert_eq!(s.effective_status(now), SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_quota_remaining_saturates() {
        let usage = UsageRecord {
            user_id: "u1".into(),
            month: "2025-06".into(),
            quota_total: 3,
            quota_used: 5,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(usage.quota_remaining(), 0);
    }
}
