use std::sync::Mutex;

use crate::domain::billing::SubscriptionStatus;
use crate::infra::storage::{BillingStore, JobStore};

use super::job_service::ServiceError;

/// Structured rejection from the pre-enqueue gate. Carries enough for the
/// caller to render a specific message; `ConcurrencyLimit` includes the
/// blocking job so the caller can link to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("an active subscription is required to create jobs")]
    SubscriptionRequired,
    #[error("subscription payment failed or is paused; settle the bill first")]
    BillingHold,
    #[error("monthly quota is used up")]
    QuotaExhausted,
    #[error("another job is already in progress; wait for it to finish")]
    ConcurrencyLimit { active_job_id: String },
}

impl AdmissionDenied {
    /// Stable reason tag for telemetry
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SubscriptionRequired => "subscription_inactive",
            Self::BillingHold => "subscription_past_due",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
        }
    }
}

/// Runs before enqueuing any job (fresh create, clone, or retry):
/// entitlement, quota, then the single-active-job limit.
///
/// The entitlement read and the active-id read are deliberately two separate
/// store accesses; a concurrent admission can slip between them. The
/// single-active-job invariant is the cheap backstop and the window is
/// accepted (worst case, one extra job briefly bypasses the limit).
pub fn check_admission(
    billing: &Mutex<BillingStore>,
    jobs: &Mutex<JobStore>,
    user_id: &str,
) -> Result<(), ServiceError> {
    let entitlement = billing.lock().unwrap().entitlement(user_id)?;

    match entitlement.subscription_status {
        SubscriptionStatus::Inactive | SubscriptionStatus::Expired => {
            return Err(AdmissionDenied::SubscriptionRequired.into());
        }
        SubscriptionStatus::PastDue => {
            return Err(AdmissionDenied::BillingHold.into());
        }
        SubscriptionStatus::Active | SubscriptionStatus::Canceled => {}
    }

    if entitlement.quota_remaining == 0 {
        return Err(AdmissionDenied::QuotaExhausted.into());
    }

    if let Some(active_job_id) = jobs.lock().unwrap().active_id_for_user(user_id)? {
        return Err(AdmissionDenied::ConcurrencyLimit { active_job_id }.into());
    }

    Ok(())
}
