use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::domain::billing::{Entitlement, SubscriptionRecord, SubscriptionStatus};
use crate::domain::error::AppError;
use crate::domain::job::{JobParams, JobStatus, JobView, ProviderKind};
use crate::domain::settings::CoreSettings;
use crate::infra::provider::{CancelReason, ImageGenerator};
use crate::infra::storage::{BillingStore, JobStore, NewJob};
use crate::infra::telemetry::Telemetry;

use super::admission::{check_admission, AdmissionDenied};
use super::orchestrator::Orchestrator;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Denied(#[from] AdmissionDenied),
    #[error("job not found")]
    NotFound,
    #[error("job cannot be {action} in its current state")]
    InvalidState { action: &'static str },
    #[error(transparent)]
    Storage(#[from] AppError),
}

/// Optional parameter overrides for a cloned job; anything left `None` is
/// taken from the source record.
#[derive(Debug, Clone, Default)]
pub struct CloneOverrides {
    pub style_id: Option<String>,
    pub identity_strength: Option<u8>,
}

/// Entry point for everything a caller does with jobs: admission-gated
/// creation, reads scoped to the owner, cancel/retry/clone, and the
/// entitlement snapshot. Owns the stores and the orchestrator.
pub struct JobService {
    jobs: Arc<Mutex<JobStore>>,
    billing: Arc<Mutex<BillingStore>>,
    orchestrator: Arc<Orchestrator>,
    telemetry: Telemetry,
    settings: CoreSettings,
    provider_kind: ProviderKind,
}

impl JobService {
    /// Builds the service and reconciles the durable store with the (lost)
    /// in-memory queue: jobs still marked `running` from a previous process
    /// are failed so their owners are unblocked immediately.
    pub fn new(
        jobs: JobStore,
        billing: BillingStore,
        provider: Arc<dyn ImageGenerator>,
        settings: CoreSettings,
    ) -> Result<Self, AppError> {
        let telemetry = Telemetry::new(settings.telemetry_enabled);
        let jobs = Arc::new(Mutex::new(jobs));
        let billing = Arc::new(Mutex::new(billing));

        let orphans = jobs.lock().unwrap().fail_orphaned_running()?;
        for job in &orphans {
            log::warn!("job {} was orphaned by a restart, marked failed", job.id);
            telemetry.emit(
                "job.orphaned",
                &[("job_id", json!(job.id)), ("user_id", json!(job.user_id))],
            );
        }

        let provider_kind = provider.kind();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&jobs),
            Arc::clone(&billing),
            provider,
            telemetry.clone(),
            settings.job_timeout,
        ));

        Ok(Self {
            jobs,
            billing,
            orchestrator,
            telemetry,
            settings,
            provider_kind,
        })
    }

    /// Creates and enqueues a job for `user_id`. Runs the full admission
    /// gate first; a denial leaves no record behind.
    pub fn create(
        &self,
        user_id: &str,
        style_id: &str,
        params: JobParams,
        input_image_url: &str,
    ) -> Result<JobView, ServiceError> {
        self.admit(user_id, "job.create_blocked")?;

        let job = self.jobs.lock().unwrap().create(NewJob {
            user_id: user_id.to_string(),
            style_id: style_id.to_string(),
            params,
            input_image_url: input_image_url.to_string(),
            provider: self.provider_kind,
        })?;

        self.telemetry.emit(
            "job.created",
            &[
                ("job_id", json!(job.id)),
                ("user_id", json!(job.user_id)),
                ("style_id", json!(job.style_id)),
            ],
        );
        self.orchestrator.enqueue(&job.id);
        Ok(JobView::from(job))
    }

    /// Owner-scoped read. A foreign or missing id is indistinguishable from
    /// the caller's side: both are `NotFound`.
    pub fn get(&self, job_id: &str, user_id: &str) -> Result<JobView, ServiceError> {
        let job = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)?
            .filter(|j| j.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        Ok(JobView::from(job))
    }

    /// Newest-first listing, clamped to the configured page size
    pub fn list(&self, user_id: &str, limit: Option<u32>) -> Result<Vec<JobView>, ServiceError> {
        let max = self.settings.list_limit_max;
        let limit = limit.unwrap_or(max).clamp(1, max);
        let jobs = self.jobs.lock().unwrap().list_for_user(user_id, limit)?;
        Ok(jobs.into_iter().map(JobView::from).collect())
    }

    /// Cancels a queued or running job. The durable record is marked first,
    /// so the outcome holds even if the in-flight generation never observes
    /// the signal; then the orchestrator is told to stop the provider call.
    pub fn cancel(&self, job_id: &str, user_id: &str) -> Result<JobView, ServiceError> {
        let current = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)?
            .filter(|j| j.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        if current.status.is_terminal() {
            return Err(ServiceError::InvalidState { action: "canceled" });
        }

        let canceled = self
            .jobs
            .lock()
            .unwrap()
            .update(job_id, |mut j| {
                if j.status.is_active() {
                    j.status = JobStatus::Canceled;
                }
                j
            })?
            .ok_or(ServiceError::NotFound)?;

        self.telemetry.emit(
            "job.cancel_requested",
            &[("job_id", json!(job_id)), ("user_id", json!(user_id))],
        );
        self.orchestrator.cancel(job_id, CancelReason::UserRequested);
        Ok(JobView::from(canceled))
    }

    /// Re-runs a failed job in place: same record, incremented attempt,
    /// previous error and outputs cleared. Goes through the same admission
    /// gate as a fresh create.
    pub fn retry(&self, job_id: &str, user_id: &str) -> Result<JobView, ServiceError> {
        let current = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)?
            .filter(|j| j.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        if current.status != JobStatus::Failed {
            return Err(ServiceError::InvalidState { action: "retried" });
        }

        self.admit(user_id, "job.retry_blocked")?;

        let retried = self
            .jobs
            .lock()
            .unwrap()
            .update(job_id, |mut j| {
                if j.status == JobStatus::Failed {
                    j.status = JobStatus::Queued;
                    j.attempt += 1;
                    j.error = None;
                    j.output_image_urls = vec![];
                }
                j
            })?
            .ok_or(ServiceError::NotFound)?;
        if retried.status != JobStatus::Queued {
            // lost a race with a concurrent transition
            return Err(ServiceError::InvalidState { action: "retried" });
        }

        self.telemetry.emit(
            "job.retried",
            &[
                ("job_id", json!(job_id)),
                ("user_id", json!(user_id)),
                ("attempt", json!(retried.attempt)),
            ],
        );
        self.orchestrator.enqueue(job_id);
        Ok(JobView::from(retried))
    }

    /// Creates a fresh job reusing a finished job's input image, with
    /// optional style/parameter overrides. The source must belong to the
    /// caller and must have reached a terminal state.
    pub fn clone_job(
        &self,
        source_id: &str,
        user_id: &str,
        overrides: CloneOverrides,
    ) -> Result<JobView, ServiceError> {
        self.admit(user_id, "job.clone_blocked")?;

        let source = self
            .jobs
            .lock()
            .unwrap()
            .get(source_id)?
            .filter(|j| j.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        if !source.status.is_terminal() {
            return Err(ServiceError::InvalidState { action: "cloned" });
        }

        let style_id = overrides.style_id.unwrap_or_else(|| source.style_id.clone());
        let params = overrides
            .identity_strength
            .map(JobParams::new)
            .unwrap_or(source.params);

        let job = self
            .jobs
            .lock()
            .unwrap()
            .clone_from(source_id, user_id, style_id, params, self.provider_kind)?
            .ok_or(ServiceError::NotFound)?;

        self.telemetry.emit(
            "job.created",
            &[
                ("job_id", json!(job.id)),
                ("user_id", json!(job.user_id)),
                ("style_id", json!(job.style_id)),
                ("cloned_from", json!(source_id)),
            ],
        );
        self.orchestrator.enqueue(&job.id);
        Ok(JobView::from(job))
    }

    pub fn delete(&self, job_id: &str, user_id: &str) -> Result<(), ServiceError> {
        if self.jobs.lock().unwrap().delete_one(job_id, user_id)? {
            Ok(())
        } else {
            Err(ServiceError::NotFound)
        }
    }

    pub fn delete_all(&self, user_id: &str) -> Result<usize, ServiceError> {
        Ok(self.jobs.lock().unwrap().delete_all_for_user(user_id)?)
    }

    /// Current-month entitlement snapshot for the caller
    pub fn entitlement(&self, user_id: &str) -> Result<Entitlement, ServiceError> {
        Ok(self.billing.lock().unwrap().entitlement(user_id)?)
    }

    /// Applies a subscription change pushed by the external billing
    /// provider. This is the only write path into subscription state.
    pub fn apply_subscription_event(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
        plan_id: Option<String>,
        current_period_end: Option<String>,
    ) -> Result<SubscriptionRecord, ServiceError> {
        Ok(self.billing.lock().unwrap().upsert_subscription(
            user_id,
            status,
            plan_id,
            current_period_end,
        )?)
    }

    /// How long finished jobs stay readable
    pub fn retention_days(&self) -> u32 {
        self.settings.retention_days
    }

    fn admit(&self, user_id: &str, blocked_event: &str) -> Result<(), ServiceError> {
        match check_admission(&self.billing, &self.jobs, user_id) {
            Ok(()) => Ok(()),
            Err(ServiceError::Denied(denied)) => {
                self.telemetry.emit(
                    blocked_event,
                    &[
                        ("user_id", json!(user_id)),
                        ("reason", json!(denied.reason())),
                    ],
                );
                Err(ServiceError::Denied(denied))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::provider::MockGenerator;
    use std::time::Duration;

    fn service() -> JobService {
        JobService::new(
            JobStore::open_in_memory(7).unwrap(),
            BillingStore::open_in_memory(CoreSettings::default()).unwrap(),
            Arc::new(MockGenerator::with_delay(Duration::from_millis(20))),
            CoreSettings::default(),
        )
        .unwrap()
    }

    fn activate(service: &JobService, user: &str) {
        service
            .apply_subscription_event(user, SubscriptionStatus::Active, Some("basic".into()), None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_requires_subscription() {
        let service = service();
        let err = service
            .create("u1", "retro", JobParams::default(), "data:,")
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Denied(AdmissionDenied::SubscriptionRequired)
        ));
    }

    #[tokio::test]
    async fn test_get_hides_foreign_jobs() {
        let service = service();
        activate(&service, "u1");
        let job = service
            .create("u1", "retro", JobParams::default(), "data:,")
            .unwrap();

        assert!(service.get(&job.id, "u1").is_ok());
        assert!(matches!(
            service.get(&job.id, "u2"),
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_of_terminal_job_is_invalid() {
        let service = service();
        activate(&service, "u1");
        let job = service
            .create("u1", "retro", JobParams::default(), "data:,")
            .unwrap();
        let view = service.cancel(&job.id, "u1").unwrap();
        assert_eq!(view.status, JobStatus::Canceled);

        let err = service.cancel(&job.id, "u1").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidState { action: "canceled" }
        ));
    }

    #[tokio::test]
    async fn test_retry_rejected_unless_failed() {
        let service = service();
        activate(&service, "u1");
        let job = service
            .create("u1", "retro", JobParams::default(), "data:,")
            .unwrap();

        let err = service.retry(&job.id, "u1").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidState { action: "retried" }
        ));
    }

    #[tokio::test]
    async fn test_clone_of_active_source_is_blocked() {
        let service = service();
        activate(&service, "u1");
        let job = service
            .create("u1", "retro", JobParams::default(), "data:,")
            .unwrap();

        let err = service
            .clone_job(&job.id, "u1", CloneOverrides::default())
            .unwrap_err();
        // source is still queued/running, and it also holds the
        // single-active-job slot; admission fires first
        assert!(matches!(
            err,
            ServiceError::Denied(AdmissionDenied::ConcurrencyLimit { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let service = service();
        assert!(matches!(
            service.delete("job_missing", "u1"),
            Err(ServiceError::NotFound)
        ));
    }
}
