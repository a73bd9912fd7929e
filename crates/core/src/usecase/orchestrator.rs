use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::domain::job::{error_codes, JobError, JobRecord, JobStatus};
use crate::infra::provider::{
    cancel_pair, CancelHandle, CancelReason, GenerateRequest, ImageGenerator,
};
use crate::infra::storage::{now_rfc3339, BillingStore, JobStore};
use crate::infra::telemetry::Telemetry;

/// In-memory single-worker queue over the durable job store.
///
/// Holds at most one processing task at a time; queued ids wait in FIFO
/// order. The queue itself is volatile, the store is the source of truth:
/// a job is only ever transitioned through the store's read-modify-write,
/// and a record that is no longer `queued` when popped is skipped.
pub struct Orchestrator {
    jobs: Arc<Mutex<JobStore>>,
    billing: Arc<Mutex<BillingStore>>,
    provider: Arc<dyn ImageGenerator>,
    telemetry: Telemetry,
    job_timeout: Duration,
    queue: Mutex<QueueState>,
    handles: Mutex<HashMap<String, CancelHandle>>,
}

struct QueueState {
    pending: VecDeque<String>,
    enqueued: HashSet<String>,
    worker_active: bool,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<Mutex<JobStore>>,
        billing: Arc<Mutex<BillingStore>>,
        provider: Arc<dyn ImageGenerator>,
        telemetry: Telemetry,
        job_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            billing,
            provider,
            telemetry,
            job_timeout,
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                enqueued: HashSet::new(),
                worker_active: false,
            }),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a job id to the queue and wakes the worker if it is idle.
    /// Idempotent: an id that is already pending or currently in flight is
    /// not added again.
    pub fn enqueue(self: &Arc<Self>, job_id: &str) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.enqueued.contains(job_id)
                || self.handles.lock().unwrap().contains_key(job_id)
            {
                return;
            }
            queue.enqueued.insert(job_id.to_string());
            queue.pending.push_back(job_id.to_string());
            if queue.worker_active {
                return;
            }
            queue.worker_active = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_worker().await });
    }

    /// Signals the in-flight generation for `job_id`, if any. Returns false
    /// when the job is not currently being processed (the durable record may
    /// still be canceled by the caller).
    pub fn cancel(&self, job_id: &str, reason: CancelReason) -> bool {
        match self.handles.lock().unwrap().get(job_id) {
            Some(handle) => {
                handle.cancel(reason);
                true
            }
            None => false,
        }
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let job_id = {
                let mut queue = self.queue.lock().unwrap();
                match queue.pending.pop_front() {
                    Some(id) => {
                        queue.enqueued.remove(&id);
                        id
                    }
                    None => {
                        queue.worker_active = false;
                        return;
                    }
                }
            };

            if let Err(err) = self.process(&job_id).await {
                log::error!("job {job_id} processing aborted: {err}");
            }
            self.handles.lock().unwrap().remove(&job_id);
        }
    }

    async fn process(&self, job_id: &str) -> Result<(), crate::domain::error::AppError> {
        let Some(job) = self.jobs.lock().unwrap().get(job_id)? else {
            return Ok(());
        };
        // canceled (or otherwise moved on) before pickup
        if job.status != JobStatus::Queued {
            return Ok(());
        }

        let Some(running) = self.jobs.lock().unwrap().update(job_id, |mut j| {
            if j.status == JobStatus::Queued {
                j.status = JobStatus::Running;
                j.error = None;
                j.output_image_urls = vec![];
            }
            j
        })?
        else {
            return Ok(());
        };
        if running.status != JobStatus::Running {
            return Ok(());
        }

        self.telemetry.emit(
            "job.started",
            &[
                ("job_id", json!(running.id)),
                ("user_id", json!(running.user_id)),
                ("style_id", json!(running.style_id)),
                ("attempt", json!(running.attempt)),
                ("provider", json!(running.provider.as_str())),
            ],
        );

        let (handle, token) = cancel_pair();
        self.handles
            .lock()
            .unwrap()
            .insert(job_id.to_string(), handle);

        let request = GenerateRequest {
            input_image_url: running.input_image_url.clone(),
            style_id: running.style_id.clone(),
            identity_strength: running.params.identity_strength,
        };

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.job_timeout, self.provider.generate(&request, token)).await;

        let finished = match outcome {
            Ok(Ok(images)) => self.settle_success(job_id, images)?,
            Ok(Err(err)) => {
                log::warn!("job {job_id} generation failed: {err}");
                self.settle_failure(job_id, err.to_job_error())?
            }
            Err(_elapsed) => {
                // wake the still-pending provider future before recording
                // the outcome, so it stops burning the upstream call
                if let Some(handle) = self.handles.lock().unwrap().get(job_id) {
                    handle.cancel(CancelReason::TimedOut);
                }
                self.settle_failure(
                    job_id,
                    JobError::new("generation timed out", Some(error_codes::PROVIDER_TIMEOUT)),
                )?
            }
        };

        if let Some(finished) = finished {
            self.emit_outcome(&finished, started.elapsed());
        }
        Ok(())
    }

    /// Records a provider success. A record the owner already canceled stays
    /// canceled; the late result is dropped and nothing is charged.
    fn settle_success(
        &self,
        job_id: &str,
        images: Vec<String>,
    ) -> Result<Option<JobRecord>, crate::domain::error::AppError> {
        let Some(updated) = self.jobs.lock().unwrap().update(job_id, |mut j| {
            if j.status != JobStatus::Canceled {
                j.status = JobStatus::Succeeded;
                j.output_image_urls = images;
                j.error = None;
            }
            j
        })?
        else {
            return Ok(None);
        };

        if updated.status != JobStatus::Succeeded {
            return Ok(Some(updated));
        }

        // ledger first, stamp second: the charges table is the idempotency
        // guard, charged_at on the record is informational
        let charged_at = now_rfc3339();
        let charge = self
            .billing
            .lock()
            .unwrap()
            .charge_on_success(&updated.id, &updated.user_id, &charged_at);
        match charge {
            Ok(outcome) => {
                let stamped = self.jobs.lock().unwrap().update(job_id, |mut j| {
                    if j.status == JobStatus::Succeeded && j.charged_at.is_none() {
                        j.charged_at = Some(charged_at.clone());
                    }
                    j
                })?;
                if outcome.already_charged {
                    log::info!("job {job_id} was already charged, skipped");
                }
                Ok(stamped.or(Some(updated)))
            }
            Err(err) => {
                // the job stays succeeded; losing one quota unit is better
                // than failing delivered images
                log::error!("quota charge for job {job_id} failed: {err}");
                Ok(Some(updated))
            }
        }
    }

    /// Records a failure unless the owner already canceled the job, in which
    /// case canceled wins and the error is dropped.
    fn settle_failure(
        &self,
        job_id: &str,
        error: JobError,
    ) -> Result<Option<JobRecord>, crate::domain::error::AppError> {
        self.jobs.lock().unwrap().update(job_id, |mut j| {
            if j.status != JobStatus::Canceled {
                j.status = JobStatus::Failed;
                j.error = Some(error);
            }
            j
        })
    }

    fn emit_outcome(&self, job: &JobRecord, elapsed: Duration) {
        let event = match job.status {
            JobStatus::Succeeded => "job.succeeded",
            JobStatus::Canceled => "job.canceled",
            _ => "job.failed",
        };
        self.telemetry.emit(
            event,
            &[
                ("job_id", json!(job.id)),
                ("user_id", json!(job.user_id)),
                ("attempt", json!(job.attempt)),
                ("duration_ms", json!(elapsed.as_millis() as u64)),
                (
                    "error_code",
                    json!(job.error.as_ref().and_then(|e| e.code.clone())),
                ),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{JobParams, ProviderKind};
    use crate::domain::settings::CoreSettings;
    use crate::infra::provider::MockGenerator;
    use crate::infra::storage::NewJob;

    fn orchestrator(provider: Arc<dyn ImageGenerator>) -> Arc<Orchestrator> {
        let jobs = Arc::new(Mutex::new(JobStore::open_in_memory(7).unwrap()));
        let billing = Arc::new(Mutex::new(
            BillingStore::open_in_memory(CoreSettings::default()).unwrap(),
        ));
        Arc::new(Orchestrator::new(
            jobs,
            billing,
            provider,
            Telemetry::new(false),
            Duration::from_secs(5),
        ))
    }

    fn queued_job(orch: &Orchestrator, user: &str) -> JobRecord {
        orch.jobs
            .lock()
            .unwrap()
            .create(NewJob {
                user_id: user.to_string(),
                style_id: "retro".to_string(),
                params: JobParams::default(),
                input_image_url: "data:image/png;base64,abcd".to_string(),
                provider: ProviderKind::Mock,
            })
            .unwrap()
    }

    async fn wait_terminal(orch: &Orchestrator, job_id: &str) -> JobRecord {
        for _ in 0..200 {
            let job = orch.jobs.lock().unwrap().get(job_id).unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_processes_queued_job_to_success_and_charges() {
        let orch = orchestrator(Arc::new(MockGenerator::new()));
        let job = queued_job(&orch, "u1");

        orch.enqueue(&job.id);
        let done = wait_terminal(&orch, &job.id).await;

        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.output_image_urls.len(), 4);
        assert!(done.charged_at.is_some());

        let month = crate::domain::billing::month_key(chrono::Utc::now());
        let usage = orch
            .billing
            .lock()
            .unwrap()
            .usage_for_month("u1", &month)
            .unwrap()
            .unwrap();
        assert_eq!(usage.quota_used, 1);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let orch = orchestrator(Arc::new(MockGenerator::with_delay(Duration::from_millis(
            100,
        ))));
        let first = queued_job(&orch, "u1");
        let second = queued_job(&orch, "u2");

        orch.enqueue(&first.id);
        orch.enqueue(&second.id);
        orch.enqueue(&second.id);
        orch.enqueue(&second.id);

        wait_terminal(&orch, &first.id).await;
        let done = wait_terminal(&orch, &second.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempt, 1);

        // a duplicate enqueue would have re-run the (now terminal) record
        // as a skip; the usage ledger proves a single charge each
        let month = crate::domain::billing::month_key(chrono::Utc::now());
        let usage = orch
            .billing
            .lock()
            .unwrap()
            .usage_for_month("u2", &month)
            .unwrap()
            .unwrap();
        assert_eq!(usage.quota_used, 1);
    }

    #[tokio::test]
    async fn test_canceled_before_pickup_is_skipped() {
        let orch = orchestrator(Arc::new(MockGenerator::with_delay(Duration::from_millis(
            50,
        ))));
        let blocker = queued_job(&orch, "u1");
        let victim = queued_job(&orch, "u2");

        orch.enqueue(&blocker.id);
        orch.enqueue(&victim.id);
        orch.jobs
            .lock()
            .unwrap()
            .update(&victim.id, |mut j| {
                j.status = JobStatus::Canceled;
                j
            })
            .unwrap();

        wait_terminal(&orch, &blocker.id).await;
        let done = wait_terminal(&orch, &victim.id).await;
        assert_eq!(done.status, JobStatus::Canceled);
        assert!(done.output_image_urls.is_empty());
        assert!(done.charged_at.is_none());
    }

    #[tokio::test]
    async fn test_timeout_fails_with_code() {
        let jobs = Arc::new(Mutex::new(JobStore::open_in_memory(7).unwrap()));
        let billing = Arc::new(Mutex::new(
            BillingStore::open_in_memory(CoreSettings::default()).unwrap(),
        ));
        let orch = Arc::new(Orchestrator::new(
            jobs,
            billing,
            Arc::new(MockGenerator::with_delay(Duration::from_secs(60))),
            Telemetry::new(false),
            Duration::from_millis(50),
        ));
        let job = queued_job(&orch, "u1");

        orch.enqueue(&job.id);
        let done = wait_terminal(&orch, &job.id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(
            done.error.as_ref().unwrap().code.as_deref(),
            Some(error_codes::PROVIDER_TIMEOUT)
        );
        assert!(done.charged_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_inflight_job_returns_false() {
        let orch = orchestrator(Arc::new(MockGenerator::new()));
        assert!(!orch.cancel("job_missing", CancelReason::UserRequested));
    }
}
