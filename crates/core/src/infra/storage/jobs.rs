use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::error::AppError;
use crate::domain::job::{
    error_codes, JobError, JobParams, JobRecord, JobStatus, ProviderKind,
};

use super::now_rfc3339;

/// Creation input for a fresh job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub style_id: String,
    pub params: JobParams,
    pub input_image_url: String,
    pub provider: ProviderKind,
}

/// SQLite job record store.
///
/// Exclusively owns the job lifecycle. All mutations are read-modify-write
/// against a single connection; callers serialize access with a mutex.
/// Expired records are pruned lazily on every public operation, so callers
/// never observe a job older than the retention window.
pub struct JobStore {
    conn: Connection,
    retention_days: u32,
}

impl JobStore {
    pub fn open(path: &str, retention_days: u32) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::storage(format!("job db open failed: {e}")))?;
        let store = Self {
            conn,
            retention_days,
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory(retention_days: u32) -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::storage(format!("in-memory job db failed: {e}")))?;
        let store = Self {
            conn,
            retention_days,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    job_id            TEXT PRIMARY KEY,
                    user_id           TEXT NOT NULL,
                    status            TEXT NOT NULL,
                    style_id          TEXT NOT NULL,
                    identity_strength INTEGER NOT NULL DEFAULT 30,
                    input_image_url   TEXT NOT NULL,
                    output_image_urls TEXT NOT NULL DEFAULT '[]',
                    error_message     TEXT,
                    error_code        TEXT,
                    attempt           INTEGER NOT NULL DEFAULT 1,
                    provider          TEXT NOT NULL,
                    charged_at        TEXT,
                    created_at        TEXT NOT NULL,
                    updated_at        TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_user
                    ON jobs(user_id, created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_jobs_user_status
                    ON jobs(user_id, status);
                ",
            )
            .map_err(|e| AppError::storage(format!("job db migration failed: {e}")))?;
        Ok(())
    }

    /// Deletes records past the retention window. Runs before every public
    /// operation; there is no background sweeper.
    fn prune_expired(&self) -> Result<(), AppError> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::days(i64::from(self.retention_days)))
        .to_rfc3339();
        self.conn
            .execute("DELETE FROM jobs WHERE created_at <= ?1", params![cutoff])
            .map_err(|e| AppError::storage(format!("job expiry prune failed: {e}")))?;
        Ok(())
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn create(&self, new: NewJob) -> Result<JobRecord, AppError> {
        self.prune_expired()?;

        let now = now_rfc3339();
        let job = JobRecord {
            id: JobRecord::new_id(),
            user_id: new.user_id,
            status: JobStatus::Queued,
            style_id: new.style_id,
            params: new.params,
            input_image_url: new.input_image_url,
            output_image_urls: vec![],
            error: None,
            attempt: 1,
            provider: new.provider,
            charged_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.insert(&job)?;
        Ok(job)
    }

    /// Copies the input reference from an owner-matching source into a new
    /// queued job. Returns `None` when the source is missing or foreign.
    pub fn clone_from(
        &self,
        source_id: &str,
        user_id: &str,
        style_id: String,
        params: JobParams,
        provider: ProviderKind,
    ) -> Result<Option<JobRecord>, AppError> {
        self.prune_expired()?;

        let Some(source) = self.select(source_id)? else {
            return Ok(None);
        };
        if source.user_id != user_id {
            return Ok(None);
        }

        let now = now_rfc3339();
        let job = JobRecord {
            id: JobRecord::new_id(),
            user_id: user_id.to_string(),
            status: JobStatus::Queued,
            style_id,
            params,
            input_image_url: source.input_image_url,
            output_image_urls: vec![],
            error: None,
            attempt: 1,
            provider,
            charged_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.insert(&job)?;
        Ok(Some(job))
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, AppError> {
        self.prune_expired()?;
        self.select(job_id)
    }

    /// Atomic read-modify-write: the mutator sees the current record and
    /// returns the next one. `id`, `user_id` and `created_at` are immutable;
    /// `updated_at` is re-stamped here. Other callers never observe a
    /// partial write.
    pub fn update(
        &self,
        job_id: &str,
        mutate: impl FnOnce(JobRecord) -> JobRecord,
    ) -> Result<Option<JobRecord>, AppError> {
        self.prune_expired()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| AppError::storage(format!("job update tx failed: {e}")))?;

        let Some(current) = self.select(job_id)? else {
            return Ok(None);
        };

        let mut next = mutate(current.clone());
        next.id = current.id;
        next.user_id = current.user_id;
        next.created_at = current.created_at;
        next.updated_at = now_rfc3339();

        let outputs = serde_json::to_string(&next.output_image_urls)
            .map_err(|e| AppError::internal(format!("output urls serialize: {e}")))?;
        tx.execute(
            "UPDATE jobs SET status = ?1, style_id = ?2, identity_strength = ?3,
                    output_image_urls = ?4, error_message = ?5, error_code = ?6,
                    attempt = ?7, charged_at = ?8, updated_at = ?9
             WHERE job_id = ?10",
            params![
                next.status.as_str(),
                next.style_id,
                next.params.identity_strength,
                outputs,
                next.error.as_ref().map(|e| e.message.clone()),
                next.error.as_ref().and_then(|e| e.code.clone()),
                next.attempt,
                next.charged_at,
                next.updated_at,
                job_id,
            ],
        )
        .map_err(|e| AppError::storage(format!("job update failed: {e}")))?;
        tx.commit()
            .map_err(|e| AppError::storage(format!("job update commit failed: {e}")))?;

        Ok(Some(next))
    }

    /// Newest-first by created_at, ties broken by updated_at
    pub fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<JobRecord>, AppError> {
        self.prune_expired()?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM jobs WHERE user_id = ?1
                 ORDER BY created_at DESC, updated_at DESC LIMIT ?2",
            )
            .map_err(|e| AppError::storage(format!("job list query failed: {e}")))?;
        let rows = stmt
            .query_map(params![user_id, limit], row_to_job)
            .map_err(|e| AppError::storage(format!("job list query failed: {e}")))?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.map_err(|e| AppError::storage(format!("job row read failed: {e}")))?);
        }
        Ok(jobs)
    }

    /// The single queued/running job for an owner, if any
    pub fn active_id_for_user(&self, user_id: &str) -> Result<Option<String>, AppError> {
        self.prune_expired()?;

        self.conn
            .query_row(
                "SELECT job_id FROM jobs
                 WHERE user_id = ?1 AND status IN ('queued', 'running')
                 LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::storage(format!("active job query failed: {e}")))
    }

    pub fn delete_one(&self, job_id: &str, user_id: &str) -> Result<bool, AppError> {
        self.prune_expired()?;

        let deleted = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE job_id = ?1 AND user_id = ?2",
                params![job_id, user_id],
            )
            .map_err(|e| AppError::storage(format!("job delete failed: {e}")))?;
        Ok(deleted > 0)
    }

    pub fn delete_all_for_user(&self, user_id: &str) -> Result<usize, AppError> {
        self.prune_expired()?;

        self.conn
            .execute("DELETE FROM jobs WHERE user_id = ?1", params![user_id])
            .map_err(|e| AppError::storage(format!("job delete failed: {e}")))
    }

    /// Startup reconciliation: a restart loses the in-memory queue, so any
    /// job still `running` is unrecoverable and is failed with a distinct
    /// code instead of being left stuck. Returns the reconciled records.
    pub fn fail_orphaned_running(&self) -> Result<Vec<JobRecord>, AppError> {
        self.prune_expired()?;

        let mut stmt = self
            .conn
            .prepare("SELECT job_id FROM jobs WHERE status = 'running'")
            .map_err(|e| AppError::storage(format!("orphan query failed: {e}")))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| AppError::storage(format!("orphan query failed: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("orphan row read failed: {e}")))?;

        let mut orphans = Vec::new();
        for id in ids {
            if let Some(job) = self.update(&id, |mut job| {
                job.status = JobStatus::Failed;
                job.error = Some(JobError::new(
                    "job was interrupted by a service restart",
                    Some(error_codes::ORPHANED_ON_RESTART),
                ));
                job
            })? {
                orphans.push(job);
            }
        }
        Ok(orphans)
    }

    fn insert(&self, job: &JobRecord) -> Result<(), AppError> {
        let outputs = serde_json::to_string(&job.output_image_urls)
            .map_err(|e| AppError::internal(format!("output urls serialize: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO jobs (job_id, user_id, status, style_id, identity_strength,
                                   input_image_url, output_image_urls, error_message,
                                   error_code, attempt, provider, charged_at,
                                   created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    job.id,
                    job.user_id,
                    job.status.as_str(),
                    job.style_id,
                    job.params.identity_strength,
                    job.input_image_url,
                    outputs,
                    job.error.as_ref().map(|e| e.message.clone()),
                    job.error.as_ref().and_then(|e| e.code.clone()),
                    job.attempt,
                    job.provider.as_str(),
                    job.charged_at,
                    job.created_at,
                    job.updated_at,
                ],
            )
            .map_err(|e| AppError::storage(format!("job insert failed: {e}")))?;
        Ok(())
    }

    fn select(&self, job_id: &str) -> Result<Option<JobRecord>, AppError> {
        self.conn
            .query_row(
                "SELECT * FROM jobs WHERE job_id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()
            .map_err(|e| AppError::storage(format!("job select failed: {e}")))
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get("status")?;
    let provider: String = row.get("provider")?;
    let outputs: String = row.get("output_image_urls")?;
    let error_message: Option<String> = row.get("error_message")?;
    let error_code: Option<String> = row.get("error_code")?;
    let identity_strength: u8 = row.get("identity_strength")?;

    Ok(JobRecord {
        id: row.get("job_id")?,
        user_id: row.get("user_id")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        style_id: row.get("style_id")?,
        params: JobParams::new(identity_strength),
        input_image_url: row.get("input_image_url")?,
        output_image_urls: serde_json::from_str(&outputs).unwrap_or_default(),
        error: error_message.map(|message| JobError {
            message,
            code: error_code,
        }),
        attempt: row.get("attempt")?,
        provider: ProviderKind::parse(&provider).unwrap_or(ProviderKind::Mock),
        charged_at: row.get("charged_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::open_in_memory(7).unwrap()
    }

    fn new_job(user: &str) -> NewJob {
        NewJob {
            user_id: user.to_string(),
            style_id: "retro".to_string(),
            params: JobParams::new(40),
            input_image_url: "data:image/png;base64,abcd".to_string(),
            provider: ProviderKind::Mock,
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = store();
        let job = store.create(new_job("u1")).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.user_id, "u1");
        assert_eq!(loaded.params.identity_strength, 40);
        assert!(loaded.charged_at.is_none());
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let store = store();
        let job = store.create(new_job("u1")).unwrap();

        let updated = store
            .update(&job.id, |mut j| {
                j.status = JobStatus::Running;
                j
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);

        // immutable fields survive a hostile mutator
        let updated = store
            .update(&job.id, |mut j| {
                j.user_id = "someone-else".to_string();
                j.created_at = "1970-01-01T00:00:00+00:00".to_string();
                j
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.user_id, "u1");
        assert_eq!(updated.created_at, job.created_at);
    }

    #[test]
    fn test_update_missing_returns_none() {
        let store = store();
        assert!(store.update("job_missing", |j| j).unwrap().is_none());
    }

    #[test]
    fn test_active_id_tracks_lifecycle() {
        let store = store();
        assert!(store.active_id_for_user("u1").unwrap().is_none());

        let job = store.create(new_job("u1")).unwrap();
        assert_eq!(store.active_id_for_user("u1").unwrap(), Some(job.id.clone()));
        assert!(store.active_id_for_user("u2").unwrap().is_none());

        store
            .update(&job.id, |mut j| {
                j.status = JobStatus::Succeeded;
                j
            })
            .unwrap();
        assert!(store.active_id_for_user("u1").unwrap().is_none());
    }

    #[test]
    fn test_list_newest_first_and_limited() {
        let store = store();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.create(new_job("u1")).unwrap().id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        store.create(new_job("u2")).unwrap();

        let listed = store.list_for_user("u1", 2).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
    }

    #[test]
    fn test_clone_from_owner_match() {
        let store = store();
        let source = store.create(new_job("u1")).unwrap();

        let cloned = store
            .clone_from(&source.id, "u1", "noir".to_string(), JobParams::new(80), ProviderKind::Mock)
            .unwrap()
            .unwrap();
        assert_ne!(cloned.id, source.id);
        assert_eq!(cloned.input_image_url, source.input_image_url);
        assert_eq!(cloned.style_id, "noir");
        assert_eq!(cloned.status, JobStatus::Queued);

        // foreign owner or missing source yields None
        assert!(store
            .clone_from(&source.id, "u2", "noir".to_string(), JobParams::default(), ProviderKind::Mock)
            .unwrap()
            .is_none());
        assert!(store
            .clone_from("job_missing", "u1", "noir".to_string(), JobParams::default(), ProviderKind::Mock)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_scoped_to_owner() {
        let store = store();
        let job = store.create(new_job("u1")).unwrap();

        assert!(!store.delete_one(&job.id, "u2").unwrap());
        assert!(store.get(&job.id).unwrap().is_some());
        assert!(store.delete_one(&job.id, "u1").unwrap());
        assert!(store.get(&job.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_all_for_user() {
        let store = store();
        store.create(new_job("u1")).unwrap();
        store.create(new_job("u1")).unwrap();
        let other = store.create(new_job("u2")).unwrap();

        assert_eq!(store.delete_all_for_user("u1").unwrap(), 2);
        assert!(store.get(&other.id).unwrap().is_some());
    }

    #[test]
    fn test_lazy_expiry_hides_old_jobs() {
        let store = JobStore::open_in_memory(0).unwrap();
        let job = store.create(new_job("u1")).unwrap();

        // retention window of zero days: the record expires on the next read
        assert!(store.get(&job.id).unwrap().is_none());
        assert!(store.list_for_user("u1", 30).unwrap().is_empty());
    }

    #[test]
    fn test_fail_orphaned_running() {
        let store = store();
        let running = store.create(new_job("u1")).unwrap();
        store
            .update(&running.id, |mut j| {
                j.status = JobStatus::Running;
                j
            })
            .unwrap();
        let queued = store.create(new_job("u2")).unwrap();

        let orphans = store.fail_orphaned_running().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, running.id);
        assert_eq!(orphans[0].status, JobStatus::Failed);
        assert_eq!(
            orphans[0].error.as_ref().unwrap().code.as_deref(),
            Some(error_codes::ORPHANED_ON_RESTART)
        );

        // queued jobs are left alone; they are still in the durable queue
        assert_eq!(store.get(&queued.id).unwrap().unwrap().status, JobStatus::Queued);
    }
}
