use serde::{Deserialize, Serialize};

/// Machine codes recorded on failed jobs
pub mod error_codes {
    pub const JOB_CANCELED: &str = "JOB_CANCELED";
    pub const PROVIDER_TIMEOUT: &str = "PROVIDER_TIMEOUT";
    pub const MODEL_UNSUPPORTED: &str = "MODEL_UNSUPPORTED";
    pub const ORPHANED_ON_RESTART: &str = "ORPHANED_ON_RESTART";
}

/// Job state machine: queued → running → {succeeded | failed | canceled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Non-terminal states count against the one-active-job-per-user limit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Which inference backend a job was created against (fixed at creation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openrouter,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openrouter => "openrouter",
            Self::Mock => "mock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openrouter" => Some(Self::Openrouter),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

/// Generation parameters, copyable to a cloned job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    /// Likeness weight 0-100; 100 - identity_strength is the style weight
    pub identity_strength: u8,
}

impl JobParams {
    pub fn new(identity_strength: u8) -> Self {
        Self {
            identity_strength: identity_strength.min(100),
        }
    }
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            identity_strength: 30,
        }
    }
}

/// Human-readable message plus machine code, set when a job fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub code: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            message: message.into(),
            code: code.map(str::to_string),
        }
    }
}

/// Durable job record. `input_image_url`, `user_id` and `charged_at` stay
/// inside the core; external callers only ever see a [`JobView`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub style_id: String,
    pub params: JobParams,
    pub input_image_url: String,
    pub output_image_urls: Vec<String>,
    pub error: Option<JobError>,
    pub attempt: u32,
    pub provider: ProviderKind,
    pub charged_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRecord {
    pub fn new_id() -> String {
        format!("job_{}", uuid::Uuid::new_v4())
    }
}

/// External projection of a job record
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub style_id: String,
    pub params: JobParams,
    pub output_image_urls: Vec<String>,
    pub error: Option<JobError>,
    pub attempt: u32,
    pub provider: ProviderKind,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRecord> for JobView {
    fn from(r: JobRecord) -> Self {
        Self {
            id: r.id,
            status: r.status,
            style_id: r.style_id,
            params: r.params,
            output_image_urls: r.output_image_urls,
            error: r.error,
            attempt: r.attempt,
            provider: r.provider,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}
