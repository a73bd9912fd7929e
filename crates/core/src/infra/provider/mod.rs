pub mod openrouter;
mod noop;

pub use noop::MockGenerator;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::domain::job::{error_codes, JobError, ProviderKind};

/// Builds the configured inference backend: OpenRouter when an API key is
/// present in the environment, otherwise the mock.
pub fn create_generator() -> Arc<dyn ImageGenerator> {
    if let Some(config) = openrouter::OpenRouterConfig::from_env() {
        match openrouter::OpenRouterGenerator::new(config) {
            Ok(generator) => {
                log::info!("OpenRouter image backend selected");
                return Arc::new(generator);
            }
            Err(err) => {
                log::warn!("OpenRouter client init failed, falling back to mock: {err}");
            }
        }
    }

    log::info!("no OPENROUTER_API_KEY set, using mock image backend");
    Arc::new(MockGenerator::new())
}

/// Why an in-flight generation was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The owner canceled the job
    UserRequested,
    /// The orchestrator's deadline elapsed
    TimedOut,
}

/// Creates a linked cancellation handle/token pair. The handle side lives in
/// the orchestrator's per-job map; the token side is handed to the provider,
/// which only ever observes this one signal regardless of whether a user
/// cancel or the deadline fired it.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
}

impl CancelHandle {
    /// Signals cancellation. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signaled. Pends forever if the handle
    /// is dropped without firing, so racing this against real work is safe.
    pub async fn canceled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Request handed to an inference backend
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub input_image_url: String,
    pub style_id: String,
    /// Likeness weight 0-100
    pub identity_strength: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("generation canceled")]
    Canceled(CancelReason),
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider response could not be parsed: {0}")]
    Parse(String),
    #[error("the configured model does not support this request")]
    ModelUnsupported,
    #[error("no images were returned")]
    NoImages,
}

impl GenerateError {
    /// Machine code recorded on the job when this error fails it
    pub fn code(&self) -> Option<String> {
        match self {
            Self::Canceled(CancelReason::UserRequested) => {
                Some(error_codes::JOB_CANCELED.to_string())
            }
            Self::Canceled(CancelReason::TimedOut) => {
                Some(error_codes::PROVIDER_TIMEOUT.to_string())
            }
            Self::Http { status, .. } => Some(format!("OPENROUTER_HTTP_{status}")),
            Self::ModelUnsupported => Some(error_codes::MODEL_UNSUPPORTED.to_string()),
            Self::Request(_) | Self::Parse(_) | Self::NoImages => None,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError {
            message: self.to_string(),
            code: self.code(),
        }
    }
}

/// Inference backend seam. The orchestrator never issues more than one
/// concurrent call per job id; implementations must react to the token
/// promptly and may be retried for the same job.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: CancelToken,
    ) -> Result<Vec<String>, GenerateError>;
}
