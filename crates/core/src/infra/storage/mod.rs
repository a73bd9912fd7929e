mod billing;
mod jobs;

pub use billing::BillingStore;
pub use jobs::{JobStore, NewJob};

use std::path::PathBuf;

/// Default on-disk location for the core databases
/// (`~/.local/share/avatarforge` or the platform equivalent).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("avatarforge")
}

pub fn default_jobs_db_path() -> PathBuf {
    default_data_dir().join("jobs.db")
}

pub fn default_billing_db_path() -> PathBuf {
    default_data_dir().join("billing.db")
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
