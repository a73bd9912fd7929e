pub mod admission;
pub mod job_service;
pub mod orchestrator;

pub use admission::AdmissionDenied;
pub use job_service::{CloneOverrides, JobService, ServiceError};
pub use orchestrator::Orchestrator;
