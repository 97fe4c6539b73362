//! The authoritative store of instant jobs.
//!
//! A [`JobStore`] never exposes a way to write a job directly: the only mutation is
//! [`JobStore::apply`], which runs the job's transition function atomically against the stored
//! record. This keeps the lifecycle invariants intact no matter how many callers race on the same
//! job.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{EmployerId, InstantJob, JobId, JobSpec, JobStatus, Transition, TransitionError};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait JobStore {
    /// Persist a new job in [`JobStatus::Dispatching`] and return it with its assigned id.
    async fn insert(&self, job: NewJob) -> Result<InstantJob, StoreError>;
    async fn load(&self, id: JobId) -> Result<InstantJob, StoreError>;
    /// Atomically apply `transition` to the stored job and return the updated record.
    async fn apply(&self, id: JobId, transition: Transition) -> Result<InstantJob, StoreError>;
    async fn with_status(&self, statuses: &[JobStatus]) -> Result<Vec<InstantJob>, StoreError>;
}

/// A job ready to be inserted into a [`JobStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub employer_id: EmployerId,
    pub spec: JobSpec,
    pub dispatch_expires_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn into_job(self, id: JobId) -> InstantJob {
        InstantJob::new(id, self.employer_id, self.spec, self.dispatch_expires_at)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Job store in bad state")]
    BadState,
}
