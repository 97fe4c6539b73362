//! Exclusive, time boxed claims of a worker on a job.
//!
//! The lock store is the single source of truth for mutual exclusion between workers accepting
//! the same job. [`LockStore::acquire`] must be an indivisible check-and-set keyed by job id.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, WorkerId};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait LockStore {
    /// Claim `job_id` for `worker_id` until `expires_at`.
    ///
    /// Acquiring a lock already held by the same worker returns the existing lock. A lock that has
    /// passed its expiry may be taken over by another worker.
    async fn acquire(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<Lock, LockError>;
    /// Release the lock on `job_id` if it is held by `worker_id`.
    ///
    /// Returns whether a lock was removed; releasing a lock that is not held is not an error.
    async fn release(&self, job_id: JobId, worker_id: &WorkerId) -> Result<bool, LockError>;
    async fn holder(&self, job_id: JobId) -> Result<Option<Lock>, LockError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Job {job_id} is already locked by another worker")]
    Unavailable { job_id: JobId },
    #[error("Lock store in bad state")]
    BadState,
}
