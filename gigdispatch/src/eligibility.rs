//! The contract of the external "nearby workers" query.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, Location, WorkerId};

/// Input of a single eligibility lookup, one per dispatch wave.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub job_id: JobId,
    pub location: Location,
    pub radius_km: f64,
    pub wave: u32,
    pub limit: usize,
    pub skills: Vec<String>,
}

/// A worker who is online, KYC approved, and skill matched for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub worker_id: WorkerId,
    pub distance_km: f64,
}

/// Ranks eligible workers near a job.
///
/// Implementations must be free of side effects. The engine treats a failed lookup the same as
/// an empty one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EligibilityQuery {
    async fn nearby_workers(&self, query: &CandidateQuery)
        -> Result<Vec<Candidate>, EligibilityError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EligibilityError {
    #[error("Eligibility query unavailable: {0}")]
    Unavailable(String),
}
