//! The instant job data model.
//!
//! An [`InstantJob`] is created in [`JobStatus::Dispatching`] and from then on is only ever changed
//! by applying a [`Transition`] to it. The job store owns the authoritative copy of every job;
//! every other component works with clones or with the serialisable [`JobView`].
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod builder;
pub(crate) mod transition;

pub use transition::{Transition, TransitionError};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

macro_rules! user_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Eq, PartialEq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

user_id!(
    /// Identity of an on-demand worker.
    WorkerId
);
user_id!(
    /// Identity of the employer who posted a job.
    EmployerId
);

/// One of the two parties of an instant job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Employer(EmployerId),
    #[serde(alias = "student")]
    Worker(WorkerId),
}

impl Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Employer(id) => write!(f, "employer:{id}"),
            Actor::Worker(id) => write!(f, "worker:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, address: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            address: address.into(),
        }
    }

    /// Great-circle distance between two locations in kilometres.
    pub fn distance_km(&self, other: &Location) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// The immutable description of the work, fixed once dispatch starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub title: String,
    pub location: Location,
    /// Total payout in minor currency units.
    pub pay: u64,
    pub duration_hours: f64,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Dispatching,
    Locked,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed | JobStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Dispatching => "dispatching",
            JobStatus::Locked => "locked",
            JobStatus::Confirmed => "confirmed",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalStatus {
    EnRoute,
    Arrived,
    Confirmed,
}

/// What happened when a job was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub at: DateTime<Utc>,
    pub from_status: JobStatus,
    /// The worker holding or assigned to the job at the moment of cancellation.
    pub worker: Option<WorkerId>,
    pub fee_applied: bool,
    pub fee: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstantJob {
    pub id: JobId,
    pub employer_id: EmployerId,
    pub title: String,
    pub location: Location,
    pub pay: u64,
    pub duration_hours: f64,
    pub skills: Vec<String>,
    pub status: JobStatus,
    pub current_wave: u32,
    pub locked_by: Option<WorkerId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<WorkerId>,
    pub arrival_status: Option<ArrivalStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub cancellation_fee_applicable: bool,
    /// Number of locks taken on this job that have since been resolved.
    pub lock_cycles: u32,
    pub worker_arrived_at: Option<DateTime<Utc>>,
    pub employer_confirmed_arrival_at: Option<DateTime<Utc>>,
    pub completion_requested_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dispatch_expires_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
}

impl InstantJob {
    pub(crate) fn new(
        id: JobId,
        employer_id: EmployerId,
        spec: JobSpec,
        dispatch_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            employer_id,
            title: spec.title,
            location: spec.location,
            pay: spec.pay,
            duration_hours: spec.duration_hours,
            skills: spec.skills,
            status: JobStatus::Dispatching,
            current_wave: 1,
            locked_by: None,
            lock_expires_at: None,
            accepted_by: None,
            arrival_status: None,
            start_time: None,
            cancellation_fee_applicable: false,
            lock_cycles: 0,
            worker_arrived_at: None,
            employer_confirmed_arrival_at: None,
            completion_requested_at: None,
            completed_at: None,
            dispatch_expires_at,
            cancellation: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_party(&self, actor: &Actor) -> bool {
        match actor {
            Actor::Employer(employer) => &self.employer_id == employer,
            Actor::Worker(worker) => {
                self.accepted_by.as_ref() == Some(worker) || self.locked_by.as_ref() == Some(worker)
            }
        }
    }

    /// The counterpart of `actor` on this job, if one has been assigned.
    pub fn counterpart(&self, actor: &Actor) -> Option<Actor> {
        match actor {
            Actor::Employer(_) => self.accepted_by.clone().map(Actor::Worker),
            Actor::Worker(_) => Some(Actor::Employer(self.employer_id.clone())),
        }
    }

    /// Time worked so far, or in total once the job is complete.
    pub fn worked_for(&self, now: DateTime<Utc>) -> Option<chrono::TimeDelta> {
        self.start_time
            .map(|start| self.completed_at.unwrap_or(now) - start)
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id,
            employer_id: self.employer_id.clone(),
            title: self.title.clone(),
            pay: self.pay,
            duration_hours: self.duration_hours,
            status: self.status,
            current_wave: self.current_wave,
            locked_by: self.locked_by.clone(),
            lock_expires_at: self.lock_expires_at,
            accepted_by: self.accepted_by.clone(),
            arrival_status: self.arrival_status,
            start_time: self.start_time,
            cancellation_fee_applicable: self.cancellation_fee_applicable,
            completion_requested: self.completion_requested_at.is_some(),
            completed_at: self.completed_at,
            cancellation: self.cancellation.clone(),
        }
    }
}

/// The read model of a job, shared by status polls and pushed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub employer_id: EmployerId,
    pub title: String,
    pub pay: u64,
    pub duration_hours: f64,
    pub status: JobStatus,
    pub current_wave: u32,
    pub locked_by: Option<WorkerId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<WorkerId>,
    pub arrival_status: Option<ArrivalStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub cancellation_fee_applicable: bool,
    pub completion_requested: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
}
