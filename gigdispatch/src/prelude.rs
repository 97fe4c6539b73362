//! The purpose of this module is to alleviate the need to import many of the `[gigdispatch]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use gigdispatch::prelude::*;
//! ```
pub use crate::channel::{ChannelId, Event, EventHub, RejectReason, Subscription};
pub use crate::coordinator::Decision;
pub use crate::directory::{ContactCard, ContactDirectory, InMemoryDirectory, WorkerProfile};
pub use crate::eligibility::{Candidate, CandidateQuery, EligibilityQuery};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{
    Actor, ArrivalStatus, EmployerId, JobId, JobSpec, JobStatus, JobView, Location, WorkerId,
};
pub use crate::lock::memory::InMemoryLockStore;
pub use crate::lock::LockStore;
pub use crate::policy::DispatchPolicy;
pub use crate::session::{Action, Reply, Session};
pub use crate::store::memory::InMemoryJobStore;
pub use crate::store::JobStore;
pub use crate::{CancellationOutcome, ContactInfo, DispatchEngine, DispatchError};
