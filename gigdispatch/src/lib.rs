//! Instant job dispatch and matching.
//!
//! A [`DispatchEngine`] takes newly posted instant jobs, broadcasts them to nearby eligible
//! workers in successive waves, locks each job to the first worker who accepts, drives the
//! employer's confirmation window, and supervises the two sided arrival barrier that starts the
//! billable clock.
//!
//! Every job runs as its own task; there is no lock shared across jobs. The job record in the
//! [`store::JobStore`] is the single authoritative state and is only changed through its
//! transition function, while the [`lock::LockStore`] guarantees that only one worker can win a
//! job.
//!
//! # Example
//!
//! ```
//! # use gigdispatch::prelude::*;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let directory = InMemoryDirectory::new();
//! directory
//!     .upsert_worker(WorkerProfile::new("w1", "Sam", Location::new(51.5080, -0.1280, "")))
//!     .unwrap();
//!
//! let engine = DispatchEngine::new(InMemoryJobStore::new(), InMemoryLockStore::new(), directory);
//! let mut worker = engine.connect(Actor::Worker("w1".into()));
//!
//! let job_id = JobBuilder::new("Stock shelves")
//!     .at(Location::new(51.5074, -0.1278, "1 Trafalgar Square"))
//!     .paying(8_000)
//!     .for_hours(4.0)
//!     .post(&engine, "e1".into())
//!     .await
//!     .unwrap();
//!
//! assert_eq!(worker.next_event().await.unwrap().name(), "ping");
//! let view = engine.accept_job(job_id, "w1".into()).await.unwrap();
//! assert_eq!(view.status, JobStatus::Locked);
//! # engine.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::sync::{Arc, RwLock};

pub mod channel;
pub mod coordinator;
pub mod directory;
pub mod dispatch;
pub mod eligibility;
pub mod job;
pub mod lock;
pub mod policy;
pub mod prelude;
pub mod session;
pub mod store;

use channel::{ChannelId, Event, EventHub, Subscription};
use chrono::Utc;
use directory::{ContactCard, ContactDirectory, DirectoryError, EmptyDirectory};
use dispatch::{DispatchHandle, DispatchRunner, Signal};
use eligibility::EligibilityQuery;
use fxhash::FxHashMap;
use job::{
    Actor, EmployerId, InstantJob, JobId, JobSpec, JobStatus, JobView, Location, Transition,
    TransitionError, WorkerId,
};
use lock::{LockError, LockStore};
use policy::DispatchPolicy;
use serde::{Deserialize, Serialize};
use session::Session;
use store::{JobStore, NewJob, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

type Dispatchers = Arc<RwLock<FxHashMap<JobId, DispatchHandle>>>;

/// The dispatch engine.
///
/// Cloning an engine is cheap; clones share the stores, the event hub and the running
/// dispatchers.
#[derive(Clone)]
pub struct DispatchEngine<S, L> {
    store: S,
    locks: L,
    eligibility: Arc<dyn EligibilityQuery + Send + Sync>,
    contacts: Arc<dyn ContactDirectory + Send + Sync>,
    events: EventHub,
    policy: DispatchPolicy,
    dispatchers: Dispatchers,
    shutdown: CancellationToken,
}

/// The result of cancelling a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    pub fee_applied: bool,
    pub fee: u64,
}

/// The counterpart's details, shared once a worker is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub name: String,
    pub phone: String,
    pub location: Location,
}

impl<S, L> DispatchEngine<S, L>
where
    S: JobStore + Clone + Send + Sync + 'static,
    L: LockStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        locks: L,
        eligibility: impl EligibilityQuery + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            locks,
            eligibility: Arc::new(eligibility),
            contacts: Arc::new(EmptyDirectory),
            events: EventHub::new(),
            policy: DispatchPolicy::default(),
            dispatchers: Default::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_policy(self, policy: DispatchPolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn with_contacts(self, contacts: impl ContactDirectory + Send + Sync + 'static) -> Self {
        Self {
            contacts: Arc::new(contacts),
            ..self
        }
    }

    /// Use an existing hub, for example one shared with the transport layer.
    pub fn with_events(self, events: EventHub) -> Self {
        Self { events, ..self }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Open a session for a connected client acting as `actor`.
    pub fn connect(&self, actor: Actor) -> Session<S, L> {
        Session::new(self.clone(), actor)
    }

    /// Subscribe to every event concerning `job_id`.
    pub fn watch(&self, job_id: JobId) -> Subscription {
        self.events.subscribe(ChannelId::Job(job_id))
    }

    #[instrument(skip_all, fields(%employer_id, job_id))]
    pub async fn create_instant_job(
        &self,
        employer_id: EmployerId,
        spec: JobSpec,
    ) -> Result<JobId, DispatchError> {
        let dispatch_expires_at = self.policy.dispatch_expiry(Utc::now());
        let job = self
            .store
            .insert(NewJob {
                employer_id,
                spec,
                dispatch_expires_at,
            })
            .await?;
        let job_id = job.id;
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));
        tracing::info!(%job_id, employer_id = %job.employer_id, "Instant job {job_id} created");

        self.spawn_dispatcher(job_id)?;
        Ok(job_id)
    }

    /// Claim `job_id` for `worker_id`.
    ///
    /// Only a worker who was pinged in the currently open wave can win the job. Accepting a job
    /// already locked by the same worker is a no-op.
    #[instrument(skip_all, fields(%job_id, %worker_id))]
    pub async fn accept_job(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
    ) -> Result<JobView, DispatchError> {
        let job = self.store.load(job_id).await?;
        if job.status == JobStatus::Locked && job.locked_by.as_ref() == Some(&worker_id) {
            return Ok(job.view());
        }
        if job.status != JobStatus::Dispatching || !self.is_offered(job_id, &worker_id)? {
            tracing::debug!(%job_id, %worker_id, "Job {job_id} is not available to {worker_id}");
            return Err(DispatchError::LockUnavailable { job_id });
        }

        let expires_at = self.policy.lock_expiry(Utc::now());
        self.locks
            .acquire(job_id, &worker_id, expires_at)
            .await
            .map_err(|err| match err {
                LockError::Unavailable { job_id } => DispatchError::LockUnavailable { job_id },
                err => err.into(),
            })?;

        let transition = Transition::Lock {
            worker: worker_id.clone(),
            expires_at,
        };
        let job = match self.store.apply(job_id, transition).await {
            Ok(job) => job,
            Err(StoreError::Transition(TransitionError::AlreadyApplied { .. })) => {
                return Ok(self.store.load(job_id).await?.view());
            }
            Err(err) => {
                self.release_lock(job_id, &worker_id).await;
                return Err(match err {
                    StoreError::Transition(_) => DispatchError::LockUnavailable { job_id },
                    err => err.into(),
                });
            }
        };

        tracing::info!(%job_id, %worker_id, "Job {job_id} locked by {worker_id}");
        self.notify_taken(&job);
        self.notify_parties(&job, Event::Locked { job: job.view() });
        self.signal(job_id, Signal::Locked(worker_id));
        Ok(job.view())
    }

    /// Cancel a job on behalf of its employer.
    ///
    /// Preempts any running wave or timer. A fee applies when the job had been locked or
    /// confirmed at the moment of cancellation.
    #[instrument(skip_all, fields(%job_id))]
    pub async fn cancel_job(
        &self,
        job_id: JobId,
        employer_id: EmployerId,
    ) -> Result<CancellationOutcome, DispatchError> {
        let job = self.store.load(job_id).await?;
        self.ensure_party(&job, &Actor::Employer(employer_id))?;

        let job = self
            .store
            .apply(
                job_id,
                Transition::Cancel {
                    policy: self.policy,
                },
            )
            .await
            .map_err(|err| DispatchError::transition(job_id, err))?;

        if let Some(handle) = self
            .dispatchers
            .read()
            .map_err(|_| DispatchError::BadState)?
            .get(&job_id)
        {
            handle.cancellation.cancel();
        }

        let (fee_applied, fee) = job
            .cancellation
            .as_ref()
            .map(|cancellation| (cancellation.fee_applied, cancellation.fee))
            .unwrap_or_default();
        if let Some(worker) = job.cancellation.as_ref().and_then(|c| c.worker.as_ref()) {
            self.release_lock(job_id, worker).await;
        }

        tracing::info!(%job_id, fee_applied, fee, "Job {job_id} cancelled by employer");
        self.notify_parties(&job, Event::Cancelled { job: job.view() });
        Ok(CancellationOutcome {
            job_id,
            status: job.status,
            fee_applied,
            fee,
        })
    }

    /// The authoritative view of a job, equivalent to what the event channel reports.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobView, DispatchError> {
        Ok(self.store.load(job_id).await?.view())
    }

    /// Contact details of the other party, available to both parties once the job is confirmed.
    pub async fn get_contact_info(
        &self,
        job_id: JobId,
        requester: Actor,
    ) -> Result<ContactInfo, DispatchError> {
        let job = self.store.load(job_id).await?;
        if !matches!(
            job.status,
            JobStatus::Confirmed | JobStatus::InProgress | JobStatus::Completed
        ) {
            return Err(DispatchError::ContactNotAvailable {
                job_id,
                status: job.status,
            });
        }
        self.ensure_party(&job, &requester)?;
        let counterpart = job
            .counterpart(&requester)
            .ok_or(DispatchError::ContactNotAvailable {
                job_id,
                status: job.status,
            })?;
        let ContactCard { name, phone } = self
            .contacts
            .contact_card(&counterpart)
            .await?
            .ok_or(DispatchError::ContactNotFound(counterpart))?;
        Ok(ContactInfo {
            name,
            phone,
            location: job.location,
        })
    }

    /// Restart dispatching for jobs left in flight, for example after a restart.
    ///
    /// Returns the number of dispatchers started.
    pub async fn resume(&self) -> Result<usize, DispatchError> {
        let jobs = self
            .store
            .with_status(&[JobStatus::Dispatching, JobStatus::Locked])
            .await?;
        let mut started = 0;
        for job in jobs {
            let running = self
                .dispatchers
                .read()
                .map_err(|_| DispatchError::BadState)?
                .contains_key(&job.id);
            if !running {
                self.spawn_dispatcher(job.id)?;
                started += 1;
            }
        }
        tracing::info!(started, "Resumed {started} dispatchers");
        Ok(started)
    }

    /// Stop every dispatcher task and wait for them to finish.
    ///
    /// Jobs are left in their current state and can be picked up again with
    /// [`DispatchEngine::resume`].
    pub async fn graceful_shutdown(&self) -> Result<(), DispatchError> {
        tracing::debug!("Shutting down dispatch engine");
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .dispatchers
            .write()
            .map_err(|_| DispatchError::BadState)?
            .values_mut()
            .filter_map(|handle| handle.handle.take())
            .collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .try_for_each(|result| result.map_err(|_| DispatchError::GracefulShutdownFailed))
    }

    fn spawn_dispatcher(&self, job_id: JobId) -> Result<(), DispatchError> {
        let mut dispatchers = self
            .dispatchers
            .write()
            .map_err(|_| DispatchError::BadState)?;
        let (signals, receiver) = mpsc::unbounded_channel();
        let cancellation = self.shutdown.child_token();
        let offer = Arc::new(RwLock::new(None));
        let runner = DispatchRunner::new(
            self.clone(),
            job_id,
            receiver,
            cancellation.clone(),
            offer.clone(),
        );
        dispatchers.insert(
            job_id,
            DispatchHandle {
                signals,
                cancellation,
                offer,
                handle: Some(tokio::spawn(runner.run())),
            },
        );
        Ok(())
    }

    pub(crate) fn forget_dispatcher(&self, job_id: JobId) {
        match self.dispatchers.write() {
            Ok(mut dispatchers) => {
                dispatchers.remove(&job_id);
            }
            Err(err) => tracing::error!(%job_id, ?err, "Failed to remove dispatcher for {job_id}"),
        }
    }

    fn is_offered(&self, job_id: JobId, worker_id: &WorkerId) -> Result<bool, DispatchError> {
        let dispatchers = self
            .dispatchers
            .read()
            .map_err(|_| DispatchError::BadState)?;
        let Some(handle) = dispatchers.get(&job_id) else {
            return Ok(false);
        };
        let offer = handle.offer.read().map_err(|_| DispatchError::BadState)?;
        Ok(offer.as_ref().is_some_and(|wave| wave.includes(worker_id)))
    }

    pub(crate) fn signal(&self, job_id: JobId, signal: Signal) {
        match self.dispatchers.read() {
            Ok(dispatchers) => {
                if let Some(handle) = dispatchers.get(&job_id) {
                    handle.signal(signal);
                }
            }
            Err(err) => tracing::error!(%job_id, ?err, "Failed to signal dispatcher for {job_id}"),
        }
    }

    pub(crate) async fn release_lock(&self, job_id: JobId, worker_id: &WorkerId) {
        let _ = self
            .locks
            .release(job_id, worker_id)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to release lock on {job_id} held by {worker_id}, error: {err:?}",
                )
            });
    }

    fn ensure_party(&self, job: &InstantJob, actor: &Actor) -> Result<(), DispatchError> {
        if job.is_party(actor) {
            Ok(())
        } else {
            Err(DispatchError::NotParticipant {
                job_id: job.id,
                actor: actor.clone(),
            })
        }
    }

    /// Push `event` to the employer and to whichever worker is attached to the job.
    pub(crate) fn notify_parties(&self, job: &InstantJob, event: Event) {
        let worker = job
            .locked_by
            .as_ref()
            .or(job.accepted_by.as_ref())
            .or_else(|| job.cancellation.as_ref().and_then(|c| c.worker.as_ref()));
        let mut channels = vec![ChannelId::Employer(job.employer_id.clone())];
        channels.extend(worker.cloned().map(ChannelId::Worker));
        self.events.broadcast(&channels, event);
    }

    fn notify_taken(&self, job: &InstantJob) {
        let candidates = match self.dispatchers.read() {
            Ok(dispatchers) => dispatchers
                .get(&job.id)
                .and_then(|handle| handle.offer.read().ok().and_then(|offer| offer.clone()))
                .map(|wave| wave.candidate_ids)
                .unwrap_or_default(),
            Err(_) => vec![],
        };
        let event = Event::Taken { job_id: job.id };
        candidates
            .iter()
            .filter(|candidate| job.locked_by.as_ref() != Some(*candidate))
            .for_each(|candidate| {
                self.events
                    .publish(&ChannelId::Worker(candidate.clone()), &event);
            });
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Job {job_id} has already been taken")]
    LockUnavailable { job_id: JobId },
    #[error("Job {job_id} has already been handled")]
    AlreadyResolved { job_id: JobId },
    #[error("Cannot {event} job {job_id} while it is {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        event: &'static str,
    },
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("{actor} is not a party to job {job_id}")]
    NotParticipant { job_id: JobId, actor: Actor },
    #[error("Contact details for job {job_id} are not available while it is {status}")]
    ContactNotAvailable { job_id: JobId, status: JobStatus },
    #[error("No contact details recorded for {0}")]
    ContactNotFound(Actor),
    #[error("Error communicating with the job store")]
    Store(#[source] StoreError),
    #[error("Error communicating with the lock store")]
    Lock(#[from] LockError),
    #[error("Error communicating with the directory")]
    Directory(#[from] DirectoryError),
    #[error("Dispatch engine in bad state")]
    BadState,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::JobNotFound(job_id) => DispatchError::JobNotFound(job_id),
            err => DispatchError::Store(err),
        }
    }
}

impl DispatchError {
    /// Classify the failure of applying a transition to `job_id`.
    pub(crate) fn transition(job_id: JobId, err: StoreError) -> Self {
        match err {
            StoreError::Transition(TransitionError::AlreadyApplied { .. }) => {
                DispatchError::AlreadyResolved { job_id }
            }
            StoreError::Transition(TransitionError::Invalid { from, event }) => {
                DispatchError::InvalidTransition {
                    job_id,
                    from,
                    event,
                }
            }
            err => err.into(),
        }
    }

    /// A stable, machine readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::LockUnavailable { .. } => "lock_unavailable",
            DispatchError::AlreadyResolved { .. } => "already_resolved",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::ContactNotAvailable { .. } => "invalid_transition",
            DispatchError::JobNotFound(_) | DispatchError::ContactNotFound(_) => "not_found",
            DispatchError::NotParticipant { .. } => "forbidden",
            DispatchError::Store(_)
            | DispatchError::Lock(_)
            | DispatchError::Directory(_)
            | DispatchError::BadState
            | DispatchError::GracefulShutdownFailed => "internal",
        }
    }
}
