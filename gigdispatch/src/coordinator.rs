//! The confirmation coordinator.
//!
//! Once a worker holds the lock on a job the employer has a bounded window to confirm or reject
//! them. Whichever comes first of the employer's decision and the window elapsing resolves the
//! lock; the loser of that race observes [`DispatchError::AlreadyResolved`]. After confirmation the
//! coordinator supervises the arrival barrier: the job only moves to in progress, starting the
//! billable clock, once both the worker and the employer have marked arrival.
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelId, Event, RejectReason},
    dispatch::{sleep_until, DispatchRunner, Flow, Signal},
    job::{
        Actor, ArrivalStatus, EmployerId, InstantJob, JobId, JobStatus, JobView, Transition,
        TransitionError, WorkerId,
    },
    lock::LockStore,
    store::{JobStore, StoreError},
    DispatchEngine, DispatchError,
};

/// The employer's answer to a locked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Confirm,
    Reject,
}

/// How a lock came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Confirmed,
    Rejected,
    Expired,
}

impl Resolution {
    fn transition(self, worker: WorkerId) -> Transition {
        match self {
            Resolution::Confirmed => Transition::Confirm { worker },
            Resolution::Rejected => Transition::Reject { worker },
            Resolution::Expired => Transition::ExpireLock { worker },
        }
    }

    fn event_name(self) -> &'static str {
        match self {
            Resolution::Confirmed => "confirm",
            Resolution::Rejected => "reject",
            Resolution::Expired => "expire_lock",
        }
    }
}

impl From<Decision> for Resolution {
    fn from(value: Decision) -> Self {
        match value {
            Decision::Confirm => Resolution::Confirmed,
            Decision::Reject => Resolution::Rejected,
        }
    }
}

impl<S, L> DispatchEngine<S, L>
where
    S: JobStore + Clone + Send + Sync + 'static,
    L: LockStore + Clone + Send + Sync + 'static,
{
    /// Confirm or reject the worker currently holding the lock on `job_id`.
    ///
    /// Rejecting returns the job to dispatching in its current wave; the rejected worker is not
    /// offered the job again.
    pub async fn confirm_worker(
        &self,
        job_id: JobId,
        employer_id: EmployerId,
        decision: Decision,
    ) -> Result<JobView, DispatchError> {
        let job = self.store.load(job_id).await?;
        let employer = Actor::Employer(employer_id);
        if !job.is_party(&employer) {
            return Err(DispatchError::NotParticipant {
                job_id,
                actor: employer,
            });
        }
        let Some(worker_id) = job.locked_by.clone() else {
            return Err(unresolvable(&job, decision));
        };

        let resolution = Resolution::from(decision);
        let job = self.resolve_lock(job_id, worker_id.clone(), resolution).await?;
        self.signal(
            job_id,
            Signal::Resolved {
                worker_id,
                resolution,
            },
        );
        Ok(job.view())
    }

    /// Apply `resolution` to the lock `worker_id` holds on `job_id`, then release it.
    pub(crate) async fn resolve_lock(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        resolution: Resolution,
    ) -> Result<InstantJob, DispatchError> {
        let job = self
            .store
            .apply(job_id, resolution.transition(worker_id.clone()))
            .await
            .map_err(|err| DispatchError::transition(job_id, err))?;
        self.release_lock(job_id, &worker_id).await;

        let channels = [
            ChannelId::Employer(job.employer_id.clone()),
            ChannelId::Worker(worker_id.clone()),
        ];
        let event = match resolution {
            Resolution::Confirmed => {
                tracing::info!(%job_id, %worker_id, "Worker {worker_id} confirmed for job {job_id}");
                Event::Confirmed { job: job.view() }
            }
            Resolution::Rejected => {
                tracing::info!(%job_id, %worker_id, "Worker {worker_id} rejected for job {job_id}");
                Event::Rejected {
                    job: job.view(),
                    worker_id,
                    reason: RejectReason::Employer,
                }
            }
            Resolution::Expired => {
                tracing::warn!(
                    %job_id,
                    %worker_id,
                    "Lock on job {job_id} held by {worker_id} lapsed without a decision"
                );
                Event::Rejected {
                    job: job.view(),
                    worker_id,
                    reason: RejectReason::Timeout,
                }
            }
        };
        self.events.broadcast(&channels, event);
        Ok(job)
    }

    /// Record that `actor` has arrived at, or confirmed the worker's arrival at, the job site.
    ///
    /// Marks may arrive in either order; repeating a mark is a no-op. The job starts once both
    /// sides have marked.
    pub async fn mark_arrived(
        &self,
        job_id: JobId,
        actor: Actor,
    ) -> Result<ArrivalStatus, DispatchError> {
        let job = self.store.load(job_id).await?;
        if !job.is_party(&actor) {
            return Err(DispatchError::NotParticipant { job_id, actor });
        }
        let transition = match &actor {
            Actor::Employer(_) => Transition::EmployerConfirmedArrival,
            Actor::Worker(worker) => Transition::WorkerArrived {
                worker: worker.clone(),
            },
        };

        let job = match self.store.apply(job_id, transition).await {
            Ok(job) => job,
            Err(StoreError::Transition(TransitionError::AlreadyApplied { .. })) => {
                tracing::debug!(%job_id, %actor, "Repeated arrival mark from {actor} on job {job_id}");
                return Ok(arrival_status(&self.store.load(job_id).await?));
            }
            Err(err) => return Err(DispatchError::transition(job_id, err)),
        };

        tracing::info!(%job_id, %actor, "Arrival on job {job_id} marked by {actor}");
        self.notify_parties(&job, Event::ArrivalUpdated { job: job.view() });
        if job.status == JobStatus::InProgress {
            tracing::info!(%job_id, "Both parties present, job {job_id} in progress");
            self.notify_parties(&job, Event::ArrivalConfirmed { job: job.view() });
            self.notify_parties(&job, Event::InProgress { job: job.view() });
        }
        Ok(arrival_status(&job))
    }

    /// The assigned worker asks the employer to sign off the job.
    pub async fn request_completion(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
    ) -> Result<JobView, DispatchError> {
        let job = self.store.load(job_id).await?;
        let worker = Actor::Worker(worker_id.clone());
        if !job.is_party(&worker) {
            return Err(DispatchError::NotParticipant {
                job_id,
                actor: worker,
            });
        }
        let job = self
            .store
            .apply(job_id, Transition::RequestCompletion { worker: worker_id })
            .await
            .map_err(|err| DispatchError::transition(job_id, err))?;
        tracing::info!(%job_id, "Completion of job {job_id} requested");
        self.notify_parties(&job, Event::CompletionRequested { job: job.view() });
        Ok(job.view())
    }

    /// The employer signs off a job whose completion was requested, stopping the clock.
    pub async fn approve_completion(
        &self,
        job_id: JobId,
        employer_id: EmployerId,
    ) -> Result<JobView, DispatchError> {
        let job = self.store.load(job_id).await?;
        let employer = Actor::Employer(employer_id);
        if !job.is_party(&employer) {
            return Err(DispatchError::NotParticipant {
                job_id,
                actor: employer,
            });
        }
        let job = self
            .store
            .apply(job_id, Transition::ApproveCompletion)
            .await
            .map_err(|err| DispatchError::transition(job_id, err))?;
        let worked = job
            .worked_for(Utc::now())
            .map(|worked| worked.num_minutes())
            .unwrap_or_default();
        tracing::info!(%job_id, worked_minutes = worked, "Job {job_id} completed");
        self.notify_parties(&job, Event::Completed { job: job.view() });
        Ok(job.view())
    }
}

/// The error for a decision on a job nobody currently holds.
fn unresolvable(job: &InstantJob, decision: Decision) -> DispatchError {
    if job.lock_cycles > 0 {
        DispatchError::AlreadyResolved { job_id: job.id }
    } else {
        DispatchError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            event: Resolution::from(decision).event_name(),
        }
    }
}

fn arrival_status(job: &InstantJob) -> ArrivalStatus {
    job.arrival_status.unwrap_or(ArrivalStatus::EnRoute)
}

impl<S, L> DispatchRunner<S, L>
where
    S: JobStore + Clone + Send + Sync + 'static,
    L: LockStore + Clone + Send + Sync + 'static,
{
    /// Supervise the decision window of the lock held on `job`.
    pub(crate) async fn await_decision(&mut self, job: &InstantJob) -> Result<Flow, DispatchError> {
        let job_id = self.job_id;
        let (Some(worker_id), Some(expires_at)) = (job.locked_by.clone(), job.lock_expires_at)
        else {
            tracing::error!(%job_id, "Job {job_id} is locked without a holder");
            return Ok(Flow::Stop);
        };
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
        tracing::debug!(%job_id, %worker_id, "Awaiting decision on {worker_id} for job {job_id}");

        let window = tokio::time::sleep(remaining);
        tokio::pin!(window);
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => return Ok(Flow::Stop),
                _ = sleep_until(self.deadline) => return self.engine.expire(job_id).await,
                signal = self.signals.recv() => match signal {
                    Some(Signal::Resolved { worker_id, resolution }) => {
                        if resolution != Resolution::Confirmed {
                            self.exclude(worker_id);
                        }
                        return Ok(Flow::Continue);
                    }
                    Some(Signal::Locked(_)) => {}
                    None => return Ok(Flow::Stop),
                },
                _ = &mut window => {
                    match self
                        .engine
                        .resolve_lock(job_id, worker_id.clone(), Resolution::Expired)
                        .await
                    {
                        Ok(_)
                        | Err(DispatchError::AlreadyResolved { .. })
                        | Err(DispatchError::InvalidTransition { .. }) => {}
                        Err(err) => return Err(err),
                    }
                    self.exclude(worker_id);
                    return Ok(Flow::Continue);
                }
            }
        }
    }
}
