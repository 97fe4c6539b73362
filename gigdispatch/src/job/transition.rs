use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::policy::DispatchPolicy;

use super::{ArrivalStatus, Cancellation, InstantJob, JobStatus, WorkerId};

/// An event that moves an [`InstantJob`] through its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    StartWave { wave: u32 },
    Lock { worker: WorkerId, expires_at: DateTime<Utc> },
    Confirm { worker: WorkerId },
    Reject { worker: WorkerId },
    ExpireLock { worker: WorkerId },
    ExhaustWaves,
    Expire,
    WorkerArrived { worker: WorkerId },
    EmployerConfirmedArrival,
    RequestCompletion { worker: WorkerId },
    ApproveCompletion,
    Cancel { policy: DispatchPolicy },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::StartWave { .. } => "start_wave",
            Transition::Lock { .. } => "lock",
            Transition::Confirm { .. } => "confirm",
            Transition::Reject { .. } => "reject",
            Transition::ExpireLock { .. } => "expire_lock",
            Transition::ExhaustWaves => "exhaust_waves",
            Transition::Expire => "expire",
            Transition::WorkerArrived { .. } => "worker_arrived",
            Transition::EmployerConfirmedArrival => "employer_confirmed_arrival",
            Transition::RequestCompletion { .. } => "request_completion",
            Transition::ApproveCompletion => "approve_completion",
            Transition::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot apply {event} to a job in status {from}")]
    Invalid { from: JobStatus, event: &'static str },
    #[error("The {event} has already been applied")]
    AlreadyApplied { event: &'static str },
}

impl InstantJob {
    /// Apply `transition` to the job.
    ///
    /// Every precondition is checked before any field is written, so on error the job is left
    /// exactly as it was.
    pub(crate) fn apply(
        &mut self,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let event = transition.name();
        let invalid = TransitionError::Invalid {
            from: self.status,
            event,
        };
        let already_applied = TransitionError::AlreadyApplied { event };

        match transition {
            Transition::StartWave { wave } => match self.status {
                JobStatus::Dispatching if *wave >= self.current_wave => {
                    self.current_wave = *wave;
                    Ok(())
                }
                _ => Err(invalid),
            },
            Transition::Lock { worker, expires_at } => match self.status {
                JobStatus::Dispatching => {
                    self.status = JobStatus::Locked;
                    self.locked_by = Some(worker.clone());
                    self.lock_expires_at = Some(*expires_at);
                    self.cancellation_fee_applicable = true;
                    Ok(())
                }
                JobStatus::Locked if self.locked_by.as_ref() == Some(worker) => {
                    Err(already_applied)
                }
                _ => Err(invalid),
            },
            Transition::Confirm { worker } => {
                self.check_lock_held_by(worker, invalid, already_applied)?;
                self.status = JobStatus::Confirmed;
                self.accepted_by = self.locked_by.take();
                self.lock_expires_at = None;
                self.lock_cycles += 1;
                self.arrival_status = Some(ArrivalStatus::EnRoute);
                Ok(())
            }
            Transition::Reject { worker } | Transition::ExpireLock { worker } => {
                self.check_lock_held_by(worker, invalid, already_applied)?;
                self.status = JobStatus::Dispatching;
                self.clear_lock();
                self.cancellation_fee_applicable = false;
                Ok(())
            }
            Transition::ExhaustWaves => match self.status {
                JobStatus::Dispatching => {
                    self.status = JobStatus::Failed;
                    Ok(())
                }
                _ => Err(invalid),
            },
            Transition::Expire => match self.status {
                JobStatus::Dispatching | JobStatus::Locked => {
                    self.clear_lock();
                    self.status = JobStatus::Expired;
                    self.cancellation_fee_applicable = false;
                    Ok(())
                }
                _ => Err(invalid),
            },
            Transition::WorkerArrived { worker } => {
                if self.accepted_by.as_ref() != Some(worker) {
                    return Err(invalid);
                }
                if self.worker_arrived_at.is_some() {
                    return Err(already_applied);
                }
                if self.status != JobStatus::Confirmed {
                    return Err(invalid);
                }
                self.worker_arrived_at = Some(now);
                self.refresh_arrival(now);
                Ok(())
            }
            Transition::EmployerConfirmedArrival => {
                if self.employer_confirmed_arrival_at.is_some() && !self.status.is_terminal() {
                    return Err(already_applied);
                }
                if self.status != JobStatus::Confirmed {
                    return Err(invalid);
                }
                self.employer_confirmed_arrival_at = Some(now);
                self.refresh_arrival(now);
                Ok(())
            }
            Transition::RequestCompletion { worker } => {
                if self.status != JobStatus::InProgress || self.accepted_by.as_ref() != Some(worker)
                {
                    return Err(invalid);
                }
                if self.completion_requested_at.is_some() {
                    return Err(already_applied);
                }
                self.completion_requested_at = Some(now);
                Ok(())
            }
            Transition::ApproveCompletion => {
                if self.status != JobStatus::InProgress || self.completion_requested_at.is_none() {
                    return Err(invalid);
                }
                self.status = JobStatus::Completed;
                self.completed_at = Some(now);
                Ok(())
            }
            Transition::Cancel { policy } => match self.status {
                JobStatus::Cancelled => Err(already_applied),
                status if status.is_terminal() => Err(invalid),
                status => {
                    let fee_applied = status != JobStatus::Dispatching;
                    let fee = if fee_applied {
                        policy.cancellation_fee(self.pay)
                    } else {
                        0
                    };
                    self.cancellation = Some(Cancellation {
                        at: now,
                        from_status: status,
                        worker: self.locked_by.clone().or_else(|| self.accepted_by.clone()),
                        fee_applied,
                        fee,
                    });
                    self.clear_lock();
                    self.accepted_by = None;
                    self.cancellation_fee_applicable = fee_applied;
                    self.status = JobStatus::Cancelled;
                    Ok(())
                }
            },
        }
    }

    fn check_lock_held_by(
        &self,
        worker: &WorkerId,
        invalid: TransitionError,
        already_applied: TransitionError,
    ) -> Result<(), TransitionError> {
        match self.status {
            JobStatus::Locked if self.locked_by.as_ref() == Some(worker) => Ok(()),
            // The lock referred to by the caller has been resolved and replaced by another.
            JobStatus::Locked => Err(already_applied),
            _ if self.lock_cycles > 0 => Err(already_applied),
            _ => Err(invalid),
        }
    }

    fn clear_lock(&mut self) {
        if self.locked_by.take().is_some() {
            self.lock_cycles += 1;
        }
        self.lock_expires_at = None;
    }

    fn refresh_arrival(&mut self, now: DateTime<Utc>) {
        self.arrival_status = match (self.worker_arrived_at, self.employer_confirmed_arrival_at) {
            (Some(_), Some(_)) => {
                self.status = JobStatus::InProgress;
                self.start_time = Some(now);
                Some(ArrivalStatus::Confirmed)
            }
            (Some(_), None) => Some(ArrivalStatus::Arrived),
            _ => Some(ArrivalStatus::EnRoute),
        };
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;

    fn worker(name: &str) -> WorkerId {
        name.into()
    }

    fn lock(job: &mut InstantJob, name: &str) {
        job.apply(
            &Transition::Lock {
                worker: worker(name),
                expires_at: Utc::now() + TimeDelta::seconds(90),
            },
            Utc::now(),
        )
        .unwrap();
    }

    fn cancel() -> Transition {
        Transition::Cancel {
            policy: DispatchPolicy::new(),
        }
    }

    fn confirmed_job() -> InstantJob {
        let mut job = InstantJob::raw_job();
        lock(&mut job, "w1");
        job.apply(&Transition::Confirm { worker: worker("w1") }, Utc::now())
            .unwrap();
        job
    }

    #[test]
    fn lock_sets_locked_by_and_fee_flag() {
        let mut job = InstantJob::raw_job();
        let expires_at = Utc::now() + TimeDelta::seconds(90);

        job.apply(
            &Transition::Lock {
                worker: worker("w1"),
                expires_at,
            },
            Utc::now(),
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Locked);
        assert_eq!(job.locked_by, Some(worker("w1")));
        assert_eq!(job.lock_expires_at, Some(expires_at));
        assert!(job.cancellation_fee_applicable);
        assert!(job.invariants_hold());
    }

    #[test]
    fn second_lock_is_rejected_without_mutation() {
        let mut job = InstantJob::raw_job();
        lock(&mut job, "w1");
        let before = job.clone();

        let same = job.apply(
            &Transition::Lock {
                worker: worker("w1"),
                expires_at: Utc::now(),
            },
            Utc::now(),
        );
        let other = job.apply(
            &Transition::Lock {
                worker: worker("w2"),
                expires_at: Utc::now(),
            },
            Utc::now(),
        );

        assert_matches!(same, Err(TransitionError::AlreadyApplied { event: "lock" }));
        assert_matches!(
            other,
            Err(TransitionError::Invalid {
                from: JobStatus::Locked,
                event: "lock"
            })
        );
        assert_eq!(job, before);
    }

    #[test]
    fn confirm_moves_lock_holder_to_accepted() {
        let job = confirmed_job();

        assert_eq!(job.status, JobStatus::Confirmed);
        assert_eq!(job.accepted_by, Some(worker("w1")));
        assert_eq!(job.locked_by, None);
        assert_eq!(job.lock_expires_at, None);
        assert_eq!(job.arrival_status, Some(ArrivalStatus::EnRoute));
        assert!(job.invariants_hold());
    }

    #[test]
    fn confirm_twice_is_already_applied() {
        let mut job = confirmed_job();

        let result = job.apply(&Transition::Confirm { worker: worker("w1") }, Utc::now());

        assert_matches!(result, Err(TransitionError::AlreadyApplied { .. }));
    }

    #[test]
    fn confirm_without_any_lock_is_invalid() {
        let mut job = InstantJob::raw_job();

        let result = job.apply(&Transition::Confirm { worker: worker("w1") }, Utc::now());

        assert_matches!(
            result,
            Err(TransitionError::Invalid {
                from: JobStatus::Dispatching,
                ..
            })
        );
    }

    #[test]
    fn reject_returns_to_dispatching_keeping_wave() {
        let mut job = InstantJob::raw_job();
        job.apply(&Transition::StartWave { wave: 2 }, Utc::now())
            .unwrap();
        lock(&mut job, "w1");

        job.apply(&Transition::Reject { worker: worker("w1") }, Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Dispatching);
        assert_eq!(job.current_wave, 2);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.lock_cycles, 1);
        assert!(!job.cancellation_fee_applicable);
        assert!(job.invariants_hold());
    }

    #[test]
    fn late_resolution_of_replaced_lock_is_already_applied() {
        let mut job = InstantJob::raw_job();
        lock(&mut job, "w1");
        job.apply(&Transition::ExpireLock { worker: worker("w1") }, Utc::now())
            .unwrap();
        lock(&mut job, "w2");

        let late = job.apply(&Transition::Reject { worker: worker("w1") }, Utc::now());

        assert_matches!(late, Err(TransitionError::AlreadyApplied { event: "reject" }));
        assert_eq!(job.locked_by, Some(worker("w2")));
    }

    #[test]
    fn waves_never_go_backwards() {
        let mut job = InstantJob::raw_job();
        job.apply(&Transition::StartWave { wave: 3 }, Utc::now())
            .unwrap();

        let result = job.apply(&Transition::StartWave { wave: 2 }, Utc::now());

        assert_matches!(result, Err(TransitionError::Invalid { .. }));
        assert_eq!(job.current_wave, 3);
    }

    #[test]
    fn arrival_needs_both_parties() {
        let mut job = confirmed_job();

        job.apply(&Transition::WorkerArrived { worker: worker("w1") }, Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Confirmed);
        assert_eq!(job.arrival_status, Some(ArrivalStatus::Arrived));
        assert_eq!(job.start_time, None);

        let now = Utc::now();
        job.apply(&Transition::EmployerConfirmedArrival, now).unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.arrival_status, Some(ArrivalStatus::Confirmed));
        assert_eq!(job.start_time, Some(now));
        assert!(job.invariants_hold());
    }

    #[test]
    fn employer_confirmation_first_waits_for_worker() {
        let mut job = confirmed_job();

        job.apply(&Transition::EmployerConfirmedArrival, Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Confirmed);
        assert_eq!(job.arrival_status, Some(ArrivalStatus::EnRoute));

        job.apply(&Transition::WorkerArrived { worker: worker("w1") }, Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[test]
    fn duplicate_arrival_mark_does_not_restart_clock() {
        let mut job = confirmed_job();
        job.apply(&Transition::WorkerArrived { worker: worker("w1") }, Utc::now())
            .unwrap();
        job.apply(&Transition::EmployerConfirmedArrival, Utc::now())
            .unwrap();
        let start_time = job.start_time;

        let employer = job.apply(&Transition::EmployerConfirmedArrival, Utc::now());
        let repeated = job.apply(&Transition::WorkerArrived { worker: worker("w1") }, Utc::now());

        assert_matches!(employer, Err(TransitionError::AlreadyApplied { .. }));
        assert_matches!(repeated, Err(TransitionError::AlreadyApplied { .. }));
        assert_eq!(job.start_time, start_time);
    }

    #[test]
    fn arrival_from_unassigned_worker_is_invalid() {
        let mut job = confirmed_job();

        let result = job.apply(&Transition::WorkerArrived { worker: worker("w2") }, Utc::now());

        assert_matches!(result, Err(TransitionError::Invalid { .. }));
        assert_eq!(job.worker_arrived_at, None);
    }

    #[test]
    fn completion_requires_request_then_approval() {
        let mut job = confirmed_job();
        job.apply(&Transition::WorkerArrived { worker: worker("w1") }, Utc::now())
            .unwrap();
        job.apply(&Transition::EmployerConfirmedArrival, Utc::now())
            .unwrap();

        assert_matches!(
            job.apply(&Transition::ApproveCompletion, Utc::now()),
            Err(TransitionError::Invalid { .. })
        );
        job.apply(&Transition::RequestCompletion { worker: worker("w1") }, Utc::now())
            .unwrap();
        job.apply(&Transition::ApproveCompletion, Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.invariants_hold());
    }

    #[test]
    fn cancel_while_dispatching_is_free() {
        let mut job = InstantJob::raw_job();

        job.apply(&cancel(), Utc::now())
            .unwrap();

        let cancellation = job.cancellation.clone().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!cancellation.fee_applied);
        assert_eq!(cancellation.fee, 0);
    }

    #[test]
    fn cancel_after_lock_charges_fee() {
        let mut job = InstantJob::raw_job();
        lock(&mut job, "w1");

        job.apply(&cancel(), Utc::now())
            .unwrap();

        let cancellation = job.cancellation.clone().unwrap();
        assert!(cancellation.fee_applied);
        assert_eq!(cancellation.fee, 2_000);
        assert_eq!(cancellation.from_status, JobStatus::Locked);
        assert_eq!(cancellation.worker, Some(worker("w1")));
        assert_eq!(job.locked_by, None);
        assert!(job.invariants_hold());
    }

    #[test]
    fn cancel_fee_on_maximum_pay_saturates() {
        let mut job = InstantJob {
            pay: u64::MAX,
            ..InstantJob::raw_job()
        };
        lock(&mut job, "w1");

        job.apply(&cancel(), Utc::now()).unwrap();

        let cancellation = job.cancellation.clone().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(cancellation.fee_applied);
        assert_eq!(cancellation.fee, u64::MAX / 4);
    }

    #[test]
    fn cancel_in_progress_clears_assignment() {
        let mut job = confirmed_job();
        job.apply(&Transition::WorkerArrived { worker: worker("w1") }, Utc::now())
            .unwrap();
        job.apply(&Transition::EmployerConfirmedArrival, Utc::now())
            .unwrap();

        job.apply(&cancel(), Utc::now())
            .unwrap();

        assert_eq!(job.accepted_by, None);
        assert_eq!(job.cancellation.unwrap().worker, Some(worker("w1")));
    }

    #[test]
    fn cancel_is_not_repeatable_and_terminal_states_are_final() {
        let mut cancelled = InstantJob::raw_job();
        cancelled
            .apply(&cancel(), Utc::now())
            .unwrap();
        let mut failed = InstantJob::raw_job();
        failed.apply(&Transition::ExhaustWaves, Utc::now()).unwrap();

        assert_matches!(
            cancelled.apply(&cancel(), Utc::now()),
            Err(TransitionError::AlreadyApplied { .. })
        );
        assert_matches!(
            failed.apply(&cancel(), Utc::now()),
            Err(TransitionError::Invalid {
                from: JobStatus::Failed,
                ..
            })
        );
        assert_matches!(
            failed.apply(&Transition::StartWave { wave: 2 }, Utc::now()),
            Err(TransitionError::Invalid { .. })
        );
    }

    #[test]
    fn expire_releases_lock() {
        let mut job = InstantJob::raw_job();
        lock(&mut job, "w1");

        job.apply(&Transition::Expire, Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Expired);
        assert_eq!(job.locked_by, None);
        assert!(job.invariants_hold());
    }
}
