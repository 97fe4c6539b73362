//! The per job dispatch scheduler.
//!
//! Each job being dispatched is driven by its own [`DispatchRunner`] task. The runner opens a
//! wave, pings the eligible workers, then waits for the first of: the job being locked, the wave
//! window elapsing, the overall dispatch deadline, or cancellation. While the job is locked the
//! runner hands over to the confirmation coordinator to supervise the employer's decision window.
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    channel::{ChannelId, Event},
    coordinator::Resolution,
    eligibility::{Candidate, CandidateQuery},
    job::{InstantJob, JobId, JobStatus, Transition, WorkerId},
    lock::LockStore,
    store::{JobStore, StoreError},
    DispatchEngine, DispatchError,
};

/// The broadcast of a job to a batch of candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchWave {
    pub job_id: JobId,
    pub wave_number: u32,
    pub candidate_ids: Vec<WorkerId>,
    pub sent_at: DateTime<Utc>,
    pub window_seconds: u64,
}

impl DispatchWave {
    pub fn includes(&self, worker_id: &WorkerId) -> bool {
        self.candidate_ids.contains(worker_id)
    }
}

/// The wave currently open for acceptance, if any.
pub(crate) type SharedOffer = Arc<RwLock<Option<DispatchWave>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signal {
    Locked(WorkerId),
    Resolved {
        worker_id: WorkerId,
        resolution: Resolution,
    },
}

pub(crate) struct DispatchHandle {
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) offer: SharedOffer,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    pub(crate) fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!("Dispatcher already stopped, dropping signal");
        }
    }
}

/// What the runner does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Re-read the job and carry on from its current state.
    Continue,
    /// Move on to the next, wider wave.
    Escalate,
    Stop,
}

pub(crate) struct DispatchRunner<S, L> {
    pub(crate) engine: DispatchEngine<S, L>,
    pub(crate) job_id: JobId,
    pub(crate) signals: mpsc::UnboundedReceiver<Signal>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) offer: SharedOffer,
    /// Workers who let a lock lapse or were turned down; never offered this job again.
    pub(crate) excluded: FxHashSet<WorkerId>,
    pub(crate) deadline: Option<Instant>,
}

impl<S, L> DispatchRunner<S, L>
where
    S: JobStore + Clone + Send + Sync + 'static,
    L: LockStore + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        engine: DispatchEngine<S, L>,
        job_id: JobId,
        signals: mpsc::UnboundedReceiver<Signal>,
        cancellation: CancellationToken,
        offer: SharedOffer,
    ) -> Self {
        Self {
            engine,
            job_id,
            signals,
            cancellation,
            offer,
            excluded: Default::default(),
            deadline: None,
        }
    }

    #[instrument(skip_all, fields(job_id = %self.job_id))]
    pub(crate) async fn run(mut self) {
        let job_id = self.job_id;
        tracing::debug!(%job_id, "Starting dispatch of job {job_id}");
        if let Err(err) = self.dispatch().await {
            tracing::error!(%job_id, ?err, "Dispatch of job {job_id} stopped: {err}");
        }
        self.set_offer(None);
        self.engine.forget_dispatcher(job_id);
        tracing::debug!(%job_id, "Dispatcher for job {job_id} finished");
    }

    async fn dispatch(&mut self) -> Result<(), DispatchError> {
        let job = self.engine.store.load(self.job_id).await?;
        self.deadline = job.dispatch_expires_at.and_then(|expires_at| {
            Instant::now().checked_add((expires_at - Utc::now()).to_std().unwrap_or_default())
        });
        let mut wave = job.current_wave;

        loop {
            if self.cancellation.is_cancelled() {
                return Ok(());
            }
            let job = self.engine.store.load(self.job_id).await?;
            let flow = match job.status {
                JobStatus::Dispatching if wave > self.engine.policy.max_waves() => {
                    self.engine.exhaust(self.job_id).await?
                }
                JobStatus::Dispatching => self.run_wave(wave).await?,
                JobStatus::Locked => self.await_decision(&job).await?,
                _ => Flow::Stop,
            };
            match flow {
                Flow::Continue => {}
                Flow::Escalate => wave += 1,
                Flow::Stop => return Ok(()),
            }
        }
    }

    async fn run_wave(&mut self, wave: u32) -> Result<Flow, DispatchError> {
        let job_id = self.job_id;
        if self.drain_signals() {
            return Ok(Flow::Continue);
        }
        let job = match self
            .engine
            .store
            .apply(job_id, Transition::StartWave { wave })
            .await
        {
            Ok(job) => job,
            Err(StoreError::Transition(_)) => return Ok(Flow::Continue),
            Err(err) => return Err(err.into()),
        };

        let candidates = self.candidates(&job, wave).await;
        if candidates.is_empty() {
            tracing::info!(%job_id, wave, "No eligible workers for job {job_id} in wave {wave}");
            return Ok(Flow::Escalate);
        }

        let window = self.engine.policy.wave_window();
        self.set_offer(Some(DispatchWave {
            job_id,
            wave_number: wave,
            candidate_ids: candidates.iter().map(|c| c.worker_id.clone()).collect(),
            sent_at: Utc::now(),
            window_seconds: window.as_secs(),
        }));
        for candidate in &candidates {
            self.engine.events.publish(
                &ChannelId::Worker(candidate.worker_id.clone()),
                &Event::Ping {
                    job_id,
                    title: job.title.clone(),
                    distance_km: candidate.distance_km,
                    pay: job.pay,
                    duration_hours: job.duration_hours,
                    wave,
                },
            );
        }
        tracing::info!(
            %job_id,
            wave,
            candidates = candidates.len(),
            "Pinged {} workers for job {job_id} in wave {wave}",
            candidates.len()
        );

        let window = tokio::time::sleep(window);
        tokio::pin!(window);
        let flow = loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break Flow::Stop,
                _ = sleep_until(self.deadline) => break self.engine.expire(job_id).await?,
                signal = self.signals.recv() => match signal {
                    Some(Signal::Locked(worker_id)) => {
                        tracing::debug!(%job_id, %worker_id, "Wave {wave} of job {job_id} won by {worker_id}");
                        break Flow::Continue;
                    }
                    Some(Signal::Resolved { worker_id, resolution }) => {
                        if resolution != Resolution::Confirmed {
                            self.exclude(worker_id);
                        }
                    }
                    None => break Flow::Stop,
                },
                _ = &mut window => {
                    tracing::info!(%job_id, wave, "Wave {wave} of job {job_id} elapsed without a taker");
                    break Flow::Escalate;
                }
            }
        };
        self.set_offer(None);
        Ok(flow)
    }

    /// Take in signals that queued up while the runner was busy, returning whether the job is
    /// still reported as locked.
    fn drain_signals(&mut self) -> bool {
        let mut locked = false;
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                Signal::Locked(_) => locked = true,
                Signal::Resolved {
                    worker_id,
                    resolution,
                } => {
                    locked = false;
                    if resolution != Resolution::Confirmed {
                        self.exclude(worker_id);
                    }
                }
            }
        }
        locked
    }

    /// Eligible workers for `wave`, leaving out excluded workers. A failed lookup yields none.
    async fn candidates(&self, job: &InstantJob, wave: u32) -> Vec<Candidate> {
        let limit = self.engine.policy.candidate_limit(wave);
        let query = CandidateQuery {
            job_id: job.id,
            location: job.location.clone(),
            radius_km: self.engine.policy.radius_km(wave),
            wave,
            limit: limit + self.excluded.len(),
            skills: job.skills.clone(),
        };
        match self.engine.eligibility.nearby_workers(&query).await {
            Ok(candidates) => candidates
                .into_iter()
                .filter(|candidate| !self.excluded.contains(&candidate.worker_id))
                .take(limit)
                .collect(),
            Err(err) => {
                let job_id = job.id;
                tracing::warn!(%job_id, ?err, "Eligibility lookup for job {job_id} failed: {err}");
                vec![]
            }
        }
    }

    pub(crate) fn exclude(&mut self, worker_id: WorkerId) {
        match self.offer.write() {
            Ok(mut offer) => {
                if let Some(wave) = offer.as_mut() {
                    wave.candidate_ids.retain(|candidate| candidate != &worker_id);
                }
            }
            Err(err) => tracing::error!(?err, "Failed to withdraw offer from {worker_id}"),
        }
        self.excluded.insert(worker_id);
    }

    fn set_offer(&self, wave: Option<DispatchWave>) {
        match self.offer.write() {
            Ok(mut offer) => *offer = wave,
            Err(err) => {
                let job_id = self.job_id;
                tracing::error!(%job_id, ?err, "Failed to update the open wave of job {job_id}");
            }
        }
    }
}

/// Resolves at `deadline`, or never when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl<S, L> DispatchEngine<S, L>
where
    S: JobStore + Clone + Send + Sync + 'static,
    L: LockStore + Clone + Send + Sync + 'static,
{
    /// Fail a job that ran out of waves.
    ///
    /// When the job was locked in the meantime the runner carries on and supervises the lock.
    async fn exhaust(&self, job_id: JobId) -> Result<Flow, DispatchError> {
        match self.store.apply(job_id, Transition::ExhaustWaves).await {
            Ok(job) => {
                tracing::info!(
                    %job_id,
                    waves = job.current_wave,
                    "Job {job_id} failed, nobody accepted after {} waves",
                    job.current_wave
                );
                self.notify_parties(&job, Event::Failed { job: job.view() });
                Ok(Flow::Stop)
            }
            Err(StoreError::Transition(err)) => {
                tracing::debug!(%job_id, ?err, "Job {job_id} left dispatching before exhaustion");
                Ok(Flow::Continue)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Expire a job that could not be matched before its dispatch deadline.
    pub(crate) async fn expire(&self, job_id: JobId) -> Result<Flow, DispatchError> {
        let held = self.locks.holder(job_id).await?;
        match self.store.apply(job_id, Transition::Expire).await {
            Ok(job) => {
                if let Some(lock) = held {
                    self.release_lock(job_id, &lock.worker_id).await;
                    self.events
                        .publish(&ChannelId::Worker(lock.worker_id), &Event::Expired {
                            job: job.view(),
                        });
                }
                tracing::info!(%job_id, "Job {job_id} expired before being matched");
                self.notify_parties(&job, Event::Expired { job: job.view() });
                Ok(Flow::Stop)
            }
            Err(StoreError::Transition(err)) => {
                tracing::debug!(%job_id, ?err, "Job {job_id} matched or closed before expiry");
                Ok(Flow::Continue)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        coordinator::Decision,
        eligibility::MockEligibilityQuery,
        job::JobSpec,
        lock::memory::InMemoryLockStore,
        policy::DispatchPolicy,
        store::{memory::InMemoryJobStore, NewJob},
        test::{candidates, engine_with, post, until_pinged, wait_for},
    };

    /// Writes take a second to land, like a store behind a network hop.
    #[derive(Clone, Default)]
    struct SlowStore(InMemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for SlowStore {
        async fn insert(&self, job: NewJob) -> Result<InstantJob, StoreError> {
            self.0.insert(job).await
        }

        async fn load(&self, id: JobId) -> Result<InstantJob, StoreError> {
            self.0.load(id).await
        }

        async fn apply(&self, id: JobId, transition: Transition) -> Result<InstantJob, StoreError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.0.apply(id, transition).await
        }

        async fn with_status(&self, statuses: &[JobStatus]) -> Result<Vec<InstantJob>, StoreError> {
            self.0.with_status(statuses).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_wave_pings_candidates() {
        let engine = engine_with(&["w1", "w2"]);
        let mut w1 = engine.events().subscribe(ChannelId::Worker("w1".into()));
        let mut w2 = engine.events().subscribe(ChannelId::Worker("w2".into()));
        let job_id = post(&engine).await;

        let ping = wait_for(&mut w1, "ping").await;

        assert_matches!(
            ping,
            Event::Ping { job_id: pinged, wave: 1, pay: 8_000, distance_km, .. }
                if pinged == job_id && distance_km == 0.5
        );
        assert_matches!(wait_for(&mut w2, "ping").await, Event::Ping { distance_km, .. } if distance_km == 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn open_wave_is_recorded() {
        let engine = engine_with(&["w1", "w2"]);
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;

        let wave = engine
            .dispatchers
            .read()
            .unwrap()
            .get(&job_id)
            .and_then(|handle| handle.offer.read().unwrap().clone())
            .unwrap();

        assert_eq!(wave.job_id, job_id);
        assert_eq!(wave.wave_number, 1);
        assert_eq!(wave.candidate_ids, [WorkerId::from("w1"), WorkerId::from("w2")]);
        assert_eq!(wave.window_seconds, 30);
        assert_eq!(serde_json::to_value(&wave).unwrap()["windowSeconds"], 30);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_wave_escalates() {
        let engine = engine_with(&["w1"]);
        let mut worker = engine.events().subscribe(ChannelId::Worker("w1".into()));
        let job_id = post(&engine).await;
        wait_for(&mut worker, "ping").await;

        let second = wait_for(&mut worker, "ping").await;

        assert_matches!(second, Event::Ping { wave: 2, .. });
        assert_eq!(engine.get_status(job_id).await.unwrap().current_wave, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn later_waves_take_more_candidates() {
        let mut eligibility = MockEligibilityQuery::new();
        eligibility
            .expect_nearby_workers()
            .withf(|query| query.wave == 1 && query.limit == 5)
            .returning(|_| Ok(vec![]));
        eligibility
            .expect_nearby_workers()
            .withf(|query| query.wave == 2 && query.limit == 10)
            .returning(|_| Ok(candidates(&["w1"])));
        let engine = DispatchEngine::new(
            InMemoryJobStore::new(),
            InMemoryLockStore::new(),
            eligibility,
        )
        .with_policy(DispatchPolicy::new().with_max_waves(2));
        let mut worker = engine.events().subscribe(ChannelId::Worker("w1".into()));
        post(&engine).await;

        assert_matches!(wait_for(&mut worker, "ping").await, Event::Ping { wave: 2, .. });
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_runner() {
        let engine = engine_with(&["w1"]);
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;

        engine.cancel_job(job_id, "e1".into()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!engine.dispatchers.read().unwrap().contains_key(&job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_while_locked_releases_lock() {
        let engine = engine_with(&["w1"]).with_policy(
            DispatchPolicy::new().with_dispatch_timeout(Some(Duration::from_secs(40))),
        );
        let mut worker = engine.events().subscribe(ChannelId::Worker("w1".into()));
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;
        engine.accept_job(job_id, "w1".into()).await.unwrap();

        wait_for(&mut worker, "job:expired").await;

        let view = engine.get_status(job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Expired);
        assert_eq!(view.locked_by, None);
        assert_eq!(engine.locks.holder(job_id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_landing_during_exhaustion_is_still_supervised() {
        let mut eligibility = MockEligibilityQuery::new();
        eligibility
            .expect_nearby_workers()
            .returning(|_| Ok(candidates(&["w1"])));
        let engine = DispatchEngine::new(SlowStore::default(), InMemoryLockStore::new(), eligibility)
            .with_policy(DispatchPolicy::new().with_max_waves(1));
        let mut employer = engine.events().subscribe(ChannelId::Employer("e1".into()));
        let job_id = engine
            .create_instant_job("e1".into(), JobSpec::mock_spec())
            .await
            .unwrap();

        // The only wave opens at 1s and closes at 31s, while this lock lands at 31.5s.
        tokio::time::sleep(Duration::from_millis(30_500)).await;
        let locked = engine.accept_job(job_id, "w1".into()).await.unwrap();
        assert_eq!(locked.status, JobStatus::Locked);

        assert_matches!(
            wait_for(&mut employer, "job:rejected").await,
            Event::Rejected { reason: crate::channel::RejectReason::Timeout, .. }
        );
        wait_for(&mut employer, "job:failed").await;
        let view = engine.get_status(job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.locked_by, None);
        assert_eq!(engine.locks.holder(job_id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_before_runner_wakes_skips_rejected_worker() {
        let engine = engine_with(&["w1", "w2"]);
        let mut w1 = engine.events().subscribe(ChannelId::Worker("w1".into()));
        let mut w2 = engine.events().subscribe(ChannelId::Worker("w2".into()));
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;

        engine.accept_job(job_id, "w1".into()).await.unwrap();
        engine
            .confirm_worker(job_id, "e1".into(), Decision::Reject)
            .await
            .unwrap();
        wait_for(&mut w2, "ping").await;
        wait_for(&mut w2, "ping").await;

        let wave = engine
            .dispatchers
            .read()
            .unwrap()
            .get(&job_id)
            .and_then(|handle| handle.offer.read().unwrap().clone())
            .unwrap();
        assert_eq!(wave.candidate_ids, [WorkerId::from("w2")]);
        let mut pings = 0;
        while let Some(event) = w1.try_recv() {
            if event.name() == "ping" {
                pings += 1;
            }
        }
        assert_eq!(pings, 1);
    }
}
