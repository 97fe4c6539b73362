//! Provides an in memory implementation of [`JobStore`].
//!
//! It is designed to be a correct implementation for use in tests and single process
//! deployments, not an optimized one.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::Utc;
use fxhash::FxHashMap;

use super::{JobStore, NewJob, StoreError};
use crate::job::{InstantJob, JobId, JobStatus, Transition};

/// An in memory implementation of [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<FxHashMap<JobId, InstantJob>>>,
    id_counter: Arc<AtomicU64>,
}

impl InMemoryJobStore {
    /// Creates a new instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<InstantJob, StoreError> {
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let job = job.into_job(id);
        self.jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .insert(id, job.clone());
        Ok(job)
    }

    async fn load(&self, id: JobId) -> Result<InstantJob, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn apply(&self, id: JobId, transition: Transition) -> Result<InstantJob, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.apply(&transition, Utc::now())?;
        Ok(job.clone())
    }

    async fn with_status(&self, statuses: &[JobStatus]) -> Result<Vec<InstantJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::store_test_suite;

    store_test_suite!(for: InMemoryJobStore::new());

    #[tokio::test]
    async fn badstate_errors() {
        let store = InMemoryJobStore::new();
        let job = store.insert(NewJob::mock_job()).await.unwrap();

        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            store.insert(NewJob::mock_job()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.load(job.id).await, Err(StoreError::BadState));
        assert_matches!(
            store.apply(job.id, Transition::ExhaustWaves).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store.with_status(&[JobStatus::Dispatching]).await,
            Err(StoreError::BadState)
        );
    }
}
