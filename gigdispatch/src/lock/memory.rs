//! Provides an in memory implementation of [`LockStore`].
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;

use super::{Lock, LockError, LockStore};
use crate::job::{JobId, WorkerId};

/// An in memory implementation of [`LockStore`].
///
/// Every operation runs under a single mutex, which makes acquire a true check-and-set within
/// one process.
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    locks: Arc<Mutex<FxHashMap<JobId, Lock>>>,
}

impl InMemoryLockStore {
    /// Creates a new instance of [`InMemoryLockStore`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<Lock, LockError> {
        let mut locks = self.locks.lock().map_err(|_| LockError::BadState)?;
        match locks.get(&job_id) {
            Some(lock) if &lock.worker_id == worker_id => Ok(lock.clone()),
            Some(lock) if !lock.is_expired(Utc::now()) => Err(LockError::Unavailable { job_id }),
            _ => {
                let lock = Lock {
                    job_id,
                    worker_id: worker_id.clone(),
                    expires_at,
                };
                locks.insert(job_id, lock.clone());
                Ok(lock)
            }
        }
    }

    async fn release(&self, job_id: JobId, worker_id: &WorkerId) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().map_err(|_| LockError::BadState)?;
        match locks.get(&job_id) {
            Some(lock) if &lock.worker_id == worker_id => {
                locks.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, job_id: JobId) -> Result<Option<Lock>, LockError> {
        Ok(self
            .locks
            .lock()
            .map_err(|_| LockError::BadState)?
            .get(&job_id)
            .cloned())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::lock_test_suite;

    lock_test_suite!(for: InMemoryLockStore::new());

    #[tokio::test]
    async fn badstate_errors() {
        let store = InMemoryLockStore::new();
        let worker = WorkerId::from("w1");

        std::thread::spawn({
            let store = store.clone();
            move || {
                let _guard = store.locks.lock();
                panic!()
            }
        })
        .join()
        .unwrap_err();

        assert_matches!(
            store
                .acquire(1.into(), &worker, Utc::now() + TimeDelta::seconds(90))
                .await,
            Err(LockError::BadState)
        );
        assert_matches!(
            store.release(1.into(), &worker).await,
            Err(LockError::BadState)
        );
        assert_matches!(store.holder(1.into()).await, Err(LockError::BadState));
    }
}
