//! Test suite for ensuring a correct implementation of a [`JobStore`].
use std::sync::Arc;

use chrono::{TimeDelta, Utc};

use super::*;
use crate::job::WorkerId;

impl NewJob {
    pub fn mock_job() -> Self {
        Self {
            employer_id: "employer".into(),
            spec: JobSpec {
                title: "Barista cover".to_owned(),
                location: crate::job::Location::new(51.5074, -0.1278, "1 Trafalgar Square"),
                pay: 6_000,
                duration_hours: 3.0,
                skills: vec!["coffee".to_owned()],
            },
            dispatch_expires_at: None,
        }
    }
}

fn lock(worker: &str) -> Transition {
    Transition::Lock {
        worker: WorkerId::from(worker),
        expires_at: Utc::now() + TimeDelta::seconds(90),
    }
}

/// Create the test suite for a [`JobStore`] implementation.
///
/// ```
/// use gigdispatch::store_test_suite;
/// use gigdispatch::store::memory::InMemoryJobStore;
/// store_test_suite!(for: InMemoryJobStore::new());
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn insert_assigns_distinct_ids $args {
          let store = $store;
          $crate::store::testing::insert_assigns_distinct_ids(store).await;
        }
        #[$attr]
        async fn load_not_found $args {
          let store = $store;
          $crate::store::testing::load_not_found(store).await;
        }
        #[$attr]
        async fn apply_persists_transition $args {
          let store = $store;
          $crate::store::testing::apply_persists_transition(store).await;
        }
        #[$attr]
        async fn apply_invalid_transition_leaves_job_untouched $args {
          let store = $store;
          $crate::store::testing::apply_invalid_transition_leaves_job_untouched(store).await;
        }
        #[$attr]
        async fn apply_not_found $args {
          let store = $store;
          $crate::store::testing::apply_not_found(store).await;
        }
        #[$attr]
        async fn concurrent_locks_only_one_wins $args {
          let store = $store;
          $crate::store::testing::concurrent_locks_only_one_wins(store).await;
        }
        #[$attr]
        async fn with_status_filters $args {
          let store = $store;
          $crate::store::testing::with_status_filters(store).await;
        }
    };
}

pub async fn insert_assigns_distinct_ids(store: impl JobStore) {
    let first = store.insert(NewJob::mock_job()).await.unwrap();
    let second = store.insert(NewJob::mock_job()).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.status, JobStatus::Dispatching);
    assert_eq!(store.load(first.id).await.unwrap(), first);
}

pub async fn load_not_found(store: impl JobStore) {
    let id = JobId::from(9_999);

    assert_eq!(store.load(id).await, Err(StoreError::JobNotFound(id)));
}

pub async fn apply_persists_transition(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();

    let locked = store.apply(job.id, lock("w1")).await.unwrap();

    assert_eq!(locked.status, JobStatus::Locked);
    assert_eq!(store.load(job.id).await.unwrap(), locked);
}

pub async fn apply_invalid_transition_leaves_job_untouched(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();

    let result = store
        .apply(
            job.id,
            Transition::Confirm {
                worker: "w1".into(),
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Transition(TransitionError::Invalid { .. }))
    ));
    assert_eq!(store.load(job.id).await.unwrap(), job);
}

pub async fn apply_not_found(store: impl JobStore) {
    let id = JobId::from(9_999);

    assert_eq!(
        store.apply(id, Transition::ExhaustWaves).await,
        Err(StoreError::JobNotFound(id))
    );
}

pub async fn concurrent_locks_only_one_wins<S>(store: S)
where
    S: JobStore + Send + Sync + 'static,
{
    let store = Arc::new(store);
    let job = store.insert(NewJob::mock_job()).await.unwrap();

    let attempts = (0..8).map(|n| {
        let store = store.clone();
        tokio::spawn(async move { store.apply(job.id, lock(&format!("w{n}"))).await })
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results
        .iter()
        .filter(|result| matches!(result, Ok(Ok(_))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(
        store.load(job.id).await.unwrap().status,
        JobStatus::Locked
    );
}

pub async fn with_status_filters(store: impl JobStore) {
    let dispatching = store.insert(NewJob::mock_job()).await.unwrap();
    let failed = store.insert(NewJob::mock_job()).await.unwrap();
    store
        .apply(failed.id, Transition::ExhaustWaves)
        .await
        .unwrap();

    let jobs = store.with_status(&[JobStatus::Dispatching]).await.unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, dispatching.id);
    assert!(store
        .with_status(&[JobStatus::Completed])
        .await
        .unwrap()
        .is_empty());
}
