//! Test suite for ensuring a correct implementation of a [`LockStore`].
use std::sync::Arc;

use chrono::{TimeDelta, Utc};

use super::*;

fn in_ninety_seconds() -> DateTime<Utc> {
    Utc::now() + TimeDelta::seconds(90)
}

/// Create the test suite for a [`LockStore`] implementation.
///
/// ```
/// use gigdispatch::lock_test_suite;
/// use gigdispatch::lock::memory::InMemoryLockStore;
/// lock_test_suite!(for: InMemoryLockStore::new());
/// ```
#[macro_export]
macro_rules! lock_test_suite {
    (for: $store:expr) => {
        $crate::lock_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn acquire_free_lock $args {
          let store = $store;
          $crate::lock::testing::acquire_free_lock(store).await;
        }
        #[$attr]
        async fn acquire_held_lock_is_unavailable $args {
          let store = $store;
          $crate::lock::testing::acquire_held_lock_is_unavailable(store).await;
        }
        #[$attr]
        async fn acquire_is_idempotent_for_holder $args {
          let store = $store;
          $crate::lock::testing::acquire_is_idempotent_for_holder(store).await;
        }
        #[$attr]
        async fn acquire_replaces_expired_lock $args {
          let store = $store;
          $crate::lock::testing::acquire_replaces_expired_lock(store).await;
        }
        #[$attr]
        async fn release_is_idempotent $args {
          let store = $store;
          $crate::lock::testing::release_is_idempotent(store).await;
        }
        #[$attr]
        async fn release_by_other_worker_is_noop $args {
          let store = $store;
          $crate::lock::testing::release_by_other_worker_is_noop(store).await;
        }
        #[$attr]
        async fn concurrent_acquire_single_winner $args {
          let store = $store;
          $crate::lock::testing::concurrent_acquire_single_winner(store).await;
        }
    };
}

pub async fn acquire_free_lock(store: impl LockStore) {
    let job_id = JobId::from(1);
    let worker = WorkerId::from("w1");
    let expires_at = in_ninety_seconds();

    let lock = store.acquire(job_id, &worker, expires_at).await.unwrap();

    assert_eq!(
        lock,
        Lock {
            job_id,
            worker_id: worker,
            expires_at
        }
    );
    assert_eq!(store.holder(job_id).await.unwrap(), Some(lock));
}

pub async fn acquire_held_lock_is_unavailable(store: impl LockStore) {
    let job_id = JobId::from(1);
    store
        .acquire(job_id, &"w1".into(), in_ninety_seconds())
        .await
        .unwrap();

    let result = store
        .acquire(job_id, &"w2".into(), in_ninety_seconds())
        .await;

    assert_eq!(result, Err(LockError::Unavailable { job_id }));
    assert_eq!(
        store.holder(job_id).await.unwrap().unwrap().worker_id,
        WorkerId::from("w1")
    );
}

pub async fn acquire_is_idempotent_for_holder(store: impl LockStore) {
    let job_id = JobId::from(1);
    let worker = WorkerId::from("w1");
    let first = store
        .acquire(job_id, &worker, in_ninety_seconds())
        .await
        .unwrap();

    let second = store
        .acquire(job_id, &worker, in_ninety_seconds() + TimeDelta::seconds(5))
        .await
        .unwrap();

    assert_eq!(first, second);
}

pub async fn acquire_replaces_expired_lock(store: impl LockStore) {
    let job_id = JobId::from(1);
    store
        .acquire(job_id, &"w1".into(), Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();

    let lock = store
        .acquire(job_id, &"w2".into(), in_ninety_seconds())
        .await
        .unwrap();

    assert_eq!(lock.worker_id, WorkerId::from("w2"));
}

pub async fn release_is_idempotent(store: impl LockStore) {
    let job_id = JobId::from(1);
    let worker = WorkerId::from("w1");
    store
        .acquire(job_id, &worker, in_ninety_seconds())
        .await
        .unwrap();

    assert!(store.release(job_id, &worker).await.unwrap());
    assert!(!store.release(job_id, &worker).await.unwrap());
    assert_eq!(store.holder(job_id).await.unwrap(), None);
}

pub async fn release_by_other_worker_is_noop(store: impl LockStore) {
    let job_id = JobId::from(1);
    store
        .acquire(job_id, &"w1".into(), in_ninety_seconds())
        .await
        .unwrap();

    assert!(!store.release(job_id, &"w2".into()).await.unwrap());
    assert!(store.holder(job_id).await.unwrap().is_some());
}

pub async fn concurrent_acquire_single_winner<L>(store: L)
where
    L: LockStore + Send + Sync + 'static,
{
    let store = Arc::new(store);
    let job_id = JobId::from(1);

    let attempts = (0..16).map(|n| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .acquire(job_id, &WorkerId::from(format!("w{n}")), in_ninety_seconds())
                .await
        })
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results
        .iter()
        .filter(|result| matches!(result, Ok(Ok(_))))
        .count();
    let losers = results
        .iter()
        .filter(|result| matches!(result, Ok(Err(LockError::Unavailable { .. }))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(losers, 15);
}
