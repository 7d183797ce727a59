//! Per-address FIFO serialization of session mutators.
//!
//! Every operation that may mutate a session record runs through
//! [`queue_job`] keyed by the address string. Jobs for the same address run
//! one at a time in submission order; distinct addresses do not contend.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

static BUCKETS: Lazy<StdMutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

/// Run `job` once every earlier job for `bucket` has finished.
///
/// A failing job releases the bucket like any other; errors propagate to the
/// caller without clogging the queue.
pub async fn queue_job<F>(bucket: &str, job: F) -> F::Output
where
    F: Future,
{
    let lock = {
        let mut buckets = BUCKETS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };

    // tokio's Mutex hands the lock out in FIFO order
    let _guard = lock.lock().await;
    job.await
}
