//! Bounded-concurrency host fan-out with partial-failure bookkeeping.
//!
//! Parallel mode submits every host immediately to a bounded pool and lets
//! all submitted tasks run to completion; sequential mode drains a
//! descending-sorted host stack (lowest id runs first) and stops at the
//! first failure, notifying the hosts that were never started. Both modes
//! remove successful hosts from the outstanding failure set and surface the
//! first recorded error.

use crate::channel::Helper;
use crate::error::{DeployError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Worker pool bound for parallel fan-out.
pub fn pool_size() -> usize {
    std::cmp::max(10, 5 * num_cpus::get())
}

/// Fan `host_ids` out to `task`. On success a host is removed from
/// `fail_host_ids`; the first error encountered is returned after the mode's
/// completion rules are honored.
pub async fn fan_out<F, Fut>(
    helper: &Helper,
    host_ids: &[i64],
    parallel: bool,
    fail_host_ids: &mut Vec<i64>,
    task: F,
) -> Result<()>
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if parallel {
        fan_out_parallel(helper, host_ids, fail_host_ids, task).await
    } else {
        fan_out_sequential(helper, host_ids, fail_host_ids, task).await
    }
}

async fn fan_out_parallel<F, Fut>(
    helper: &Helper,
    host_ids: &[i64],
    fail_host_ids: &mut Vec<i64>,
    task: F,
) -> Result<()>
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(pool_size()));
    let mut set = JoinSet::new();
    for &h_id in host_ids {
        let fut = task(h_id);
        let permit = semaphore.clone();
        set.spawn(async move {
            let _permit = permit.acquire_owned().await;
            (h_id, fut.await)
        });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((h_id, Ok(()))) => fail_host_ids.retain(|x| *x != h_id),
            Ok((h_id, Err(e))) => {
                if !e.is_reported() {
                    let _ = helper.send_error(&h_id.to_string(), format!("Exception: {e}"));
                }
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                warn!("host task join failed: {e}");
                if first_error.is_none() {
                    first_error = Some(DeployError::Validation(format!(
                        "host task join failed: {e}"
                    )));
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn fan_out_sequential<F, Fut>(
    helper: &Helper,
    host_ids: &[i64],
    fail_host_ids: &mut Vec<i64>,
    task: F,
) -> Result<()>
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut stack: Vec<i64> = host_ids.to_vec();
    stack.sort_unstable_by(|a, b| b.cmp(a));

    while let Some(h_id) = stack.pop() {
        match task(h_id).await {
            Ok(()) => fail_host_ids.retain(|x| *x != h_id),
            Err(e) => {
                if !e.is_reported() {
                    let _ = helper.send_error(&h_id.to_string(), format!("Exception: {e}"));
                }
                for remaining in stack {
                    let _ = helper.send_error(&remaining.to_string(), "terminated");
                }
                return Err(e);
            }
        }
    }
    Ok(())
}
