//! Worker task bookkeeping shared by the broker adapters.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;

/// Wait for stopped workers to finish the job in hand.
///
/// Workers still busy after `grace` are aborted. Returns how many were.
pub(crate) async fn drain_workers(
    workers: Vec<JoinHandle<()>>,
    grace: Duration,
    queue: &str,
) -> usize {
    if workers.is_empty() {
        return 0;
    }

    let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
    match tokio::time::timeout(grace, join_all(workers)).await {
        Ok(_) => 0,
        Err(_) => {
            let busy = aborts.iter().filter(|handle| !handle.is_finished()).count();
            tracing::warn!(
                queue = queue,
                busy = busy,
                grace_ms = grace.as_millis() as u64,
                "Workers still busy at close, aborting"
            );
            for handle in aborts {
                handle.abort();
            }
            busy
        }
    }
}
