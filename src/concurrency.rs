//! Concurrency helper: run per-file tasks on the worker pool in waves, so at
//! most `limit` files are in flight at once.

use crate::pool::{TaskOutcome, WorkerPool};
use std::ops::Range;
use std::time::Instant;

/// Split `0..len` into consecutive waves of at most `limit` indices.
pub fn plan_waves(len: usize, limit: usize) -> Vec<Range<usize>> {
    let limit = limit.max(1);
    (0..len).step_by(limit).map(|start| start..(start + limit).min(len)).collect()
}

/// Submit one task per index in `wave`, then wait for all of them until
/// `deadline`. Outcomes come back in index order.
pub fn run_wave<R, F, G>(pool: &WorkerPool, wave: Range<usize>, deadline: Instant, mut task_for: F) -> Vec<(usize, TaskOutcome<R>)>
where
    R: Send + 'static,
    F: FnMut(usize) -> G,
    G: FnOnce() -> R + Send + 'static,
{
    let submitted: Vec<_> = wave.map(|i| (i, pool.submit(task_for(i)))).collect();
    submitted
        .into_iter()
        .map(|(i, handle)| match handle {
            Ok(h) => (i, h.wait_until(deadline)),
            Err(e) => (i, TaskOutcome::Failed(format!("{:#}", e))),
        })
        .collect()
}
