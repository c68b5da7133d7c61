//! Resource pool manager: a bounded worker pool with caller-runs admission,
//! an explicit control loop for adaptive core sizing, and bounded-wait shutdown.
//!
//! Worker threads are spawned up to `max_threads` once; only workers whose id is
//! below the current core size take work, so growing or shrinking the pool is a
//! single atomic store owned by the monitor.

use anyhow::{anyhow, Context, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_CORE_THREADS: usize = 2;
pub const DEFAULT_MAX_THREADS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Parked workers re-check eligibility at least this often.
const WORKER_RECHECK: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool sizing and lifecycle knobs. Zero values fall back to the defaults.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub core_threads: usize,
    pub max_threads: usize,
    pub queue_capacity: usize,
    pub monitor_interval: Duration,
    pub drain_timeout: Duration,
    pub thread_name_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            core_threads: DEFAULT_CORE_THREADS,
            max_threads: DEFAULT_MAX_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            thread_name_prefix: "tabmerge-worker-".to_string(),
        }
    }
}

impl PoolSettings {
    /// Resolve (core, max) against the machine: both capped by available
    /// parallelism, and core never above max.
    pub fn resolved_sizes(&self, available: usize) -> (usize, usize) {
        let available = available.max(1);
        let core = if self.core_threads > 0 { self.core_threads } else { DEFAULT_CORE_THREADS };
        let max = if self.max_threads > 0 { self.max_threads } else { DEFAULT_MAX_THREADS };
        let max = max.min(available);
        let core = core.min(max);
        (core, max)
    }
}

struct State {
    queue: VecDeque<Job>,
    active: usize,
    shutdown: bool,
    terminated: bool,
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    drained: Condvar,
    core_size: AtomicUsize,
    max_threads: usize,
    queue_capacity: usize,
    completed: AtomicU64,
    caller_runs: AtomicU64,
}

/// Point-in-time pool counters, as seen by the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub pool_size: usize,
    pub max_size: usize,
    pub queued: usize,
    pub completed: u64,
    pub caller_runs: u64,
}

/// Result of waiting on a submitted task.
#[derive(Debug)]
pub enum TaskOutcome<R> {
    Done(R),
    /// The task panicked; carries the panic message.
    Failed(String),
    /// The task was dropped before it ran (forced shutdown).
    Cancelled,
    TimedOut,
}

pub struct TaskHandle<R> {
    rx: mpsc::Receiver<std::result::Result<R, String>>,
}

impl<R> TaskHandle<R> {
    /// Block until the task finishes or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> TaskOutcome<R> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(Ok(v)) => TaskOutcome::Done(v),
            Ok(Err(msg)) => TaskOutcome::Failed(msg),
            Err(RecvTimeoutError::Timeout) => TaskOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => TaskOutcome::Cancelled,
        }
    }

    pub fn wait(self) -> TaskOutcome<R> {
        match self.rx.recv() {
            Ok(Ok(v)) => TaskOutcome::Done(v),
            Ok(Err(msg)) => TaskOutcome::Failed(msg),
            Err(_) => TaskOutcome::Cancelled,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    name: String,
}

impl WorkerPool {
    /// Submit a task. When the queue is full the task runs on the calling
    /// thread before `submit` returns.
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
            let _ = tx.send(outcome);
        });

        let mut st = self.shared.state.lock();
        if st.shutdown {
            return Err(anyhow!("worker pool '{}' is shut down", self.name));
        }
        if st.queue.len() >= self.shared.queue_capacity {
            drop(st);
            self.shared.caller_runs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("pool '{}' queue full; running task on caller thread", self.name);
            job();
            return Ok(TaskHandle { rx });
        }
        st.queue.push_back(job);
        drop(st);
        self.shared.work_ready.notify_all();
        Ok(TaskHandle { rx })
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.state.lock();
        PoolStats {
            active: st.active,
            pool_size: self.shared.core_size.load(Ordering::Acquire),
            max_size: self.shared.max_threads,
            queued: st.queue.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            caller_runs: self.shared.caller_runs.load(Ordering::Relaxed),
        }
    }

    /// Set the number of workers allowed to take tasks, clamped to `1..=max`.
    pub fn set_core_size(&self, n: usize) -> usize {
        let n = n.clamp(1, self.shared.max_threads);
        self.shared.core_size.store(n, Ordering::Release);
        self.shared.work_ready.notify_all();
        n
    }

    pub fn core_size(&self) -> usize {
        self.shared.core_size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Queued tasks still run; workers exit once the queue is empty.
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    loop {
        let job = {
            let mut st = shared.state.lock();
            loop {
                if st.terminated {
                    return;
                }
                if id < shared.core_size.load(Ordering::Acquire) {
                    if let Some(job) = st.queue.pop_front() {
                        st.active += 1;
                        break job;
                    }
                }
                if st.shutdown && st.queue.is_empty() {
                    return;
                }
                shared.work_ready.wait_for(&mut st, WORKER_RECHECK);
            }
        };

        job();

        shared.completed.fetch_add(1, Ordering::Relaxed);
        let mut st = shared.state.lock();
        st.active -= 1;
        if st.active == 0 && st.queue.is_empty() {
            shared.drained.notify_all();
        }
    }
}

/// Build a pool sized from `settings` and the machine's available parallelism.
pub fn create_pool(settings: &PoolSettings) -> Result<Arc<WorkerPool>> {
    let hw = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let (core, max) = settings.resolved_sizes(hw);
    let queue_capacity = if settings.queue_capacity > 0 { settings.queue_capacity } else { DEFAULT_QUEUE_CAPACITY };

    let shared = Arc::new(Shared {
        state: Mutex::new(State { queue: VecDeque::with_capacity(queue_capacity), active: 0, shutdown: false, terminated: false }),
        work_ready: Condvar::new(),
        drained: Condvar::new(),
        core_size: AtomicUsize::new(core),
        max_threads: max,
        queue_capacity,
        completed: AtomicU64::new(0),
        caller_runs: AtomicU64::new(0),
    });

    let mut workers = Vec::with_capacity(max);
    for id in 0..max {
        let sh = shared.clone();
        let name = format!("{}{}", settings.thread_name_prefix, id + 1);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(sh, id))
            .with_context(|| format!("spawn worker thread {}", name))?;
        workers.push(handle);
    }

    tracing::info!(
        "created worker pool: core={}, max={}, queue capacity={}",
        core,
        max,
        queue_capacity
    );

    Ok(Arc::new(WorkerPool {
        shared,
        workers: Mutex::new(workers),
        name: settings.thread_name_prefix.trim_end_matches('-').to_string(),
    }))
}

/// One adaptive sizing step taken by `monitor_pool`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resize {
    Grow { from: usize, to: usize },
    Shrink { from: usize, to: usize },
}

/// Sample the pool once and nudge its core size by at most one worker.
/// Grows when work is queued and every eligible worker is busy; shrinks when
/// the queue is empty and fewer than half the workers are busy.
pub fn monitor_pool(pool: &WorkerPool) -> Option<Resize> {
    let s = pool.stats();
    tracing::debug!(
        "pool '{}': active={}/{}, max={}, queued={}, completed={}",
        pool.name(),
        s.active,
        s.pool_size,
        s.max_size,
        s.queued,
        s.completed
    );

    if s.queued > 0 && s.active >= s.pool_size && s.pool_size < s.max_size {
        let to = pool.set_core_size(s.pool_size + 1);
        tracing::info!("pool '{}': core size {} -> {}", pool.name(), s.pool_size, to);
        Some(Resize::Grow { from: s.pool_size, to })
    } else if s.queued == 0 && s.active < s.pool_size / 2 && s.pool_size > 1 {
        let to = pool.set_core_size(s.pool_size - 1);
        tracing::info!("pool '{}': core size {} -> {}", pool.name(), s.pool_size, to);
        Some(Resize::Shrink { from: s.pool_size, to })
    } else {
        None
    }
}

/// Periodic control loop around `monitor_pool`, on its own thread.
/// Stops when dropped or once the pool is shut down.
pub struct PoolMonitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl PoolMonitor {
    pub fn spawn(pool: Arc<WorkerPool>, interval: Duration) -> Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_rx = stop.clone();
        let interval = if interval.is_zero() { DEFAULT_MONITOR_INTERVAL } else { interval };
        let handle = thread::Builder::new()
            .name(format!("{}-monitor", pool.name()))
            .spawn(move || {
                let (lock, cv) = &*stop_rx;
                let mut stopped = lock.lock();
                while !*stopped && !pool.is_shutdown() {
                    cv.wait_for(&mut stopped, interval);
                    if *stopped || pool.is_shutdown() {
                        break;
                    }
                    monitor_pool(&pool);
                }
            })
            .context("spawn pool monitor thread")?;
        Ok(Self { stop, handle: Some(handle) })
    }

    pub fn stop(mut self) {
        self.signal_and_join();
    }

    fn signal_and_join(&mut self) {
        let (lock, cv) = &*self.stop;
        *lock.lock() = true;
        cv.notify_all();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for PoolMonitor {
    fn drop(&mut self) {
        self.signal_and_join();
    }
}

/// How a shutdown ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every queued and in-flight task finished; workers joined.
    Completed,
    /// Work was still pending at the deadline and `force` was not set.
    TimedOut { pending: usize },
    /// Queued tasks were dropped; in-flight tasks were left to finish detached.
    Forced { dropped: usize, in_flight: usize },
}

/// Stop accepting work and wait up to `timeout` for the pool to drain.
pub fn shutdown_pool(pool: &WorkerPool, force: bool, timeout: Duration) -> ShutdownOutcome {
    let deadline = Instant::now() + timeout;
    let shared = &pool.shared;

    let mut st = shared.state.lock();
    st.shutdown = true;
    shared.work_ready.notify_all();
    while !(st.queue.is_empty() && st.active == 0) {
        if shared.drained.wait_until(&mut st, deadline).timed_out() {
            break;
        }
    }

    if st.queue.is_empty() && st.active == 0 {
        drop(st);
        pool.join_workers();
        tracing::debug!("pool '{}' shut down cleanly", pool.name());
        return ShutdownOutcome::Completed;
    }

    let pending = st.queue.len() + st.active;
    if !force {
        drop(st);
        tracing::warn!("pool '{}' still has {} pending tasks after {:?}", pool.name(), pending, timeout);
        return ShutdownOutcome::TimedOut { pending };
    }

    st.terminated = true;
    let dropped: Vec<Job> = st.queue.drain(..).collect();
    let in_flight = st.active;
    drop(st);
    shared.work_ready.notify_all();
    let n = dropped.len();
    drop(dropped);
    tracing::warn!(
        "pool '{}' force-terminated: {} queued tasks dropped, {} in flight detached",
        pool.name(),
        n,
        in_flight
    );
    ShutdownOutcome::Forced { dropped: n, in_flight }
}

/// A pool used by one job, and whether that job is responsible for tearing it down.
pub struct PoolLease {
    pool: Arc<WorkerPool>,
    owned: bool,
    drain_timeout: Duration,
}

impl PoolLease {
    /// Borrow `external` if given, otherwise create a pool the lease owns.
    pub fn acquire(external: Option<Arc<WorkerPool>>, settings: &PoolSettings) -> Result<Self> {
        match external {
            Some(pool) => Ok(Self { pool, owned: false, drain_timeout: settings.drain_timeout }),
            None => Ok(Self { pool: create_pool(settings)?, owned: true, drain_timeout: settings.drain_timeout }),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if self.owned {
            let timeout = if self.drain_timeout.is_zero() { DEFAULT_DRAIN_TIMEOUT } else { self.drain_timeout };
            shutdown_pool(&self.pool, true, timeout);
        }
    }
}
