//! Process-wide worker pool for blocking tasks.
//!
//! Runtimes do not own worker threads; a single pool serves the whole
//! process. Workers never call into any VM: a task carries only `Send` data
//! plus the handle of the runtime its completion must be routed to.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

static POOL: OnceCell<WorkQueue> = OnceCell::new();

/// Fix the worker count before the pool is first used. Returns `false` when
/// the pool already exists, in which case the setting is ignored.
pub fn configure(threads: usize) -> bool {
    POOL.set(WorkQueue::new(threads)).is_ok()
}

/// Submit a blocking job to the shared pool.
pub fn submit(job: impl FnOnce() + Send + 'static) {
    POOL.get_or_init(|| WorkQueue::new(default_threads()))
        .push(Box::new(job));
}

fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

struct PoolState {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
}

struct WorkQueue {
    state: Arc<PoolState>,
}

impl WorkQueue {
    fn new(threads: usize) -> WorkQueue {
        let state = Arc::new(PoolState {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let count = threads.max(1);
        debug!("starting worker pool with {} threads", count);
        for i in 0..count {
            let state = state.clone();
            let spawned = thread::Builder::new()
                .name(format!("weft-worker-{}", i))
                .spawn(move || worker_loop(&state));
            if let Err(err) = spawned {
                warn!("failed to spawn worker thread: {}", err);
            }
        }
        WorkQueue { state }
    }

    fn push(
        &self,
        job: Job,
    ) {
        let mut queue = self.state.queue.lock().unwrap();
        queue.push_back(job);
        self.state.available.notify_one();
    }
}

fn worker_loop(state: &PoolState) {
    loop {
        let job = {
            let mut queue = state.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                queue = state.available.wait(queue).unwrap();
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn jobs_run_off_the_submitting_thread() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        for _ in 0..8 {
            rx.recv_timeout(std::time::Duration::from_secs(5))
                .expect("job did not complete");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
