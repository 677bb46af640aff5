//! Shared task pool for delayed and periodic work.
//!
//! One scheduler thread owns a monotonic deadline heap and executes due
//! jobs inline. Subsystems hand it timer work (sequencer gap timeouts,
//! regulator emit cadence, speaker frame pushes, reconnect backoff) and
//! cancel through the returned handle. Jobs run on the scheduler thread
//! and are expected to return quickly; blocking in a job delays every
//! other timer in the pool.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

/// Handle to a scheduled job. Cancelling a handle that already fired (or
/// was never valid) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(u64);

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Periodic {
        period: Duration,
        job: Box<dyn FnMut() + Send>,
    },
}

enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        job: Job,
    },
    Cancel(u64),
    Shutdown,
}

struct PoolShared {
    tx: Sender<Command>,
    next_id: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// The shared task pool. Cloning is cheap; all clones feed the same
/// scheduler thread.
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<PoolShared>,
}

impl TaskPool {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<Command>();
        let join = std::thread::Builder::new()
            .name("aia-task-pool".into())
            .spawn(move || {
                let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
                let mut jobs: HashMap<u64, Job> = HashMap::new();
                loop {
                    // Drop stale heap entries for cancelled jobs.
                    while let Some(Reverse((_, id))) = heap.peek() {
                        if jobs.contains_key(id) {
                            break;
                        }
                        heap.pop();
                    }
                    let timeout = heap
                        .peek()
                        .map(|Reverse((deadline, _))| {
                            deadline.saturating_duration_since(Instant::now())
                        })
                        .unwrap_or(Duration::from_secs(3600));
                    match rx.recv_timeout(timeout) {
                        Ok(Command::Schedule { id, deadline, job }) => {
                            jobs.insert(id, job);
                            heap.push(Reverse((deadline, id)));
                        }
                        Ok(Command::Cancel(id)) => {
                            jobs.remove(&id);
                        }
                        Ok(Command::Shutdown) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    // Run everything that is due.
                    let now = Instant::now();
                    while let Some(Reverse((deadline, id))) = heap.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        heap.pop();
                        match jobs.remove(&id) {
                            Some(Job::Once(job)) => job(),
                            Some(Job::Periodic { period, mut job }) => {
                                job();
                                // Re-arm unless the job cancelled itself.
                                heap.push(Reverse((deadline + period, id)));
                                jobs.insert(id, Job::Periodic { period, job });
                            }
                            None => {}
                        }
                    }
                }
            })
            .expect("failed to spawn task pool thread");
        TaskPool {
            shared: Arc::new(PoolShared {
                tx,
                next_id: AtomicU64::new(1),
                join: Mutex::new(Some(join)),
            }),
        }
    }

    /// Schedules `job` to run once after `delay`.
    pub fn schedule_once(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TaskHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.tx.send(Command::Schedule {
            id,
            deadline: Instant::now() + delay,
            job: Job::Once(Box::new(job)),
        });
        TaskHandle(id)
    }

    /// Schedules `job` to run every `period`, first firing one period from
    /// now. A zero period is clamped to one millisecond.
    pub fn schedule_periodic(
        &self,
        period: Duration,
        job: impl FnMut() + Send + 'static,
    ) -> TaskHandle {
        let period = period.max(Duration::from_millis(1));
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.tx.send(Command::Schedule {
            id,
            deadline: Instant::now() + period,
            job: Job::Periodic {
                period,
                job: Box::new(job),
            },
        });
        TaskHandle(id)
    }

    /// Cancels a scheduled job. Safe to call from inside a pool job.
    pub fn cancel(&self, handle: TaskHandle) {
        let _ = self.shared.tx.send(Command::Cancel(handle.0));
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Ok(mut join) = self.join.lock() {
            if let Some(handle) = join.take() {
                let _ = handle.join();
            }
        }
    }
}
