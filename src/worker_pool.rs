//! Bounded background worker pool (C8), used for fire-and-forget
//! recomputation of stale entries under the return-old-value-on-stale
//! policy.
//!
//! Plain OS threads, not `tokio::spawn`: a submitted task re-enters the
//! (synchronous) decision state machine and may block for seconds inside
//! the wrapped user function, a parallel-threads-with-OS-level-scheduling
//! model, not a cooperative async task on a shared runtime. Deduplication
//! of repeated stale hits for the same key is the backend's job
//! (`mark_stale`), never this pool's.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Depth of the queue backing a [`WorkerPool`]. Callers that outrun this
/// back up in `submit` rather than growing memory without bound.
const QUEUE_DEPTH: usize = 1024;

/// A bounded pool of worker threads consuming single-shot recomputation
/// tasks. Lazily instantiated by the first caller that needs one; shuts
/// down cleanly (draining queued tasks) when dropped.
pub struct WorkerPool {
    sender: Mutex<Option<SyncSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `size` worker threads. `size` is clamped to at least 1.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Task>(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("recall-worker-{id}"))
                    .spawn(move || Self::run(&receiver))
                    .expect("failed to spawn recall background worker thread")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// The process-wide pool, sized from [`crate::config::ConfigRegistry`]'s
    /// `background_workers` field the first time it's touched. Shared by
    /// every [`crate::orchestrator::Memoizer`] that didn't bring its own
    /// pool. Resizing the registry afterward has no effect on this
    /// already-built pool, matching `ConfigRegistry`'s decorator-time-bound
    /// class.
    pub fn global() -> Arc<Self> {
        static POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();
        Arc::clone(POOL.get_or_init(|| {
            let size = crate::config::ConfigRegistry::global().snapshot().background_workers;
            Arc::new(Self::new(size))
        }))
    }

    fn run(receiver: &Arc<Mutex<Receiver<Task>>>) {
        loop {
            // Drop the lock before running the task so other workers can
            // pull the next one concurrently.
            let task = {
                let rx = receiver.lock().unwrap();
                rx.recv()
            };
            match task {
                Ok(task) => task(),
                Err(_) => return, // sender dropped, channel drained: shut down
            }
        }
    }

    /// Submit a task for fire-and-forget execution. Tasks are consumed in
    /// FIFO order by whichever worker is free first; there is no result
    /// channel back to the submitter by design, avoiding shared mutable
    /// state between submitter and worker beyond the immutable task
    /// descriptor.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            // A full disconnect can only happen during shutdown; dropping
            // the task silently in that case is correct since the process
            // is exiting anyway.
            let _ = sender.send(Box::new(task));
        }
    }
}

impl Drop for WorkerPool {
    /// Shuts down cleanly: drops the sender half so workers observe a
    /// closed channel once they drain whatever is already queued, then
    /// joins every worker thread.
    fn drop(&mut self) {
        self.sender.lock().unwrap().take();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Periodic background maintenance: reclaims abandoned in-flight leases on
/// a fixed cadence, recast over a plain `std::thread` instead of a tokio
/// interval task.
///
/// This is *not* a cache-replacement policy: it never touches a published
/// value, only a claim left behind by a producer that crashed or was
/// killed without releasing it — the same reclaim a caller's own
/// `mark_in_flight` performs reactively on read, but applied proactively
/// instead of only on the next caller.
pub struct LeaseSweeper {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseSweeper {
    /// Run `sweep` every `interval` on a dedicated thread until this
    /// sweeper is dropped.
    pub fn spawn(interval: std::time::Duration, mut sweep: impl FnMut() + Send + 'static) -> Self {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("recall-lease-sweeper".to_string())
            .spawn(move || {
                while !stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                        return;
                    }
                    sweep();
                }
            })
            .expect("failed to spawn recall lease-sweeper thread");

        Self { stop, handle: Some(handle) }
    }
}

impl Drop for LeaseSweeper {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
