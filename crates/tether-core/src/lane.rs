//! The per-channel I/O coordinator: a single-lane ordered executor for
//! received pipe work, plus the generator for the monotone I/O ids stamped
//! onto outgoing pipe commands.
//!
//! Each peer stamps the pipe commands it *sends* from its own [`IoIdGen`];
//! the receiving side executes them on its [`PipeLane`] strictly in arrival
//! order and publishes a completed-watermark. `await_done(id)` blocks until
//! the peer-stamped id has been applied locally, which is how responses
//! enforce the I/O-before-compute ordering discipline. Id 0 means "no
//! barrier" and completes instantly.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Issues the monotonically increasing ids carried by outgoing pipe
/// commands. 64-bit so rollover is unreachable.
pub struct IoIdGen {
    last: AtomicU64,
}

impl IoIdGen {
    pub fn new() -> Self {
        IoIdGen { last: AtomicU64::new(0) }
    }

    /// Claim the next id (first call returns 1).
    pub fn fresh(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued id, 0 if none yet.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for IoIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// The lane was torn down while someone was waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneClosed;

impl fmt::Display for LaneClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe lane is closed")
    }
}

impl std::error::Error for LaneClosed {}

type LaneWork = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct LaneJob {
    id: u64,
    work: LaneWork,
}

/// Single-lane ordered executor with an observable completion watermark.
pub struct PipeLane {
    tx: Mutex<Option<mpsc::UnboundedSender<LaneJob>>>,
    done: watch::Receiver<u64>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PipeLane {
    /// Start the lane worker on the current runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
        let (done_tx, done_rx) = watch::channel(0u64);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.work.await;
                if job.id > 0 {
                    done_tx.send_modify(|v| *v = (*v).max(job.id));
                }
            }
            // done_tx drops here; pending await_done calls observe closure.
        });
        PipeLane {
            tx: Mutex::new(Some(tx)),
            done: done_rx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue work under a peer-stamped id. Work with id 0 is ordered but
    /// does not move the watermark (used for commands that must not
    /// overtake earlier pipe writes but carry no barrier id of their own).
    pub fn submit<F>(&self, id: u64, work: F) -> Result<(), LaneClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(LaneJob { id, work: Box::pin(work) })
                .map_err(|_| LaneClosed),
            None => Err(LaneClosed),
        }
    }

    /// Block until the job stamped `id` has completed. Instant for id 0.
    pub async fn await_done(&self, id: u64) -> Result<(), LaneClosed> {
        if id == 0 {
            return Ok(());
        }
        let mut rx = self.done.clone();
        rx.wait_for(|v| *v >= id).await.map(|_| ()).map_err(|_| LaneClosed)
    }

    /// Stop accepting work; queued jobs still drain, then waiters are
    /// released.
    pub fn shutdown(&self) {
        self.tx.lock().take();
    }

    /// Tear down immediately: queued jobs are dropped and waiters released.
    pub fn abort(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    /// The highest completed id.
    pub fn watermark(&self) -> u64 {
        *self.done.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn io_ids_are_monotone_from_one() {
        let gen = IoIdGen::new();
        assert_eq!(gen.last(), 0);
        assert_eq!(gen.fresh(), 1);
        assert_eq!(gen.fresh(), 2);
        assert_eq!(gen.last(), 2);
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let lane = PipeLane::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 1..=5u64 {
            let order = order.clone();
            lane.submit(id, async move {
                // Later jobs sleeping less would expose reordering.
                tokio::time::sleep(Duration::from_millis(6 - id)).await;
                order.lock().push(id);
            })
            .unwrap();
        }
        lane.await_done(5).await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn await_done_zero_is_instant() {
        let lane = PipeLane::start();
        lane.await_done(0).await.unwrap();
    }

    #[tokio::test]
    async fn await_done_blocks_until_the_id_completes() {
        let lane = Arc::new(PipeLane::start());
        let ran = Arc::new(AtomicUsize::new(0));

        let ran2 = ran.clone();
        lane.submit(1, async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ran2.store(1, Ordering::SeqCst);
        })
        .unwrap();

        lane.await_done(1).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(lane.watermark(), 1);
    }

    #[tokio::test]
    async fn id_zero_jobs_do_not_move_the_watermark() {
        let lane = PipeLane::start();
        lane.submit(1, async {}).unwrap();
        lane.submit(0, async {}).unwrap();
        lane.await_done(1).await.unwrap();
        assert_eq!(lane.watermark(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_work_then_releases_waiters() {
        let lane = PipeLane::start();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        lane.submit(1, async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        lane.shutdown();
        assert!(lane.submit(2, async {}).is_err());

        lane.await_done(1).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // A waiter for an id that will never come is released with an
        // error rather than hanging.
        assert_eq!(lane.await_done(99).await, Err(LaneClosed));
    }

    #[tokio::test]
    async fn abort_releases_waiters_without_running_queued_work() {
        let lane = Arc::new(PipeLane::start());

        // Block the worker so the second job stays queued.
        lane.submit(1, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        lane.submit(2, async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let waiter = {
            let lane = lane.clone();
            tokio::spawn(async move { lane.await_done(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        lane.abort();

        assert_eq!(waiter.await.unwrap(), Err(LaneClosed));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
