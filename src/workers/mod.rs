//! Fixed-size worker pool draining one shared job queue.
//!
//! Network-facing components submit one job per accepted connection so that
//! the accept loop itself never blocks on request processing. A failing job
//! is logged and swallowed; it never takes its worker down with it. Jobs
//! from different connections may run concurrently and complete in any
//! order, so same-key serialization is the cache-set locks' business, not
//! the pool's.

use std::sync::Arc;

use futures::future::BoxFuture;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::utils::TandemError;

/// One unit of work: a boxed future run to completion by some worker.
pub type Job = BoxFuture<'static, Result<(), TandemError>>;

/// Shared-queue worker pool.
pub struct WorkerPool {
    /// Pool identity string used as logging prefix.
    name: String,

    /// Sender side of the job channel; `None` once shut down.
    tx_job: Option<mpsc::UnboundedSender<Job>>,

    /// Join handles of the worker tasks.
    _worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool of `size` workers, all blocking on the shared queue.
    pub fn new(name: impl ToString, size: usize) -> Self {
        assert!(size > 0, "worker pool must have at least one worker");
        let name = name.to_string();

        let (tx_job, rx_job) = mpsc::unbounded_channel();
        let rx_shared = Arc::new(Mutex::new(rx_job));

        let worker_handles = (0..size)
            .map(|w| {
                tokio::spawn(Self::worker_task(
                    format!("{}-{}", name, w),
                    rx_shared.clone(),
                ))
            })
            .collect();

        WorkerPool {
            name,
            tx_job: Some(tx_job),
            _worker_handles: worker_handles,
        }
    }

    /// Enqueues a job for the next idle worker.
    pub fn submit(&self, job: Job) -> Result<(), TandemError> {
        match self.tx_job {
            Some(ref tx_job) => {
                tx_job.send(job).map_err(|_| {
                    TandemError::msg("job submitted after pool shutdown")
                })
            }
            None => logged_err!(self.name; "submit called after shutdown"),
        }
    }

    /// Stops accepting new jobs. Workers drain what is already queued and
    /// then exit on their own.
    pub fn shutdown(&mut self) {
        if self.tx_job.take().is_some() {
            pf_debug!(self.name; "worker pool shut down");
        }
    }

    /// Worker task function.
    async fn worker_task(
        me: String,
        rx_job: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    ) {
        pf_debug!(me; "worker spawned");

        loop {
            // hold the receiver lock only while dequeuing, so other workers
            // can pick up jobs while this one runs
            let job = rx_job.lock().await.recv().await;
            match job {
                Some(job) => {
                    if let Err(e) = job.await {
                        pf_error!(me; "error running job: {}", e);
                    }
                }
                None => break, // channel closed and no jobs remain
            }
        }

        pf_debug!(me; "worker exitted");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
