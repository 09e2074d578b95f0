//! The single background worker serializing heavy disk I/O.
//!
//! Cache dumps and segment merges are both disk-bandwidth bound, so one
//! worker thread runs them one at a time through two bounded queues.
//! Dumps free RAM and therefore always drain before merges. When a queue
//! is full or the worker is gone, the job runs inline on the caller's
//! thread: losing throughput is acceptable, losing postings is not.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::error::Result;

/// A queued unit of disk work. Jobs capture their own context and may be
/// invoked twice (the retry path).
pub type Job = Box<dyn Fn() -> Result<()> + Send + 'static>;

/// Background executor for cache dumps and segment merges.
pub struct MergeDispatcher {
    dump_tx: Sender<Job>,
    merge_tx: Sender<Job>,
    shutdown_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MergeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeDispatcher")
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl MergeDispatcher {
    pub fn new(dump_queue_len: usize, merge_queue_len: usize) -> Self {
        let (dump_tx, dump_rx) = bounded::<Job>(dump_queue_len);
        let (merge_tx, merge_rx) = bounded::<Job>(merge_queue_len);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("rwi-dispatcher".to_string())
            .spawn(move || worker_loop(dump_rx, merge_rx, shutdown_rx))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn dispatcher thread, all jobs will run inline");
        }

        MergeDispatcher {
            dump_tx,
            merge_tx,
            shutdown_tx,
            handle: Mutex::new(handle),
        }
    }

    /// Queue a dump job; runs it inline if the queue is unavailable.
    pub fn submit_dump(&self, job: Job) {
        if self.handle.lock().is_none() {
            run_job("dump", &job);
            return;
        }
        if let Err(e) = self.dump_tx.try_send(job) {
            debug!("dump queue unavailable, running inline");
            run_job("dump", &e.into_inner());
        }
    }

    /// Queue a merge job; runs it inline if the queue is unavailable.
    pub fn submit_merge(&self, job: Job) {
        if self.handle.lock().is_none() {
            run_job("merge", &job);
            return;
        }
        if let Err(e) = self.merge_tx.try_send(job) {
            debug!("merge queue unavailable, running inline");
            run_job("merge", &e.into_inner());
        }
    }

    /// Jobs waiting in both queues. The compaction policy throttles on
    /// this.
    pub fn queue_len(&self) -> usize {
        self.dump_tx.len() + self.merge_tx.len()
    }

    /// Drain both queues and stop the worker. Idempotent.
    pub fn terminate(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for MergeDispatcher {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(dump_rx: Receiver<Job>, merge_rx: Receiver<Job>, shutdown_rx: Receiver<()>) {
    loop {
        // dumps free RAM, they always go first
        while let Ok(job) = dump_rx.try_recv() {
            run_job("dump", &job);
        }
        crossbeam_channel::select! {
            recv(dump_rx) -> job => {
                match job {
                    Ok(job) => run_job("dump", &job),
                    Err(_) => break,
                }
            }
            recv(merge_rx) -> job => {
                match job {
                    Ok(job) => run_job("merge", &job),
                    Err(_) => break,
                }
            }
            recv(shutdown_rx) -> _ => {
                while let Ok(job) = dump_rx.try_recv() {
                    run_job("dump", &job);
                }
                while let Ok(job) = merge_rx.try_recv() {
                    run_job("merge", &job);
                }
                break;
            }
        }
    }
}

/// Run one job, retrying once. A job failing twice is logged and dropped;
/// the worker loop itself never dies.
fn run_job(kind: &str, job: &Job) {
    if let Err(first) = job() {
        warn!("{kind} job failed, retrying once: {first}");
        if let Err(second) = job() {
            error!("{kind} job failed twice, giving up: {second}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_and_terminate_drains() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = MergeDispatcher::new(4, 4);

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            dispatcher.submit_dump(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        let counter_m = Arc::clone(&counter);
        dispatcher.submit_merge(Box::new(move || {
            counter_m.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }));

        dispatcher.terminate();
        assert_eq!(counter.load(Ordering::SeqCst), 13);
    }

    #[test]
    fn test_failed_job_is_retried_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = MergeDispatcher::new(1, 1);

        let attempts_job = Arc::clone(&attempts);
        dispatcher.submit_dump(Box::new(move || {
            attempts_job.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::RwiError::storage("disk on fire"))
        }));

        dispatcher.terminate();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_full_queue_falls_back_to_inline() {
        let dispatcher = MergeDispatcher::new(1, 1);

        // park the worker on a slow job, then overfill the queue
        dispatcher.submit_merge(Box::new(|| {
            thread::sleep(Duration::from_millis(100));
            Ok(())
        }));

        let ran_inline = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran_inline);
            dispatcher.submit_dump(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        dispatcher.terminate();
        // every job ran exactly once, queued or inline
        assert_eq!(ran_inline.load(Ordering::SeqCst), 4);
    }
}
