//! Worker pools and the write-ordering thread.
//!
//! Three pools exist per device: I/O submission, crypto transforms, and a
//! single dedicated writer that commits public payload writes in ascending
//! sector order. The writer drains its queue into an ordered tree of
//! in-flight operations before touching the device, so concurrent
//! requests cannot interleave out of sector order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::trace;

use crate::config::SECTOR_SIZE;
use crate::device::BlockDev;
use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of job-running threads.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let thread_name = format!("{name}-{i}");
            let builder = std::thread::Builder::new().name(thread_name);
            if let Ok(handle) = builder.spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            }) {
                handles.push(handle);
            }
        }
        Self {
            tx: Some(tx),
            handles,
        }
    }

    /// Queue a job. Falls back to running inline if the pool is shutting
    /// down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.tx {
            Some(tx) => {
                if let Err(rejected) = tx.send(Box::new(job)) {
                    (rejected.into_inner())();
                }
            }
            None => job(),
        }
    }

    /// Run a closure on the pool and block for its result.
    pub fn run<T: Send + 'static>(
        &self,
        job: impl FnOnce() -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = bounded(1);
        self.execute(move || {
            let _ = tx.send(job());
        });
        match rx.recv() {
            Ok(value) => value,
            Err(_) => unreachable!("worker dropped result channel"),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct WriteOp {
    sector: u64,
    data: Box<[u8; SECTOR_SIZE]>,
    done: Sender<Result<()>>,
}

/// Dedicated thread committing payload writes in ascending sector order.
pub struct WriteOrderer {
    tx: Option<Sender<WriteOp>>,
    handle: Option<JoinHandle<()>>,
}

impl WriteOrderer {
    pub fn new(dev: Arc<dyn BlockDev>) -> Self {
        let (tx, rx) = unbounded::<WriteOp>();
        let handle = std::thread::Builder::new()
            .name("veil-writer".into())
            .spawn(move || Self::run(dev, rx))
            .ok();
        Self {
            tx: Some(tx),
            handle,
        }
    }

    fn run(dev: Arc<dyn BlockDev>, rx: Receiver<WriteOp>) {
        while let Ok(first) = rx.recv() {
            // Gather everything already queued, then flush lowest first.
            let mut tree: BTreeMap<u64, Vec<WriteOp>> = BTreeMap::new();
            tree.entry(first.sector).or_default().push(first);
            while let Ok(more) = rx.try_recv() {
                tree.entry(more.sector).or_default().push(more);
            }
            for (sector, ops) in tree {
                trace!(sector, "ordered write");
                for op in ops {
                    let result = dev.write_sector(sector, &op.data);
                    let _ = op.done.send(result);
                }
            }
        }
    }

    /// Queue a payload write; returns a receiver for its completion.
    pub fn submit(&self, sector: u64, data: Box<[u8; SECTOR_SIZE]>) -> Receiver<Result<()>> {
        let (done, completion) = bounded(1);
        if let Some(tx) = &self.tx {
            let op = WriteOp { sector, data, done };
            if tx.send(op).is_ok() {
                return completion;
            }
        }
        completion
    }
}

impl Drop for WriteOrderer {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pool_runs_jobs_and_returns_results() {
        let pool = WorkerPool::new(2, "test");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(pool.run(|| 21 * 2), 42);
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn orderer_writes_and_completes() {
        let dev: Arc<dyn BlockDev> = Arc::new(MemDevice::new(16));
        let orderer = WriteOrderer::new(dev.clone());
        let mut completions = Vec::new();
        for sector in [9u64, 3, 7] {
            let data = Box::new([sector as u8; SECTOR_SIZE]);
            completions.push((sector, orderer.submit(sector, data)));
        }
        for (sector, rx) in completions {
            rx.recv().expect("completion").expect("write ok");
            let mut buf = [0u8; SECTOR_SIZE];
            dev.read_sector(sector, &mut buf).unwrap();
            assert_eq!(buf[0], sector as u8);
        }
    }
}
