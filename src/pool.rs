//! A fixed-size worker pool for short-lived jobs.
//!
//! The Raft node fans peer RPCs out through a pool rather than spawning a
//! thread per call: vote requests and leadership-confirmation heartbeats
//! go to every peer in parallel, and each call can block up to its
//! transport deadline. Workers pull boxed jobs from a shared queue and a
//! condition variable wakes them; results travel back through whatever
//! channel the job captured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stop: AtomicBool,
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Starts `worker_count` workers (at least one), named `{name}-{i}`.
    pub fn new(worker_count: usize, name: &str) -> ThreadPool {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let workers = (0..worker_count.max(1))
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || run_worker(inner))
                    .unwrap_or_else(|e| panic!("failed to spawn pool worker: {e}"))
            })
            .collect();

        ThreadPool {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Queues a job. Fails once the pool is shutting down; the job is
    /// dropped in that case, releasing anything it captured.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.inner.stop.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if self.inner.stop.load(Ordering::SeqCst) {
                return Err(Error::Stopped);
            }
            queue.push_back(Box::new(job));
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Stops accepting jobs, runs whatever is already queued, and joins
    /// every worker. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.available.notify_all();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if inner.stop.load(Ordering::SeqCst) {
                    return;
                }
                queue = inner.available.wait(queue).unwrap();
            }
        };
        job();
    }
}
