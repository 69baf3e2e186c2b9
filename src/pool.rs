//! Fixed-size worker pool.
//!
//! The event loop hands it ownership of large containers whose drop
//! would stall the tick. Plain Mutex + Condvar queue; workers park on
//! the condvar and exit when shutdown is flagged.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: VecDeque<Job>,
    shutdown: bool,
}

pub struct ThreadPool {
    shared: Arc<(Mutex<Inner>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);
        let shared = Arc::new((
            Mutex::new(Inner {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let workers = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning worker thread")
            })
            .collect();
        debug!(num_threads, "worker pool started");
        Self { shared, workers }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let (lock, cvar) = &*self.shared;
        let mut inner = lock.lock().unwrap();
        inner.queue.push_back(Box::new(job));
        drop(inner);
        cvar.notify_one();
    }

    /// Finish queued jobs and join the workers. Runs once; later calls
    /// are no-ops.
    pub fn shutdown(&mut self) {
        let (lock, cvar) = &*self.shared;
        lock.lock().unwrap().shutdown = true;
        cvar.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &(Mutex<Inner>, Condvar)) {
    let (lock, cvar) = shared;
    let mut inner = lock.lock().unwrap();
    loop {
        if let Some(job) = inner.queue.pop_front() {
            drop(inner);
            job();
            inner = lock.lock().unwrap();
        } else if inner.shutdown {
            return;
        } else {
            inner = cvar.wait(inner).unwrap();
        }
    }
}
