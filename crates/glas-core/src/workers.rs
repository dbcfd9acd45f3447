//! The shared worker pool.
//!
//! A fixed set of background threads serves lazy definition loading,
//! clone execution for non-deterministic choice, on-commit queue
//! draining, and bgcalls. Work arrives over a crossbeam channel; the
//! pool never grows, so background concurrency is bounded by thread
//! budget rather than demand.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Sender};
use once_cell::sync::Lazy;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Sender<Job>,
    size: usize,
}

impl WorkerPool {
    fn with_size(size: usize) -> WorkerPool {
        let (sender, receiver) = unbounded::<Job>();
        for i in 0..size {
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("glas-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .expect("spawn worker thread");
        }
        WorkerPool { sender, size }
    }

    pub fn global() -> &'static WorkerPool {
        static POOL: Lazy<WorkerPool> = Lazy::new(|| {
            let size = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(2);
            WorkerPool::with_size(size)
        });
        &POOL
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        // Send only fails when every worker is gone, which means the
        // process is tearing down anyway.
        let _ = self.sender.send(Box::new(job));
    }
}

struct QueueState {
    jobs: VecDeque<Job>,
    draining: bool,
}

/// Keyed job queues that drain in insertion order, one job at a time
/// per key, on the shared pool. Used for named on-commit queues.
#[derive(Default)]
pub struct SerialQueues {
    queues: Mutex<HashMap<u64, QueueState>>,
}

impl SerialQueues {
    pub fn global() -> &'static SerialQueues {
        static QUEUES: Lazy<SerialQueues> = Lazy::new(SerialQueues::default);
        &QUEUES
    }

    pub fn submit(&self, key: u64, job: impl FnOnce() + Send + 'static) {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(key).or_insert_with(|| QueueState {
            jobs: VecDeque::new(),
            draining: false,
        });
        state.jobs.push_back(Box::new(job));
        if !state.draining {
            state.draining = true;
            drop(queues);
            WorkerPool::global().submit(move || Self::drain(SerialQueues::global(), key));
        }
    }

    fn drain(&self, key: u64) {
        loop {
            let job = {
                let mut queues = self.queues.lock().unwrap();
                match queues.get_mut(&key) {
                    Some(state) => match state.jobs.pop_front() {
                        Some(job) => Some(job),
                        None => {
                            state.draining = false;
                            None
                        }
                    },
                    None => None,
                }
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }

    /// Block until the queue for `key` is idle. Test support.
    pub fn wait_idle(&self, key: u64) {
        loop {
            {
                let queues = self.queues.lock().unwrap();
                match queues.get(&key) {
                    Some(state) if state.draining || !state.jobs.is_empty() => {}
                    _ => return,
                }
            }
            std::thread::yield_now();
        }
    }
}
