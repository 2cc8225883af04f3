//! Bounded pool of worker threads over a multi-consumer queue.
//!
//! Workers block on the queue until a user task or a control sentinel
//! arrives. `Pause` drives a gate: each worker parks on a condvar until the
//! pool leaves the paused state, and the pauser can wait until every worker
//! has reached the gate. Shutdown pushes one `Shutdown` sentinel per worker
//! and joins them.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::mcq::Mcq;

enum Job<T> {
    Task(T),
    Pause,
    Shutdown,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum PoolState {
    Running,
    Paused,
}

struct Gate {
    state: Mutex<(PoolState, u16)>, // (state, parked worker count)
    resume_cond: Condvar,           // workers wait here while paused
    parked_cond: Condvar,           // pauser waits here for full park
}

struct Shared<T> {
    queue: Mcq<Job<T>>,
    gate: Gate,
}

pub struct Pool<T: Send + 'static> {
    name: String,
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new<F>(name: &str, worker_count: u16, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        assert!(worker_count > 0, "a pool needs at least one worker");

        let shared = Arc::new(Shared {
            queue: Mcq::new(),
            gate: Gate {
                state: Mutex::new((PoolState::Running, 0)),
                resume_cond: Condvar::new(),
                parked_cond: Condvar::new(),
            },
        });
        let handler = Arc::new(handler);

        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || Self::worker_main(shared, handler))
                    .expect("worker thread spawn failed")
            })
            .collect();

        Self {
            name: name.to_owned(),
            shared,
            workers,
        }
    }

    fn worker_main(shared: Arc<Shared<T>>, handler: Arc<dyn Fn(T) + Send + Sync>) {
        loop {
            match shared.queue.pop() {
                Job::Task(task) => handler(task),
                Job::Pause => {
                    let mut gate = shared.gate.state.lock().unwrap();
                    if gate.0 == PoolState::Paused {
                        gate.1 += 1;
                        shared.gate.parked_cond.notify_all();
                        while gate.0 == PoolState::Paused {
                            gate = shared.gate.resume_cond.wait(gate).unwrap();
                        }
                        gate.1 -= 1;
                    }
                }
                Job::Shutdown => return,
            }
        }
    }

    pub fn submit(&self, task: T) {
        self.shared.queue.push(Job::Task(task));
    }

    /// Enqueues ahead of pending work (internal-priority tasks).
    pub fn submit_first(&self, task: T) {
        self.shared.queue.push_first(Job::Task(task));
    }

    pub fn size(&self) -> u16 {
        self.workers.len() as u16
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pauses the pool without waiting for the workers to park.
    pub fn pause_nb(&self) {
        self.pause_inner();
    }

    /// Pauses the pool and waits until every worker reached the gate.
    pub fn pause(&self) {
        self.pause_inner();
        let mut gate = self.shared.gate.state.lock().unwrap();
        while gate.0 == PoolState::Paused && (gate.1 as usize) < self.workers.len() {
            gate = self.shared.gate.parked_cond.wait(gate).unwrap();
        }
    }

    fn pause_inner(&self) {
        let mut gate = self.shared.gate.state.lock().unwrap();
        if gate.0 == PoolState::Paused {
            return;
        }
        gate.0 = PoolState::Paused;
        drop(gate);
        // one sentinel per worker so each one reaches the gate
        for _ in 0..self.workers.len() {
            self.shared.queue.push_first(Job::Pause);
        }
    }

    pub fn resume(&self) {
        let mut gate = self.shared.gate.state.lock().unwrap();
        gate.0 = PoolState::Running;
        self.shared.gate.resume_cond.notify_all();
    }

    /// Stops the workers and joins them. Pending tasks ahead of the
    /// shutdown sentinels are still executed.
    pub fn shutdown(mut self) {
        self.resume();
        for _ in 0..self.workers.len() {
            self.shared.queue.push(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl<T: Send + 'static> Drop for Pool<T> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.resume();
        for _ in 0..self.workers.len() {
            self.shared.queue.push(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn executes_submitted_tasks() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = {
            let counter = Arc::clone(&counter);
            Pool::new("test", 4, move |n: u32| {
                counter.fetch_add(n, Ordering::SeqCst);
            })
        };
        for _ in 0..100 {
            pool.submit(1);
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn pause_parks_all_workers() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = {
            let counter = Arc::clone(&counter);
            Pool::new("gate", 2, move |n: u32| {
                counter.fetch_add(n, Ordering::SeqCst);
            })
        };

        pool.pause();
        pool.submit(1);
        thread::sleep(Duration::from_millis(30));
        // workers are parked, the task must not have run
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.resume();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
