//! Multi-consumer queue fronted by a mutex and a condvar.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct Mcq<T> {
    queue: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Mcq<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Enqueues at the back.
    pub fn push(&self, item: T) {
        self.queue.lock().unwrap().push_back(item);
        self.cond.notify_one();
    }

    /// Enqueues at the front, ahead of pending work.
    pub fn push_first(&self, item: T) {
        self.queue.lock().unwrap().push_front(item);
        self.cond.notify_one();
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> T {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Mcq<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_with_priority_front() {
        let q = Mcq::new();
        q.push(1);
        q.push(2);
        q.push_first(0);
        assert_eq!(q.pop(), 0);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_blocks_until_item_arrives() {
        let q = Arc::new(Mcq::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(20));
                q.push(7u32);
            })
        };
        assert_eq!(q.pop(), 7);
        producer.join().unwrap();
    }
}
