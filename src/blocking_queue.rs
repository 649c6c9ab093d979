use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A bounded FIFO with blocking producer and consumer sides.
///
/// This is a synchronous primitive: `add` and `take` park the calling OS
/// thread. Async code should only use the non-blocking operations, or talk
/// to the queue from a blocking-friendly context.
pub struct BlockingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BlockingQueue<T> {
    /// An effectively unbounded queue - `add` never blocks in practice.
    pub fn new() -> BlockingQueue<T> {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> BlockingQueue<T> {
        BlockingQueue {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Appends an item, blocking while the queue is at capacity.
    pub fn add(&self, item: T) {
        let mut queue = self.inner.lock().expect("blocking queue mutex poisoned");
        while queue.len() >= self.capacity {
            queue = self.not_full.wait(queue).expect("blocking queue mutex poisoned");
        }
        queue.push_back(item);
        self.not_empty.notify_one();
    }

    /// Removes the front item without blocking.
    pub fn try_take(&self) -> Option<T> {
        let mut queue = self.inner.lock().expect("blocking queue mutex poisoned");
        let item = queue.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Removes the front item, blocking while the queue is empty.
    pub fn take(&self) -> T {
        let mut queue = self.inner.lock().expect("blocking queue mutex poisoned");
        loop {
            match queue.pop_front() {
                Some(item) => {
                    self.not_full.notify_one();
                    return item;
                }
                None => {
                    queue = self.not_empty.wait(queue).expect("blocking queue mutex poisoned");
                }
            }
        }
    }

    /// Removes the first element equal to `item`. Returns whether an element
    /// was removed.
    pub fn take_item(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let mut queue = self.inner.lock().expect("blocking queue mutex poisoned");
        match queue.iter().position(|candidate| candidate == item) {
            Some(index) => {
                queue.remove(index);
                self.not_full.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("blocking queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("blocking queue mutex poisoned").is_empty()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> BlockingQueue<T> {
        Self::new()
    }
}
