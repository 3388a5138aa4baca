//! Thread-safe FIFO used for the outbound byte queue.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Mutex-guarded FIFO queue.
///
/// Any thread may `push`. `front` and `pop` are two separate operations, so
/// a `front`-then-`pop` sequence is only coherent when a single consumer
/// performs it; the write loop is that sole consumer.
pub struct TsQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> TsQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an element at the back.
    pub fn push(&self, value: T) {
        self.lock().push_back(value);
    }

    /// Remove and return the front element.
    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> TsQueue<T> {
    /// Clone of the front element without removing it.
    pub fn front(&self) -> Option<T> {
        self.lock().front().cloned()
    }
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
