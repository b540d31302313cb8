//! Bounded pre-synchronization update buffer
//!
//! Written by the transport path and drained by the sequencer while a
//! snapshot fetch is in flight. Appends and drains may interleave, so
//! access is serialized through a mutex; critical sections never await.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::decoder::DepthUpdate;

/// Bounded buffer of depth updates, oldest discarded on overflow
#[derive(Debug)]
pub struct UpdateBuffer {
    inner: Mutex<VecDeque<DepthUpdate>>,
    capacity: usize,
}

impl UpdateBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Append an update, returning the id range of a discarded oldest
    /// entry when the bound was exceeded
    pub fn push(&self, update: DepthUpdate) -> Option<(u64, u64)> {
        let mut queue = self.lock();
        let discarded = if self.capacity > 0 && queue.len() >= self.capacity {
            queue
                .pop_front()
                .map(|old| (old.first_update_id, old.last_update_id))
        } else {
            None
        };
        queue.push_back(update);
        discarded
    }

    /// Take every buffered update, preserving arrival order
    pub fn drain(&self) -> Vec<DepthUpdate> {
        self.lock().drain(..).collect()
    }

    /// Put updates back at the front, preserving their order
    pub fn restore(&self, updates: Vec<DepthUpdate>) {
        let mut queue = self.lock();
        for update in updates.into_iter().rev() {
            queue.push_front(update);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DepthUpdate>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
