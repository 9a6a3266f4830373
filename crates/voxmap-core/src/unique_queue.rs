//! FIFO queue that holds each element at most once.

use std::collections::VecDeque;
use std::hash::Hash;

use hashbrown::HashSet;

/// First-in first-out queue with a membership set.
///
/// Pushing an element that is already queued is a no-op and keeps its
/// original place in line.
#[derive(Clone, Debug)]
pub struct UniqueQueue<T> {
    queue: VecDeque<T>,
    members: HashSet<T>,
}

impl<T> Default for UniqueQueue<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<T: Copy + Eq + Hash> UniqueQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element; returns false if it was already queued.
    pub fn push_back(&mut self, value: T) -> bool {
        if !self.members.insert(value) {
            return false;
        }
        self.queue.push_back(value);
        true
    }

    /// Remove and return the oldest element
    pub fn pop_front(&mut self) -> Option<T> {
        let value = self.queue.pop_front()?;
        self.members.remove(&value);
        Some(value)
    }

    /// Oldest element without removing it
    pub fn front(&self) -> Option<&T> {
        self.queue.front()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop the oldest elements until at most `len` remain.
    ///
    /// Returns the number of elements dropped.
    pub fn truncate_front(&mut self, len: usize) -> usize {
        let mut dropped = 0;
        while self.queue.len() > len {
            if self.pop_front().is_none() {
                break;
            }
            dropped += 1;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }

    /// Iterate in queue order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter()
    }
}
