//! Bounded event queue between the synchronous block path and an async worker.
//!
//! `push` never blocks and never fails. When the queue is full the oldest pending event is
//! dropped and a `RecomputeAll` marker is raised instead, which is delivered before any
//! remaining queued event. The consumer must then reconcile from scratch.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedEvent<T> {
    Event(T),
    RecomputeAll,
}

#[derive(Debug)]
struct Inner<T> {
    events: VecDeque<T>,
    recompute_all: bool,
    closed: bool,
}

#[derive(Debug)]
pub struct EventQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                recompute_all: false,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `false` when the queue overflowed and the oldest event was superseded.
    pub fn push(&self, event: T) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return true;
            }
            let mut accepted = true;
            if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.recompute_all = true;
                accepted = false;
            }
            inner.events.push_back(event);
            accepted
        };
        self.notify.notify_one();
        accepted
    }

    /// Raises the `RecomputeAll` marker without queueing an event.
    pub fn request_recompute(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return;
            }
            inner.recompute_all = true;
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueuedEvent<T>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.recompute_all {
            inner.recompute_all = false;
            return Some(QueuedEvent::RecomputeAll);
        }
        inner.events.pop_front().map(QueuedEvent::Event)
    }

    /// Waits for the next event. `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<QueuedEvent<T>> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Wakes the consumer; later pushes are dropped.
    pub fn close(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.events.is_empty() && !inner.recompute_all
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn overflow_supersedes_oldest_with_recompute_marker() {
        let queue = EventQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Some(QueuedEvent::RecomputeAll));
        assert_eq!(queue.try_pop(), Some(QueuedEvent::Event(2)));
        assert_eq!(queue.try_pop(), Some(QueuedEvent::Event(3)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn never_exceeds_capacity() {
        let queue = EventQueue::new(4);
        for i in 0..100 {
            queue.push(i);
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.try_pop(), Some(QueuedEvent::RecomputeAll));
    }

    #[test]
    fn recompute_marker_counts_as_pending() {
        let queue: EventQueue<u32> = EventQueue::new(2);
        assert!(queue.is_empty());
        queue.request_recompute();
        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.try_pop(), Some(QueuedEvent::RecomputeAll));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(EventQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("event");
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(QueuedEvent::Event("event")));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = EventQueue::new(8);
        queue.push(1);
        queue.close();
        assert!(queue.push(2));
        assert_eq!(queue.pop().await, Some(QueuedEvent::Event(1)));
        assert_eq!(queue.pop().await, None);
    }
}
