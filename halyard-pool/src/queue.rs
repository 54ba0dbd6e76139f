//! The wait queue.

use std::collections::{HashMap, VecDeque};

use crate::event_loop::EventLoopId;
use crate::request::{RequestId, Waiter};

/// FIFO waiter queues, partitioned by event loop affinity.
///
/// Requests without a required loop wait in the general-purpose queue;
/// requests bound to a loop wait in that loop's queue. FIFO order holds
/// within each queue; no order is promised across queues.
pub(crate) struct RequestQueue {
    general: VecDeque<Waiter>,
    bound: HashMap<EventLoopId, VecDeque<Waiter>>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            general: VecDeque::new(),
            bound: HashMap::new(),
        }
    }

    /// Enqueue at the tail of the queue selected by the waiter's required
    /// event loop.
    pub(crate) fn push(&mut self, waiter: Waiter) {
        match waiter.required_event_loop() {
            None => self.general.push_back(waiter),
            Some(id) => self.bound.entry(id).or_default().push_back(waiter),
        }
    }

    /// Dequeue the head of the general queue, or of the queue bound to
    /// `event_loop` when one is given.
    pub(crate) fn pop_first(&mut self, event_loop: Option<EventLoopId>) -> Option<Waiter> {
        match event_loop {
            None => self.general.pop_front(),
            Some(id) => {
                let queue = self.bound.get_mut(&id)?;
                let waiter = queue.pop_front();
                if queue.is_empty() {
                    self.bound.remove(&id);
                }
                waiter
            }
        }
    }

    /// Remove a waiter by id, wherever it is queued. O(queued waiters).
    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Waiter> {
        if let Some(pos) = self.general.iter().position(|w| w.id() == id) {
            return self.general.remove(pos);
        }
        let mut emptied = None;
        let mut removed = None;
        for (loop_id, queue) in self.bound.iter_mut() {
            if let Some(pos) = queue.iter().position(|w| w.id() == id) {
                removed = queue.remove(pos);
                if queue.is_empty() {
                    emptied = Some(*loop_id);
                }
                break;
            }
        }
        if let Some(loop_id) = emptied {
            self.bound.remove(&loop_id);
        }
        removed
    }

    /// Drain every waiter. Preserves FIFO order within each queue but makes
    /// no promise about the order across queues.
    pub(crate) fn remove_all(&mut self) -> Vec<Waiter> {
        let mut waiters: Vec<Waiter> = self.general.drain(..).collect();
        for (_, queue) in self.bound.drain() {
            waiters.extend(queue);
        }
        waiters
    }

    /// Waiters eligible to run on `event_loop`: the general-purpose waiters
    /// plus the waiters bound to that loop.
    pub(crate) fn count_for(&self, event_loop: EventLoopId) -> usize {
        self.general.len() + self.bound.get(&event_loop).map_or(0, VecDeque::len)
    }

    pub(crate) fn general_purpose_count(&self) -> usize {
        self.general.len()
    }

    pub(crate) fn total_count(&self) -> usize {
        self.general.len() + self.bound.values().map(VecDeque::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PoolRequest;
    use crate::test_util::{test_event_loop, TestRequest};

    #[tokio::test]
    async fn test_fifo_within_general_queue() {
        let event_loop = test_event_loop();
        let mut queue = RequestQueue::new();

        let first = TestRequest::general(&event_loop);
        let second = TestRequest::general(&event_loop);
        queue.push(Waiter::new(first.clone()));
        queue.push(Waiter::new(second.clone()));

        assert_eq!(queue.pop_first(None).unwrap().id(), first.id());
        assert_eq!(queue.pop_first(None).unwrap().id(), second.id());
        assert!(queue.pop_first(None).is_none());
    }

    #[tokio::test]
    async fn test_bound_waiters_partition_by_loop() {
        let loop_a = test_event_loop();
        let loop_b = test_event_loop();
        let mut queue = RequestQueue::new();

        let bound_a = TestRequest::bound(&loop_a);
        let bound_b = TestRequest::bound(&loop_b);
        let general = TestRequest::general(&loop_a);
        queue.push(Waiter::new(bound_a.clone()));
        queue.push(Waiter::new(bound_b.clone()));
        queue.push(Waiter::new(general.clone()));

        assert_eq!(queue.general_purpose_count(), 1);
        assert_eq!(queue.count_for(loop_a.id()), 2);
        assert_eq!(queue.count_for(loop_b.id()), 2);

        assert_eq!(queue.pop_first(Some(loop_a.id())).unwrap().id(), bound_a.id());
        assert!(queue.pop_first(Some(loop_a.id())).is_none());
        assert_eq!(queue.pop_first(None).unwrap().id(), general.id());
        assert_eq!(queue.pop_first(Some(loop_b.id())).unwrap().id(), bound_b.id());
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let loop_a = test_event_loop();
        let mut queue = RequestQueue::new();

        let general = TestRequest::general(&loop_a);
        let bound = TestRequest::bound(&loop_a);
        queue.push(Waiter::new(general.clone()));
        queue.push(Waiter::new(bound.clone()));

        assert_eq!(queue.remove(bound.id()).unwrap().id(), bound.id());
        assert!(queue.remove(bound.id()).is_none());
        assert_eq!(queue.count_for(loop_a.id()), 1);

        assert_eq!(queue.remove(general.id()).unwrap().id(), general.id());
        assert_eq!(queue.total_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_all_preserves_per_queue_order() {
        let loop_a = test_event_loop();
        let mut queue = RequestQueue::new();

        let first = TestRequest::bound(&loop_a);
        let second = TestRequest::bound(&loop_a);
        queue.push(Waiter::new(first.clone()));
        queue.push(Waiter::new(second.clone()));

        let drained = queue.remove_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id(), first.id());
        assert_eq!(drained[1].id(), second.id());
        assert_eq!(queue.total_count(), 0);
    }
}
