//! Bounded in-process queues used between the analyzer flush tick and the
//! serializer worker, and between the serializer and the transport layer.
//!
//! Both queue flavors share the same contract: `put` never blocks and reports
//! a full queue by returning `false`, `get` blocks up to a caller-provided
//! timeout. Accounting for dropped items is left to the caller.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Transmit lanes, drained highest-first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Low,
    Medium,
    High,
}

const LANE_COUNT: usize = 3;

impl Priority {
    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// Single-lane FIFO queue with a hard capacity.
pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity,
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues `item`, or returns `false` without blocking when the queue is
    /// at capacity.
    pub fn put(&self, item: T) -> bool {
        let mut items = self.items.lock();

        if items.len() >= self.capacity {
            return false;
        }

        items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues the oldest item, waiting up to `timeout` for one to appear.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }

            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Multi-lane FIFO queue. Each lane is bounded independently so a flood of
/// low-priority traffic cannot starve the high lane of capacity.
pub struct PriorityQueue<T> {
    lane_capacity: usize,
    lanes: Mutex<[VecDeque<T>; LANE_COUNT]>,
    not_empty: Condvar,
}

impl<T> PriorityQueue<T> {
    pub fn new(lane_capacity: usize) -> Self {
        PriorityQueue {
            lane_capacity,
            lanes: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            not_empty: Condvar::new(),
        }
    }

    pub fn put(&self, item: T, priority: Priority) -> bool {
        let mut lanes = self.lanes.lock();
        let lane = &mut lanes[priority.lane()];

        if lane.len() >= self.lane_capacity {
            return false;
        }

        lane.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues from the highest non-empty lane, waiting up to `timeout`.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut lanes = self.lanes.lock();

        loop {
            if let Some(item) = Self::pop(&mut lanes) {
                return Some(item);
            }

            if self.not_empty.wait_until(&mut lanes, deadline).timed_out() {
                return Self::pop(&mut lanes);
            }
        }
    }

    pub fn size(&self) -> usize {
        self.lanes.lock().iter().map(VecDeque::len).sum()
    }

    pub fn clear(&self) {
        for lane in self.lanes.lock().iter_mut() {
            lane.clear();
        }
    }

    fn pop(lanes: &mut [VecDeque<T>; LANE_COUNT]) -> Option<T> {
        lanes.iter_mut().find_map(VecDeque::pop_front)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn put_and_get_preserves_fifo_order() {
        let queue = BoundedQueue::new(8);

        assert!(queue.put(1));
        assert!(queue.put(2));
        assert!(queue.put(3));

        assert_eq!(queue.get(Duration::ZERO), Some(1));
        assert_eq!(queue.get(Duration::ZERO), Some(2));
        assert_eq!(queue.get(Duration::ZERO), Some(3));
        assert_eq!(queue.get(Duration::from_millis(1)), None);
    }

    #[test]
    fn put_past_capacity_is_rejected() {
        let queue = BoundedQueue::new(1000);

        for i in 0..1000 {
            assert!(queue.put(i));
        }

        assert!(!queue.put(1000));
        assert_eq!(queue.size(), 1000);
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);

        let started = std::time::Instant::now();
        assert_eq!(queue.get(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn get_wakes_up_on_cross_thread_put() {
        let queue = Arc::new(BoundedQueue::new(4));
        let producer = Arc::clone(&queue);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.put(42_u32)
        });

        assert_eq!(queue.get(Duration::from_secs(5)), Some(42));
        assert!(handle.join().expect("producer thread panicked"));
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = BoundedQueue::new(4);
        queue.put(1);
        queue.put(2);

        queue.clear();

        assert_eq!(queue.size(), 0);
        assert_eq!(queue.get(Duration::ZERO), None);
    }

    #[test]
    fn higher_lanes_are_drained_first() {
        let queue = PriorityQueue::new(4);

        assert!(queue.put("low", Priority::Low));
        assert!(queue.put("medium", Priority::Medium));
        assert!(queue.put("high", Priority::High));

        assert_eq!(queue.get(Duration::ZERO), Some("high"));
        assert_eq!(queue.get(Duration::ZERO), Some("medium"));
        assert_eq!(queue.get(Duration::ZERO), Some("low"));
    }

    #[test]
    fn lanes_are_bounded_independently() {
        let queue = PriorityQueue::new(1);

        assert!(queue.put(1, Priority::Medium));
        assert!(!queue.put(2, Priority::Medium));
        assert!(queue.put(3, Priority::High));
        assert_eq!(queue.size(), 2);
    }
}
