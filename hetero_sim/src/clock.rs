//! Virtual clock and delivery queue.
//!
//! The clock is the only source of waiting in the simulator. Time advances
//! in whole ticks and never runs backwards; every tick flushes the
//! registered state updater exactly once.

use hetero_env::{SimError, Tick};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Something whose state evolves as virtual time passes.
pub trait StateUpdater {
    /// Advances the updater by one tick. `now` is the tick being completed.
    fn flush(&mut self, now: Tick);
}

/// The unit updater: time passes and nothing else happens.
impl StateUpdater for () {
    fn flush(&mut self, _now: Tick) {}
}

/// An event waiting in the clock's queue.
#[derive(Debug, Clone)]
pub struct Scheduled<E> {
    /// Delivery tick
    pub time: Tick,

    /// Insertion sequence number, breaks ties between equal delivery ticks
    seq: u64,

    /// The queued payload
    pub event: E,
}

impl<E> Scheduled<E> {
    /// Returns the payload, consuming the wrapper.
    pub fn into_event(self) -> E {
        self.event
    }
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want earliest first,
        // then first inserted.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Monotonic virtual clock with a delivery-time priority queue.
///
/// `U` is the registered state updater. A fresh clock carries the unit
/// updater `()`; [`VirtualClock::register_state_updater`] rebinds it.
///
/// Events with equal delivery ticks come out in insertion order.
#[derive(Debug)]
pub struct VirtualClock<E, U = ()> {
    /// Pending deliveries, earliest first
    queue: BinaryHeap<Scheduled<E>>,

    /// Current tick
    time: Tick,

    /// Next insertion sequence number
    next_seq: u64,

    /// Flushed once per elapsed tick
    updater: U,
}

impl<E> VirtualClock<E, ()> {
    /// Creates a clock at tick 0 with an empty queue and no updater.
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            time: 0,
            next_seq: 0,
            updater: (),
        }
    }
}

impl<E> Default for VirtualClock<E, ()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, U> VirtualClock<E, U> {
    /// Binds the updater flushed by every [`step`](Self::step) unit.
    ///
    /// Queue contents and current time carry over; any previously
    /// registered updater is dropped.
    pub fn register_state_updater<V: StateUpdater>(self, updater: V) -> VirtualClock<E, V> {
        VirtualClock {
            queue: self.queue,
            time: self.time,
            next_seq: self.next_seq,
            updater,
        }
    }

    /// Returns the registered updater.
    pub fn state_updater(&self) -> &U {
        &self.updater
    }

    /// Returns the registered updater mutably.
    pub fn state_updater_mut(&mut self) -> &mut U {
        &mut self.updater
    }

    /// Returns the current tick.
    pub fn current_time(&self) -> Tick {
        self.time
    }

    /// Jumps to tick `t` without flushing the updater.
    ///
    /// # Errors
    ///
    /// - `SimError::TimeInversion` - If `t` is before the current tick
    pub fn set_time(&mut self, t: Tick) -> Result<(), SimError> {
        if t < self.time {
            return Err(SimError::inversion(self.time, t));
        }
        self.time = t;
        Ok(())
    }

    /// Queues `event` for delivery at `time`.
    ///
    /// `time` may lie in the past; such events are simply due immediately.
    pub fn put(&mut self, event: E, time: Tick) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Scheduled { time, seq, event });
    }

    /// Pops the earliest event, if any.
    pub fn get(&mut self) -> Option<E> {
        self.queue.pop().map(Scheduled::into_event)
    }

    /// Returns the delivery tick of the earliest event.
    pub fn peek_time(&self) -> Option<Tick> {
        self.queue.peek().map(|s| s.time)
    }

    /// Drains all events due at or before `t`, earliest first.
    ///
    /// Later events stay queued.
    pub fn get_until(&mut self, t: Tick) -> Vec<E> {
        let mut due = Vec::new();
        while self.queue.peek().map_or(false, |s| s.time <= t) {
            if let Some(scheduled) = self.queue.pop() {
                due.push(scheduled.event);
            }
        }
        due
    }

    /// Drains all events due by the current tick.
    pub fn get_sofar(&mut self) -> Vec<E> {
        self.get_until(self.time)
    }

    /// Drains every queued event regardless of delivery tick.
    pub fn gets(&mut self) -> Vec<E> {
        let mut all = Vec::with_capacity(self.queue.len());
        while let Some(scheduled) = self.queue.pop() {
            all.push(scheduled.event);
        }
        all
    }

    /// Discards every queued event.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Discards the events whose payload satisfies `predicate`.
    ///
    /// Returns how many were removed.
    pub fn conditionally_clear<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&E) -> bool,
    {
        let before = self.queue.len();
        self.queue.retain(|s| !predicate(&s.event));
        before - self.queue.len()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<E, U: StateUpdater> VirtualClock<E, U> {
    /// Advances time by `delta` ticks, flushing the updater once per tick.
    ///
    /// # Errors
    ///
    /// - `SimError::NegativeStep` - If `delta` is negative
    pub fn step(&mut self, delta: Tick) -> Result<(), SimError> {
        if delta < 0 {
            return Err(SimError::NegativeStep(delta));
        }
        for _ in 0..delta {
            self.updater.flush(self.time);
            self.time += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct CountingUpdater {
        flushed_at: Vec<Tick>,
    }

    impl StateUpdater for CountingUpdater {
        fn flush(&mut self, now: Tick) {
            self.flushed_at.push(now);
        }
    }

    #[test]
    fn test_step_flushes_once_per_tick() {
        let mut clock: VirtualClock<u32, _> =
            VirtualClock::new().register_state_updater(CountingUpdater::default());

        clock.step(3).unwrap();
        clock.step(0).unwrap();
        clock.step(2).unwrap();

        assert_eq!(clock.current_time(), 5);
        assert_eq!(clock.state_updater().flushed_at, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clock_cannot_go_backwards() {
        let mut clock: VirtualClock<u32> = VirtualClock::new();
        clock.step(10).unwrap();

        assert_eq!(clock.step(-1), Err(SimError::NegativeStep(-1)));
        assert_eq!(clock.set_time(4), Err(SimError::inversion(10, 4)));
        assert_eq!(clock.current_time(), 10);

        clock.set_time(10).unwrap();
        clock.set_time(12).unwrap();
        assert_eq!(clock.current_time(), 12);
    }

    #[test]
    fn test_fifo_at_same_time() {
        let mut clock = VirtualClock::new();
        clock.put("first", 7);
        clock.put("second", 7);
        clock.put("early", 3);
        clock.put("third", 7);

        assert_eq!(clock.gets(), vec!["early", "first", "second", "third"]);
        assert!(clock.is_empty());
    }

    #[test]
    fn test_get_until_keeps_later_events() {
        let mut clock = VirtualClock::new();
        clock.put('c', 30);
        clock.put('a', 10);
        clock.put('b', 20);

        assert_eq!(clock.get_until(20), vec!['a', 'b']);
        assert_eq!(clock.len(), 1);
        assert_eq!(clock.peek_time(), Some(30));
        assert!(clock.get_until(29).is_empty());
    }

    #[test]
    fn test_past_events_are_due_immediately() {
        let mut clock: VirtualClock<&str> = VirtualClock::new();
        clock.step(5).unwrap();
        clock.put("late", 2);
        clock.put("future", 9);

        assert_eq!(clock.get_sofar(), vec!["late"]);
        assert_eq!(clock.get(), Some("future"));
        assert_eq!(clock.get(), None);
    }

    #[test]
    fn test_empty_queue_queries() {
        let mut clock: VirtualClock<u8> = VirtualClock::new();
        assert!(clock.get_until(100).is_empty());
        assert!(clock.get_sofar().is_empty());
        assert!(clock.gets().is_empty());
        assert_eq!(clock.get(), None);
    }

    #[test]
    fn test_conditionally_clear_only_removes_matches() {
        let mut clock = VirtualClock::new();
        for (i, t) in [5, 1, 4, 1, 3].into_iter().enumerate() {
            clock.put(i, t);
        }

        let removed = clock.conditionally_clear(|i| i % 2 == 0);

        assert_eq!(removed, 3);
        assert_eq!(clock.gets(), vec![1, 3]);
    }

    #[test]
    fn test_clear_discards_everything() {
        let mut clock = VirtualClock::new();
        clock.put(1, 1);
        clock.put(2, 2);
        clock.clear();
        assert!(clock.is_empty());
    }

    #[test]
    fn test_register_keeps_queue_and_time() {
        let mut clock = VirtualClock::new();
        clock.put(1u8, 4);
        clock.set_time(2).unwrap();

        let mut clock = clock.register_state_updater(CountingUpdater::default());
        clock.step(2).unwrap();

        assert_eq!(clock.state_updater().flushed_at, vec![2, 3]);
        assert_eq!(clock.get_sofar(), vec![1]);
    }

    proptest! {
        #[test]
        fn prop_time_is_monotonic(deltas in prop::collection::vec(-3i64..20, 1..40)) {
            let mut clock: VirtualClock<()> = VirtualClock::new();
            let mut last = clock.current_time();
            for delta in deltas {
                let result = clock.step(delta);
                prop_assert_eq!(result.is_err(), delta < 0);
                prop_assert!(clock.current_time() >= last);
                last = clock.current_time();
            }
        }

        #[test]
        fn prop_get_until_partitions_queue(
            times in prop::collection::vec(0i64..50, 0..60),
            cutoff in 0i64..50,
        ) {
            let mut clock = VirtualClock::new();
            for (i, t) in times.iter().enumerate() {
                clock.put((i, *t), *t);
            }

            let due = clock.get_until(cutoff);
            prop_assert!(due.iter().all(|(_, t)| *t <= cutoff));
            prop_assert!(due.windows(2).all(|w| w[0].1 <= w[1].1));

            let rest = clock.gets();
            prop_assert!(rest.iter().all(|(_, t)| *t > cutoff));

            let mut seen: Vec<usize> = due.iter().chain(rest.iter()).map(|(i, _)| *i).collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..times.len()).collect::<Vec<_>>());
        }
    }
}
