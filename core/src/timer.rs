//! Coarse periodic timers polled from the main loop.
//!
//! Nodes drive their recurring work (dumps, compactions, journals, gossip,
//! metadata refresh) off a handful of timers. The set is polled once per
//! loop iteration; expired timers are returned with their user tag and
//! rearmed. Intervals can be adjusted on config hot-reload.

use std::time::{Duration, Instant};

use crate::halloc::{HandleAlloc, INVALID_HANDLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(pub u16);

struct Timer<K> {
    tag: K,
    interval: Duration,
    next_fire: Instant,
    paused: bool,
}

pub struct TimerSet<K: Clone> {
    halloc: HandleAlloc,
    timers: Vec<Option<Timer<K>>>,
}

impl<K: Clone> TimerSet<K> {
    pub fn new(capacity: u16) -> Self {
        Self {
            halloc: HandleAlloc::new(capacity),
            timers: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Registers a periodic timer firing every `interval`, first at
    /// `now + interval`.
    pub fn add(&mut self, interval: Duration, tag: K) -> Option<TimerHandle> {
        let handle = self.halloc.alloc();
        if handle == INVALID_HANDLE {
            return None;
        }
        self.timers[handle as usize] = Some(Timer {
            tag,
            interval,
            next_fire: Instant::now() + interval,
            paused: false,
        });
        Some(TimerHandle(handle))
    }

    pub fn remove(&mut self, handle: TimerHandle) {
        if self.halloc.is_valid(handle.0) {
            self.timers[handle.0 as usize] = None;
            self.halloc.free(handle.0);
        }
    }

    /// Changes the interval, rearming relative to now.
    pub fn reschedule(&mut self, handle: TimerHandle, interval: Duration) {
        if let Some(timer) = self.timer_mut(handle) {
            timer.interval = interval;
            timer.next_fire = Instant::now() + interval;
        }
    }

    pub fn pause(&mut self, handle: TimerHandle) {
        if let Some(timer) = self.timer_mut(handle) {
            timer.paused = true;
        }
    }

    pub fn resume(&mut self, handle: TimerHandle) {
        if let Some(timer) = self.timer_mut(handle) {
            timer.paused = false;
            timer.next_fire = Instant::now() + timer.interval;
        }
    }

    /// Collects expired timers, rearming each one.
    pub fn poll(&mut self) -> Vec<(TimerHandle, K)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for handle in self.halloc.iter() {
            if let Some(timer) = self.timers[handle as usize].as_mut() {
                if !timer.paused && now >= timer.next_fire {
                    timer.next_fire = now + timer.interval;
                    expired.push((TimerHandle(handle), timer.tag.clone()));
                }
            }
        }
        expired
    }

    fn timer_mut(&mut self, handle: TimerHandle) -> Option<&mut Timer<K>> {
        if !self.halloc.is_valid(handle.0) {
            return None;
        }
        self.timers[handle.0 as usize].as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fires_after_interval() {
        let mut timers = TimerSet::new(4);
        let t = timers.add(Duration::from_millis(10), 'a').unwrap();
        assert!(timers.poll().is_empty());
        sleep(Duration::from_millis(15));
        let fired = timers.poll();
        assert_eq!(fired, vec![(t, 'a')]);
        // rearmed, not immediately pending again
        assert!(timers.poll().is_empty());
    }

    #[test]
    fn paused_timers_do_not_fire() {
        let mut timers = TimerSet::new(4);
        let t = timers.add(Duration::from_millis(5), 'b').unwrap();
        timers.pause(t);
        sleep(Duration::from_millis(10));
        assert!(timers.poll().is_empty());
        timers.resume(t);
        sleep(Duration::from_millis(10));
        assert_eq!(timers.poll().len(), 1);
    }

    #[test]
    fn removed_timers_free_their_slot() {
        let mut timers = TimerSet::new(1);
        let t = timers.add(Duration::from_millis(5), 'c').unwrap();
        assert!(timers.add(Duration::from_millis(5), 'd').is_none());
        timers.remove(t);
        assert!(timers.add(Duration::from_millis(5), 'd').is_some());
    }
}
