//! Software detection timers.
//!
//! One deadline per session, pushed out by a detection time on every
//! accepted packet. The intake loop polls [`DetectionTimers::expired`] on its
//! wait tick and turns each expiry into a timeout event.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sonic_sai::BfdSessionOid;

#[derive(Debug, Default)]
pub struct DetectionTimers {
    deadlines: HashMap<BfdSessionOid, Instant>,
}

impl DetectionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arms `oid` to expire `detection_time` after `now`.
    pub fn arm(&mut self, oid: BfdSessionOid, now: Instant, detection_time: Duration) {
        self.deadlines.insert(oid, now + detection_time);
    }

    /// Returns true if a timer was armed.
    pub fn disarm(&mut self, oid: BfdSessionOid) -> bool {
        self.deadlines.remove(&oid).is_some()
    }

    pub fn is_armed(&self, oid: BfdSessionOid) -> bool {
        self.deadlines.contains_key(&oid)
    }

    /// Removes and returns every session whose deadline is at or before `now`,
    /// earliest first. A session expires once per arming.
    pub fn expired(&mut self, now: Instant) -> Vec<BfdSessionOid> {
        let mut due: Vec<(Instant, BfdSessionOid)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(oid, deadline)| (*deadline, *oid))
            .collect();
        due.sort_by_key(|(deadline, oid)| (*deadline, oid.as_raw()));
        for (_, oid) in &due {
            self.deadlines.remove(oid);
        }
        due.into_iter().map(|(_, oid)| oid).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn oid(raw: u64) -> BfdSessionOid {
        BfdSessionOid::from_raw_unchecked(raw)
    }

    #[test]
    fn test_expiry_order_and_once_per_arming() {
        let mut timers = DetectionTimers::new();
        let t0 = Instant::now();
        timers.arm(oid(1), t0, Duration::from_millis(300));
        timers.arm(oid(2), t0, Duration::from_millis(100));
        timers.arm(oid(3), t0, Duration::from_secs(5));

        assert!(timers.expired(t0).is_empty());
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(100)));

        let due = timers.expired(t0 + Duration::from_millis(300));
        assert_eq!(due, vec![oid(2), oid(1)]);
        assert!(timers.expired(t0 + Duration::from_millis(400)).is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_rearm_pushes_deadline() {
        let mut timers = DetectionTimers::new();
        let t0 = Instant::now();
        timers.arm(oid(1), t0, Duration::from_millis(100));
        timers.arm(oid(1), t0 + Duration::from_millis(90), Duration::from_millis(100));

        assert!(timers.expired(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(timers.expired(t0 + Duration::from_millis(190)), vec![oid(1)]);
    }

    #[test]
    fn test_disarm() {
        let mut timers = DetectionTimers::new();
        let t0 = Instant::now();
        timers.arm(oid(1), t0, Duration::from_millis(10));

        assert!(timers.disarm(oid(1)));
        assert!(!timers.disarm(oid(1)));
        assert!(timers.is_empty());
        assert!(timers.expired(t0 + Duration::from_secs(1)).is_empty());
    }
}
