//! Component C — Two-Scheduler Timing Wheel (spec §4.3).
//!
//! A fixed-size ring of `B = 128` buckets indexed by `floor(t * R) mod B`.
//! Two instances are owned by the runtime: the local scheduler (keyed on
//! local monotonic time, always live) and the global scheduler (keyed on
//! estimated master time, only advanced once a service's status reaches
//! `LOCAL` or better).

use crate::error::RuntimeError;
use crate::message::{Message, Timestamp};

pub const BUCKET_COUNT: usize = 128;

struct Entry {
    message: Message,
}

/// A timing wheel. `tick_rate` is `R` in the spec's `floor(t*R) mod B`
/// formula; buckets hold entries in ascending-timestamp order.
pub struct Scheduler {
    buckets: Vec<Vec<Entry>>,
    last_bin: usize,
    last_time: Timestamp,
    tick_rate: f64,
}

impl Scheduler {
    pub fn new(tick_rate: f64) -> Self {
        Scheduler {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            last_bin: 0,
            last_time: 0.0,
            tick_rate,
        }
    }

    fn bucket_of(&self, t: Timestamp) -> usize {
        ((t * self.tick_rate).floor() as i64).rem_euclid(BUCKET_COUNT as i64) as usize
    }

    pub fn last_time(&self) -> Timestamp {
        self.last_time
    }

    /// Enqueues `message`. Per spec §4.3/§8: `t <= now` never enters a
    /// bucket — the caller must route it to the pending-delivery FIFO
    /// instead. Returns `Err` in that case so callers can't silently lose
    /// the distinction.
    pub fn schedule(&mut self, message: Message, now: Timestamp) -> Result<(), RuntimeError> {
        if message.timestamp <= now {
            return Err(RuntimeError::Timing(
                "scheduled message due now or in the past belongs on the pending FIFO".into(),
            ));
        }
        let bin = self.bucket_of(message.timestamp);
        let bucket = &mut self.buckets[bin];
        let pos = bucket
            .iter()
            .position(|e| e.message.timestamp > message.timestamp)
            .unwrap_or(bucket.len());
        bucket.insert(pos, Entry { message });
        Ok(())
    }

    /// Advances the wheel to `now`, returning every message whose time has
    /// come, in non-decreasing timestamp order (insertion order preserved
    /// for ties within a bucket). A lap (`now - last_time > B/R`) forces a
    /// full-wheel scan so no straggler is missed on a cold restart.
    pub fn advance(&mut self, now: Timestamp) -> Vec<Message> {
        let mut due = Vec::new();
        let lapped = now - self.last_time > (BUCKET_COUNT as f64) / self.tick_rate;

        if lapped {
            for bucket in self.buckets.iter_mut() {
                let mut keep = Vec::new();
                for entry in bucket.drain(..) {
                    if entry.message.timestamp <= now {
                        due.push(entry.message);
                    } else {
                        keep.push(entry);
                    }
                }
                *bucket = keep;
            }
            due.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap());
        } else {
            let now_bin = self.bucket_of(now);
            let mut bin = (self.last_bin + 1) % BUCKET_COUNT;
            loop {
                let bucket = &mut self.buckets[bin];
                let mut keep = Vec::new();
                for entry in bucket.drain(..) {
                    if entry.message.timestamp <= now {
                        due.push(entry.message);
                    } else {
                        keep.push(entry);
                    }
                }
                *bucket = keep;
                if bin == now_bin {
                    break;
                }
                bin = (bin + 1) % BUCKET_COUNT;
            }
        }

        self.last_bin = self.bucket_of(now);
        self.last_time = now;
        due
    }

    /// Discards every queued message addressed to `service`, returning how
    /// many were dropped. Used when a service disappears (spec §4.4: "any
    /// queued timed messages to it are discarded and reported").
    pub fn purge_service(&mut self, service: &str) -> usize {
        let mut purged = 0;
        for bucket in self.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|e| crate::directory::Directory::split_service(&e.message.address).1 != service);
            purged += before - bucket.len();
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::message::MessageBuilder;

    fn msg_at(t: Timestamp) -> Message {
        MessageBuilder::new().seal(t, "/a/b").unwrap()
    }

    #[test]
    fn rejects_immediate_and_past_messages() {
        let mut s = Scheduler::new(1000.0);
        assert!(s.schedule(msg_at(0.0), 0.0).is_err());
        assert!(s.schedule(msg_at(1.0), 2.0).is_err());
    }

    #[test]
    fn advance_delivers_due_messages_in_order() {
        let mut s = Scheduler::new(1000.0);
        s.schedule(msg_at(1.0), 0.0).unwrap();
        s.schedule(msg_at(1.0), 0.0).unwrap();
        s.schedule(msg_at(0.9), 0.0).unwrap();

        let due = s.advance(1.1);
        let times: Vec<Timestamp> = due.iter().map(|m| m.timestamp).collect();
        assert_eq!(times, vec![0.9, 1.0, 1.0]);
    }

    #[test]
    fn later_entries_survive_an_advance() {
        let mut s = Scheduler::new(1000.0);
        s.schedule(msg_at(5.0), 0.0).unwrap();
        let due = s.advance(1.0);
        assert!(due.is_empty());
        let due = s.advance(5.0);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn purge_service_drops_only_its_own_messages() {
        let mut s = Scheduler::new(1000.0);
        s.schedule(msg_at(5.0), 0.0).unwrap();
        s.schedule(MessageBuilder::new().seal(5.0, "/other/c").unwrap(), 0.0).unwrap();
        assert_eq!(s.purge_service("a"), 1);
        let due = s.advance(5.0);
        assert_eq!(due.len(), 1);
        assert_eq!(Directory::split_service(&due[0].address).1, "other");
    }

    #[test]
    fn advance_walks_bins_incrementally_without_lapping() {
        // tick_rate 1000 => B/R = 0.128s; every step below stays well under
        // that, so `advance` must take the per-bin walk from `last_bin + 1`
        // through the bin for `now`, not the lapped full-wheel rescan.
        let mut s = Scheduler::new(1000.0);
        s.schedule(msg_at(0.05), 0.0).unwrap();
        s.schedule(msg_at(0.08), 0.0).unwrap();

        let due = s.advance(0.1);
        assert_eq!(due.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![0.05, 0.08]);
        assert_eq!(s.last_time(), 0.1);

        // Nothing left over from the first walk, and the second walk only
        // picks up the bin it newly advances into.
        let due = s.advance(0.11);
        assert!(due.is_empty());

        s.schedule(msg_at(0.125), 0.1).unwrap();
        let due = s.advance(0.126);
        assert_eq!(due.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![0.125]);
        assert_eq!(s.last_time(), 0.126);
    }

    #[test]
    fn lap_triggers_full_scan_and_finds_stragglers() {
        let mut s = Scheduler::new(10.0);
        s.schedule(msg_at(0.01), 0.0).unwrap();
        let due = s.advance(100.0);
        assert_eq!(due.len(), 1, "a cold restart lap must not drop overdue entries");
    }
}
