//! Component F — Clock-Sync Engine (spec §4.6).
//!
//! Election is static: exactly one process calls [`ClockRole::become_master`]
//! at startup; everyone else stays a client and runs the ping/pong protocol
//! against the master over the peer's channel. Grounded on the teacher's
//! `clock.rs` drift-smoothing shape (EMA blending, "clock jump" reporting)
//! but the RTT/master-election machinery itself is new — the teacher
//! delegates that entirely to Ableton Link, which has no place in an
//! application that must elect its own master (see `DESIGN.md`).

use std::collections::VecDeque;

use crate::config::ClockConfig;
use crate::message::Timestamp;

/// One ping/pong round-trip sample.
#[derive(Debug, Clone, Copy)]
struct Sample {
    offset: f64,
    rtt: f64,
}

/// Per-peer (client-side) clock-sync state: the sliding window of the last
/// `H` round-trip samples and the smoothed offset derived from them.
#[derive(Debug, Clone)]
pub struct ClockSyncState {
    window: VecDeque<Sample>,
    capacity: usize,
    smoothed_offset: Option<f64>,
    pending_ping: Option<(u32, Timestamp)>,
    next_ping_id: u32,
    last_ping_sent: Timestamp,
}

impl Default for ClockSyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSyncState {
    pub fn new() -> Self {
        ClockSyncState {
            window: VecDeque::new(),
            capacity: 5,
            smoothed_offset: None,
            pending_ping: None,
            next_ping_id: 0,
            last_ping_sent: f64::NEG_INFINITY,
        }
    }

    pub fn with_window(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Re-sizes the sliding window in place (spec_full §A.3: the window size
    /// `H` is a configuration parameter, applied once a peer's record is
    /// created with the runtime's configured value rather than the `H = 5`
    /// default baked into [`ClockSyncState::new`]).
    pub fn set_window(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    /// Starts a new ping, returning its id and the local send timestamp to
    /// embed in the outgoing ping frame.
    pub fn start_ping(&mut self, now: Timestamp) -> (u32, Timestamp) {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending_ping = Some((id, now));
        self.last_ping_sent = now;
        (id, now)
    }

    pub fn due_for_ping(&self, now: Timestamp, interval: Timestamp) -> bool {
        now - self.last_ping_sent >= interval
    }

    /// Consumes a `pong(id, t_master)` reply received locally at `t1`.
    /// Ignored if it doesn't match the outstanding ping (stale/duplicate).
    pub fn on_pong(&mut self, id: u32, t_master: Timestamp, t1: Timestamp, config: &ClockConfig) -> bool {
        let Some((pending_id, t0)) = self.pending_ping else { return false };
        if pending_id != id {
            return false;
        }
        self.pending_ping = None;

        let rtt = t1 - t0;
        let offset = t_master - (t0 + t1) / 2.0;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(Sample { offset, rtt });

        if self.window.len() < self.capacity {
            return false;
        }
        if self.dispersion() > config.dispersion_threshold {
            return false;
        }

        let median = self.median_offset();
        self.apply_smoothing(median, config.ema_constant);
        true
    }

    fn median_offset(&self) -> f64 {
        let mut offsets: Vec<f64> = self.window.iter().map(|s| s.offset).collect();
        offsets.sort_by(|a, b| a.partial_cmp(b).unwrap());
        offsets[offsets.len() / 2]
    }

    fn dispersion(&self) -> f64 {
        let min = self.window.iter().map(|s| s.rtt).fold(f64::INFINITY, f64::min);
        let max = self.window.iter().map(|s| s.rtt).fold(f64::NEG_INFINITY, f64::max);
        max - min
    }

    /// Blends towards `target` with the configured EMA constant; on a large
    /// jump, steps directly and the caller should report it. Monotonicity of
    /// global time is enforced by the caller (`offset()` is combined with
    /// local time there), not here.
    fn apply_smoothing(&mut self, target: f64, ema_constant: f64) {
        self.smoothed_offset = Some(match self.smoothed_offset {
            None => target,
            Some(current) => {
                let delta = target - current;
                if delta.abs() < 0.25 {
                    current + ema_constant * delta
                } else {
                    target
                }
            }
        });
    }

    pub fn is_synced(&self) -> bool {
        self.smoothed_offset.is_some()
    }

    pub fn offset(&self) -> Option<f64> {
        self.smoothed_offset
    }

    pub fn roundtrip(&self) -> Option<(f64, f64)> {
        if self.window.is_empty() {
            return None;
        }
        let mean = self.window.iter().map(|s| s.rtt).sum::<f64>() / self.window.len() as f64;
        let min = self.window.iter().map(|s| s.rtt).fold(f64::INFINITY, f64::min);
        Some((mean, min))
    }
}

/// This process's own clock-sync role (spec §4.6 "election is static").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRole {
    Uninitialized,
    Master,
    Client,
}

impl Default for ClockRole {
    fn default() -> Self {
        ClockRole::Uninitialized
    }
}

/// Tracks the local process's idea of global time once it is the master, or
/// guards against retrograde jumps once it is a synced client.
#[derive(Default)]
pub struct LocalClock {
    role: ClockRole,
    last_global: Timestamp,
}

impl LocalClock {
    pub fn new() -> Self {
        LocalClock::default()
    }

    pub fn become_master(&mut self) {
        self.role = ClockRole::Master;
    }

    pub fn become_client(&mut self) {
        if self.role == ClockRole::Uninitialized {
            self.role = ClockRole::Client;
        }
    }

    pub fn role(&self) -> ClockRole {
        self.role
    }

    /// Combines `local_now` with `offset` and clamps to never retrograde
    /// (spec §4.6: "if smoothing would retrograde, hold current value until
    /// real time catches up").
    pub fn global_time(&mut self, local_now: Timestamp, offset: f64) -> Timestamp {
        let candidate = local_now + offset;
        let result = if candidate < self.last_global { self.last_global } else { candidate };
        self.last_global = result;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ClockConfig {
        ClockConfig { window: 5, ema_constant: 0.125, dispersion_threshold: 1.0, ping_interval_ms: 250 }
    }

    #[test]
    fn sync_requires_full_window() {
        let mut state = ClockSyncState::new();
        let config = cfg();
        for i in 0..4 {
            let (id, _t0) = state.start_ping(i as f64);
            assert!(!state.on_pong(id, 10.0, i as f64 + 0.01, &config));
        }
        let (id, _t0) = state.start_ping(4.0);
        assert!(state.on_pong(id, 10.0, 4.01, &config));
        assert!(state.is_synced());
    }

    #[test]
    fn stale_pong_is_ignored() {
        let mut state = ClockSyncState::new();
        let config = cfg();
        state.start_ping(0.0);
        assert!(!state.on_pong(99, 10.0, 0.01, &config));
    }

    #[test]
    fn global_time_never_retrogrades() {
        let mut clock = LocalClock::new();
        let t1 = clock.global_time(1.0, 0.0);
        let t2 = clock.global_time(1.0, -5.0);
        assert!(t2 >= t1);
    }
}
