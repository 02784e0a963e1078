//! Per-connection inbound rate control.
//!
//! Each connection gets a sliding window of request timestamps. Exceeding the
//! window capacity blocks the connection for a fixed duration, during which
//! every message it sends is rejected. Limits are tracked per connection, not
//! per identity: a client that reconnects starts with a clean record.

use crate::connection::ConnectionId;
use dashmap::DashMap;
use log::*;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Floor for the sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateGateSettings {
    /// Length of the sliding window.
    pub window: Duration,
    /// Messages allowed per window.
    pub capacity: usize,
    /// How long a connection stays blocked once it exceeds the window.
    pub block_duration: Duration,
    /// How often stale records are reclaimed. Raised to one second if lower.
    pub sweep_interval: Duration,
}

impl Default for RateGateSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            capacity: 10,
            block_duration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Blocked,
}

#[derive(Debug)]
struct RateRecord {
    requests: VecDeque<Instant>,
    blocked_at: Option<Instant>,
    last_seen: Instant,
}

impl RateRecord {
    fn new(now: Instant) -> Self {
        Self {
            requests: VecDeque::new(),
            blocked_at: None,
            last_seen: now,
        }
    }

    fn reclaimable(&self, now: Instant, block_duration: Duration) -> bool {
        match self.blocked_at {
            Some(blocked_at) => now.saturating_duration_since(blocked_at) >= block_duration,
            None => now.saturating_duration_since(self.last_seen) >= block_duration,
        }
    }
}

pub struct RateGate {
    records: DashMap<ConnectionId, RateRecord>,
    settings: RateGateSettings,
}

impl RateGate {
    pub fn new(settings: RateGateSettings) -> Self {
        Self {
            records: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &RateGateSettings {
        &self.settings
    }

    pub fn check(&self, connection_id: &ConnectionId) -> RateDecision {
        self.check_at(connection_id, Instant::now())
    }

    pub(crate) fn check_at(&self, connection_id: &ConnectionId, now: Instant) -> RateDecision {
        let settings = &self.settings;
        let mut record = self
            .records
            .entry(connection_id.clone())
            .or_insert_with(|| RateRecord::new(now));
        record.last_seen = now;

        if let Some(blocked_at) = record.blocked_at {
            if now.saturating_duration_since(blocked_at) < settings.block_duration {
                return RateDecision::Blocked;
            }
            debug!("Lifting rate limit block on connection {connection_id}");
            record.blocked_at = None;
            record.requests.clear();
        }

        while let Some(&oldest) = record.requests.front() {
            if now.saturating_duration_since(oldest) >= settings.window {
                record.requests.pop_front();
            } else {
                break;
            }
        }

        if record.requests.len() + 1 > settings.capacity {
            warn!("Rate limit exceeded for connection {connection_id}");
            record.blocked_at = Some(now);
            return RateDecision::Blocked;
        }

        record.requests.push_back(now);
        RateDecision::Allowed
    }

    /// Drop a connection's record.
    pub fn forget(&self, connection_id: &ConnectionId) {
        self.records.remove(connection_id);
    }

    /// Discards records whose block expired or that have been idle for a
    /// whole block duration. Returns how many were discarded.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let before = self.records.len();
        let block_duration = self.settings.block_duration;
        self.records
            .retain(|_, record| !record.reclaimable(now, block_duration));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!("Rate gate sweep reclaimed {removed} record(s)");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Runs [`Self::sweep`] every sweep interval until the gate is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.sweep_interval.max(MIN_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match gate.upgrade() {
                    Some(gate) => {
                        gate.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(RateGateSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_eleventh_message_in_window_is_blocked() {
        let gate = RateGate::default();
        let conn = ConnectionId::new();
        let start = Instant::now();

        for i in 0..10 {
            assert_eq!(
                gate.check_at(&conn, start + ms(i * 50)),
                RateDecision::Allowed,
                "message {i} should pass"
            );
        }
        assert_eq!(gate.check_at(&conn, start + ms(600)), RateDecision::Blocked);
    }

    #[test]
    fn test_block_lasts_block_duration_then_resets() {
        let gate = RateGate::default();
        let conn = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..10 {
            gate.check_at(&conn, start);
        }
        assert_eq!(gate.check_at(&conn, start), RateDecision::Blocked);

        // Still blocked even though the window itself has long passed.
        assert_eq!(
            gate.check_at(&conn, start + Duration::from_secs(30)),
            RateDecision::Blocked
        );
        assert_eq!(
            gate.check_at(&conn, start + Duration::from_secs(60)),
            RateDecision::Allowed
        );
        // Window was reset: a full window's worth is available again.
        let later = start + Duration::from_secs(60);
        for _ in 0..9 {
            assert_eq!(gate.check_at(&conn, later), RateDecision::Allowed);
        }
        assert_eq!(gate.check_at(&conn, later), RateDecision::Blocked);
    }

    #[test]
    fn test_window_slides() {
        let gate = RateGate::default();
        let conn = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..10 {
            assert_eq!(gate.check_at(&conn, start), RateDecision::Allowed);
        }
        assert_eq!(
            gate.check_at(&conn, start + Duration::from_secs(1)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn test_connections_are_limited_independently() {
        let gate = RateGate::default();
        let noisy = ConnectionId::new();
        let quiet = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..11 {
            gate.check_at(&noisy, start);
        }
        assert_eq!(gate.check_at(&noisy, start), RateDecision::Blocked);
        assert_eq!(gate.check_at(&quiet, start), RateDecision::Allowed);
    }

    #[test]
    fn test_sweep_reclaims_expired_and_idle_records() {
        let gate = RateGate::default();
        let blocked = ConnectionId::new();
        let idle = ConnectionId::new();
        let active = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..11 {
            gate.check_at(&blocked, start);
        }
        gate.check_at(&idle, start);
        gate.check_at(&active, start + Duration::from_secs(59));
        assert_eq!(gate.tracked(), 3);

        assert_eq!(gate.sweep_at(start + Duration::from_secs(30)), 0);
        assert_eq!(gate.sweep_at(start + Duration::from_secs(61)), 2);
        assert_eq!(gate.tracked(), 1);
    }

    #[test]
    fn test_forget_drops_record() {
        let gate = RateGate::default();
        let conn = ConnectionId::new();
        gate.check(&conn);
        assert_eq!(gate.tracked(), 1);
        gate.forget(&conn);
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_gate_dropped() {
        let gate = Arc::new(RateGate::new(RateGateSettings {
            sweep_interval: Duration::from_secs(1),
            ..RateGateSettings::default()
        }));
        let handle = gate.spawn_sweeper();
        drop(gate);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_keeps_sweeper_running() {
        let gate = Arc::new(RateGate::new(RateGateSettings {
            sweep_interval: Duration::ZERO,
            ..RateGateSettings::default()
        }));
        let handle = gate.spawn_sweeper();

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        drop(gate);
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
