//! Network health: healthy while round updates keep arriving, unhealthy once they stop.
//! Host-driven: the caller passes the current instant; the tracker reports transitions only.

use std::time::{Duration, Instant};

/// Default time without a round update before the network is considered unhealthy.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HealthTracker {
    timeout: Duration,
    last_round: Option<Instant>,
    healthy: bool,
}

impl HealthTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_round: None,
            healthy: false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// A round update arrived. Returns `Some(true)` on the transition to healthy.
    pub fn on_round(&mut self, now: Instant) -> Option<bool> {
        self.last_round = Some(now);
        self.transition(true)
    }

    /// The link dropped. Returns `Some(false)` if the network was healthy.
    pub fn on_disconnect(&mut self) -> Option<bool> {
        self.last_round = None;
        self.transition(false)
    }

    /// Periodic check. Returns `Some(false)` when the last round is older than the timeout.
    pub fn check(&mut self, now: Instant) -> Option<bool> {
        match self.last_round {
            Some(at) if now.saturating_duration_since(at) >= self.timeout => self.transition(false),
            _ => None,
        }
    }

    fn transition(&mut self, healthy: bool) -> Option<bool> {
        if self.healthy == healthy {
            return None;
        }
        self.healthy = healthy;
        Some(healthy)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_round_reports_healthy_once() {
        let mut t = HealthTracker::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(!t.is_healthy());
        assert_eq!(t.on_round(now), Some(true));
        assert_eq!(t.on_round(now + Duration::from_secs(1)), None);
        assert!(t.is_healthy());
    }

    #[test]
    fn stale_rounds_report_unhealthy() {
        let mut t = HealthTracker::new(Duration::from_secs(5));
        let now = Instant::now();
        t.on_round(now);
        assert_eq!(t.check(now + Duration::from_secs(4)), None);
        assert_eq!(t.check(now + Duration::from_secs(5)), Some(false));
        assert_eq!(t.check(now + Duration::from_secs(6)), None);
        assert_eq!(t.on_round(now + Duration::from_secs(7)), Some(true));
    }

    #[test]
    fn disconnect_only_reports_when_healthy() {
        let mut t = HealthTracker::default();
        assert_eq!(t.on_disconnect(), None);
        t.on_round(Instant::now());
        assert_eq!(t.on_disconnect(), Some(false));
    }

    #[test]
    fn never_connected_stays_quiet() {
        let mut t = HealthTracker::new(Duration::from_millis(1));
        assert_eq!(t.check(Instant::now() + Duration::from_secs(60)), None);
    }
}
