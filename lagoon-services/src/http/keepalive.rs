//! Per-connection keep-alive accounting: four timers, three phases.
//!
//! One [`ConnectionLifecycle`] value lives in each connection's drive loop
//! and is only ever touched from that worker. It tracks the idle deadline
//! (reset on any I/O), the protocol heartbeat deadline, the connection's
//! max age and the requests-served budget. Crossing the age or request
//! budget moves the connection from `Active` to `Draining`: in-flight
//! requests finish, HTTP/1 marks the next response `Connection: close`,
//! HTTP/2 starts its two-phase GOAWAY. `Closing` means the transport goes
//! down as soon as pending writes drain.

use std::time::{Duration, Instant};

use lagoon_core::config::KeepaliveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Draining,
    Closing,
}

/// What a lifecycle timer firing means to the drive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    IdleTimeout,
    PingDue,
    MaxAgeReached,
}

#[derive(Debug, Clone)]
pub struct KeepalivePolicy {
    pub idle_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
    pub max_age: Option<Duration>,
    pub max_requests: Option<usize>,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self::from(&KeepaliveConfig::default())
    }
}

impl From<&KeepaliveConfig> for KeepalivePolicy {
    fn from(cfg: &KeepaliveConfig) -> Self {
        Self {
            idle_timeout: Some(cfg.keepalive_timeout()),
            ping_interval: cfg.ping_interval(),
            max_age: Some(cfg.keepalive_time()),
            max_requests: Some(cfg.keepalive_requests),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionLifecycle {
    policy: KeepalivePolicy,
    phase: Phase,
    started: Instant,
    last_activity: Instant,
    last_ping: Instant,
    requests_served: usize,
    tunneled: bool,
    needs_immediate_disconnection: bool,
}

impl ConnectionLifecycle {
    pub fn new(policy: KeepalivePolicy) -> Self {
        let now = Instant::now();
        Self {
            policy,
            phase: Phase::Active,
            started: now,
            last_activity: now,
            last_ping: now,
            requests_served: 0,
            tunneled: false,
            needs_immediate_disconnection: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn requests_served(&self) -> usize {
        self.requests_served
    }

    /// Any read or write resets the idle clock.
    pub fn on_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn on_ping_sent(&mut self) {
        self.last_ping = Instant::now();
    }

    /// Account a new request. Returns false when the connection is already
    /// draining or closing and must not admit it.
    pub fn admit_request(&mut self) -> bool {
        if self.phase != Phase::Active {
            return false;
        }
        self.on_activity();
        self.requests_served += 1;
        if let Some(max) = self.policy.max_requests {
            if !self.tunneled && self.requests_served >= max {
                self.phase = Phase::Draining;
            }
        }
        true
    }

    /// The request budget was the drain trigger and the budget-hitting
    /// response has drained: time to close.
    pub fn should_close_after_response(&self) -> bool {
        self.phase != Phase::Active
    }

    pub fn initiate_drain(&mut self) {
        if self.phase == Phase::Active {
            self.phase = Phase::Draining;
        }
    }

    pub fn begin_closing(&mut self) {
        self.phase = Phase::Closing;
    }

    /// An upgraded tunnel leaves request accounting: the session is
    /// long-lived by design and only idle/age policy still applies to it.
    pub fn enter_tunnel(&mut self) {
        self.tunneled = true;
        if self.phase == Phase::Draining && self.within_budgets() {
            self.phase = Phase::Active;
        }
    }

    fn within_budgets(&self) -> bool {
        match (self.policy.max_age, self.started.elapsed()) {
            (Some(max_age), age) if age >= max_age => false,
            _ => true,
        }
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }

    pub fn mark_immediate_disconnection(&mut self) {
        self.needs_immediate_disconnection = true;
        self.phase = Phase::Closing;
    }

    pub fn needs_immediate_disconnection(&self) -> bool {
        self.needs_immediate_disconnection
    }

    /// The next timer to arm: the earliest of idle, ping and max-age
    /// deadlines. `None` when no timer policy is configured.
    pub fn next_event(&self) -> Option<(LifecycleEvent, Duration)> {
        let now = Instant::now();
        let mut next: Option<(LifecycleEvent, Duration)> = None;

        let mut consider = |event: LifecycleEvent, deadline: Instant| {
            let remaining = deadline.saturating_duration_since(now);
            match next {
                Some((_, current)) if current <= remaining => {}
                _ => next = Some((event, remaining)),
            }
        };

        if let Some(idle) = self.policy.idle_timeout {
            consider(LifecycleEvent::IdleTimeout, self.last_activity + idle);
        }
        if let Some(interval) = self.policy.ping_interval {
            consider(LifecycleEvent::PingDue, self.last_ping + interval);
        }
        if self.phase == Phase::Active {
            if let Some(max_age) = self.policy.max_age {
                consider(LifecycleEvent::MaxAgeReached, self.started + max_age);
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_requests: Option<usize>) -> KeepalivePolicy {
        KeepalivePolicy {
            idle_timeout: Some(Duration::from_secs(75)),
            ping_interval: None,
            max_age: Some(Duration::from_secs(3600)),
            max_requests,
        }
    }

    #[test]
    fn test_request_budget_drains() {
        let mut lc = ConnectionLifecycle::new(policy(Some(2)));
        assert!(lc.admit_request());
        assert!(!lc.should_close_after_response());
        assert!(lc.admit_request());
        assert_eq!(lc.phase(), Phase::Draining);
        assert!(lc.should_close_after_response());
        // Draining connections admit nothing new.
        assert!(!lc.admit_request());
        assert_eq!(lc.requests_served(), 2);
    }

    #[test]
    fn test_drain_and_close_transitions() {
        let mut lc = ConnectionLifecycle::new(policy(None));
        lc.initiate_drain();
        assert_eq!(lc.phase(), Phase::Draining);
        lc.begin_closing();
        assert_eq!(lc.phase(), Phase::Closing);
    }

    #[test]
    fn test_tunnel_leaves_request_accounting() {
        let mut lc = ConnectionLifecycle::new(policy(Some(1)));
        assert!(lc.admit_request());
        assert_eq!(lc.phase(), Phase::Draining);
        lc.enter_tunnel();
        assert_eq!(lc.phase(), Phase::Active);
        assert!(lc.is_tunneled());
        // Further requests on a tunneled connection no longer trip the
        // budget (the tunnel is the final exchange).
        assert!(lc.admit_request());
        assert_eq!(lc.phase(), Phase::Active);
    }

    #[test]
    fn test_next_event_prefers_earliest_deadline() {
        let lc = ConnectionLifecycle::new(KeepalivePolicy {
            idle_timeout: Some(Duration::from_secs(10)),
            ping_interval: Some(Duration::from_secs(5)),
            max_age: Some(Duration::from_secs(100)),
            max_requests: None,
        });
        let (event, remaining) = lc.next_event().unwrap();
        assert_eq!(event, LifecycleEvent::PingDue);
        assert!(remaining <= Duration::from_secs(5));
    }

    #[test]
    fn test_no_timers_no_event() {
        let lc = ConnectionLifecycle::new(KeepalivePolicy {
            idle_timeout: None,
            ping_interval: None,
            max_age: None,
            max_requests: None,
        });
        assert!(lc.next_event().is_none());
    }

    #[test]
    fn test_immediate_disconnection() {
        let mut lc = ConnectionLifecycle::new(policy(None));
        lc.mark_immediate_disconnection();
        assert!(lc.needs_immediate_disconnection());
        assert_eq!(lc.phase(), Phase::Closing);
    }
}
