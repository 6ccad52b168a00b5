//! Liveness policy for agent sessions
//!
//! The session loop feeds the time since the last accepted message into
//! [`HeartbeatPolicy::verdict`]; the policy itself holds no clock and no
//! state, which keeps the expiry rules trivially testable.

use std::time::Duration;

/// What the session loop should do about a quiet peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Traffic seen recently, nothing to do
    Idle,
    /// One interval without traffic: probe with a Ping
    SendPing,
    /// Quiet past the timeout window: the session is presumed dead
    Expired,
}

/// Heartbeat supervision policy
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPolicy {
    interval: Duration,
    timeout_multiple: u32,
}

impl HeartbeatPolicy {
    pub fn new(interval: Duration, timeout_multiple: u32) -> Self {
        // A multiple below 2 would expire sessions before a Ping had any
        // chance of being answered.
        Self {
            interval,
            timeout_multiple: timeout_multiple.max(2),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The window after which a quiet session is considered dead
    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_multiple
    }

    pub fn verdict(&self, idle_for: Duration) -> HeartbeatVerdict {
        if idle_for >= self.timeout() {
            HeartbeatVerdict::Expired
        } else if idle_for >= self.interval {
            HeartbeatVerdict::SendPing
        } else {
            HeartbeatVerdict::Idle
        }
    }
}
