use std::time::Duration;
use tokio::time::Instant;

use crate::node::RmtTag;

pub const KEEPALIVE_TARGET: &str = "KEEPALIVE";
pub const KEEPALIVE_MARKER: u8 = 0x6D;

pub fn keepalive_payload() -> [u8; 2] {
    [RmtTag::NegativeAck.into(), KEEPALIVE_MARKER]
}

/// Tracks whether a connection's peer is still alive.
///
/// A peer that never sent a keepalive is never considered dead, since it may simply not support
///  keepalives. Once a keepalive frame was received, the peer must send *some* frame at least
///  once per timeout.
pub struct KeepaliveMonitor {
    timeout: Duration,
    expect_keepalives: bool,
    last_received: Instant,
}
impl KeepaliveMonitor {
    pub fn new(timeout: Duration) -> KeepaliveMonitor {
        KeepaliveMonitor {
            timeout,
            expect_keepalives: false,
            last_received: Instant::now(),
        }
    }

    /// Returns `true` if this is the first keepalive received from the peer
    pub fn on_frame_received(&mut self, is_keepalive: bool) -> bool {
        self.last_received = Instant::now();
        let is_first_keepalive = is_keepalive && !self.expect_keepalives;
        self.expect_keepalives |= is_keepalive;
        is_first_keepalive
    }

    pub fn expects_keepalives(&self) -> bool {
        self.expect_keepalives
    }

    pub fn is_expired(&self) -> bool {
        self.expect_keepalives && self.last_received.elapsed() >= self.timeout
    }
}
