use std::time::Duration;
use anyhow::bail;

pub struct TcpConfig {
    /// Delay between a failed or closed connection and the next connection attempt of a client
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// Upper bound for the exchange of handshake headers after the socket is connected
    pub handshake_timeout: Duration,

    /// Socket reads are polled with this timeout. Expiry of a single read is not an error, it is
    ///  just an opportunity to check the keepalive deadline.
    pub read_poll_timeout: Duration,
    /// Once a peer was seen sending keepalives, the connection is considered dead if no frame
    ///  arrives for this long.
    pub keepalive_timeout: Duration,
    /// Interval for sending keepalive frames, or `None` to never send them
    pub keepalive_interval: Option<Duration>,

    /// Frames with bigger payloads are treated as a protocol violation
    pub max_payload_len: usize,
    /// Number of outgoing messages a connection buffers for a slow peer. Messages sent while the
    ///  buffer is full are dropped.
    pub send_queue_len: usize,

    /// Log every frame sent or received at TRACE level, and warn about slow dispatch of inbound
    ///  frames
    pub trace_frames: bool,
    pub slow_dispatch_threshold: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            read_poll_timeout: Duration::from_millis(500),
            keepalive_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(1)),
            max_payload_len: 16*1024*1024,
            send_queue_len: 1024,
            trace_frames: false,
            slow_dispatch_threshold: Duration::from_millis(1000),
        }
    }
}

impl TcpConfig {
    /// default configuration with frame tracing
    pub fn tracing() -> TcpConfig {
        TcpConfig {
            trace_frames: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_poll_timeout.is_zero() {
            bail!("read poll timeout must be positive");
        }
        if self.keepalive_timeout < self.read_poll_timeout {
            bail!("keepalive timeout must not be shorter than the read poll timeout");
        }
        if let Some(interval) = self.keepalive_interval {
            if interval.is_zero() {
                bail!("keepalive interval must be positive");
            }
            if interval >= self.keepalive_timeout {
                bail!("keepalive interval must be shorter than the keepalive timeout");
            }
        }
        if self.max_payload_len > i32::MAX as usize {
            bail!("max payload length can not exceed {}", i32::MAX);
        }
        if self.send_queue_len == 0 {
            bail!("send queue length must be positive");
        }
        Ok(())
    }
}
