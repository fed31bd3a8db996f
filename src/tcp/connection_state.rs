/// The life cycle of a TCP connection, as published to observers of a transport.
///
/// ```ascii
/// Connecting -> Handshaking -> Active -> Closing
///     ^              |            |  \-> Failed
///     +--------------+            |
///     +---------------------------+ (client reconnect)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    /// the connection ended regularly: closed by the peer, reset, keepalive expired, or stopped
    Closing,
    /// the connection ended because of a protocol violation or an unexpected I/O error
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Failed)
    }
}
