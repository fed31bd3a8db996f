//! TCP transport: [tcp_client::TcpClient] keeps a connection to a remote node alive, and
//!  [tcp_server::TcpServer] accepts connections. Either way, each connection is a link on the
//!  local node that forwards messages to the remote node.

pub mod connection;
pub mod connection_state;
pub mod tcp_client;
pub mod tcp_config;
pub mod tcp_server;
pub mod tracing_link;

pub use connection_state::ConnectionState;
pub use tcp_client::TcpClient;
pub use tcp_config::TcpConfig;
pub use tcp_server::TcpServer;

/// Ports that robots conventionally listen on. Robot networks often block everything except
///  web ports, so those are used in addition to the dedicated ports.
pub const PORT_HTTPS: u16 = 443;
pub const PORT_HTTP: u16 = 80;
pub const PORT_PRIMARY: u16 = 1540;
pub const PORT_ALTERNATE: u16 = 1180;
