use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::node::link::is_valid_link_name;
use crate::node::CluckNode;
use crate::protocol::handshake::exchange_headers;
use crate::tcp::connection::run_connection;
use crate::tcp::connection_state::ConnectionState;
use crate::tcp::tcp_config::TcpConfig;

/// Accepts connections from remote nodes, registering each of them as a link on the local node.
///
/// A connection's link is named after the link name hint the client sent, or `client-<n>` if
///  the client sent no (valid) hint. A client connecting with a hint that is already in use
///  replaces the previous link of that name, which is what happens when a client reconnects
///  before the server noticed the old connection is gone.
pub struct TcpServer {
    node: Arc<CluckNode>,
    listener: TcpListener,
    config: Arc<TcpConfig>,
    client_counter: AtomicU64,
    stop: watch::Sender<bool>,
}

impl TcpServer {
    pub async fn bind(node: Arc<CluckNode>, addr: impl ToSocketAddrs, config: TcpConfig) -> anyhow::Result<TcpServer> {
        config.validate()?;
        Ok(TcpServer {
            node,
            listener: TcpListener::bind(addr).await?,
            config: Arc::new(config),
            client_counter: AtomicU64::new(0),
            stop: watch::channel(false).0,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the server is stopped, handling each of them in a separate task
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("listening on {:?}", self.listener.local_addr());
        let mut stop = self.stop.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }

            let (stream, addr) = select! {
                r = self.listener.accept() => r?,
                _ = stop.changed() => break,
            };

            let client_number = self.client_counter.fetch_add(1, Ordering::Relaxed);
            let node = self.node.clone();
            let config = self.config.clone();
            let stop = self.stop.subscribe();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(addr, stream, client_number, node, config, stop).await {
                    debug!("connection from {} ended before it was established: {}", addr, e);
                }
            });
        }

        debug!("server stopped");
        Ok(())
    }

    /// Stops accepting connections, and closes all connections accepted by this server
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = %addr))]
async fn handle_connection(
    addr: SocketAddr,
    mut stream: TcpStream,
    client_number: u64,
    node: Arc<CluckNode>,
    config: Arc<TcpConfig>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    debug!("received connection request");
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {}", e);
    }

    let state = watch::Sender::new(ConnectionState::Handshaking);
    if *stop.borrow() {
        debug!("server stopped before the handshake");
        return Ok(());
    }
    let (hint, initial_data) = select! {
        r = timeout(config.handshake_timeout, exchange_headers(&mut stream, None)) => r??,
        _ = stop.changed() => {
            debug!("server stopped during the handshake");
            return Ok(());
        }
    };

    let link_name = match hint {
        Some(hint) if is_valid_link_name(&hint) => hint,
        Some(hint) => {
            warn!("ignoring invalid link name hint {:?}", hint);
            format!("client-{}", client_number)
        }
        None => format!("client-{}", client_number),
    };
    debug!("initial handshake complete, registering as {}", link_name);

    let final_state = run_connection(&node, stream, initial_data, &link_name, &config, &state, stop, false)
        .instrument(Span::current())
        .await;
    debug!("connection closed ({:?})", final_state);
    Ok(())
}
