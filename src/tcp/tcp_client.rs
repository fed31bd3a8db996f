use std::sync::Arc;
use anyhow::bail;
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, Instrument, Span};

use crate::node::link::is_valid_link_name;
use crate::node::CluckNode;
use crate::protocol::handshake::exchange_headers;
use crate::tcp::connection::run_connection;
use crate::tcp::connection_state::ConnectionState;
use crate::tcp::tcp_config::TcpConfig;

/// A connection to a remote node that is kept alive: it is re-established after
///  `reconnect_delay` whenever it fails or is closed, until the client is stopped.
///
/// While connected, the remote node is reachable on the local node as `link_name`. The client
///  announces itself to the server with a link name hint, and broadcasts a structure notification
///  after each successful connect.
pub struct TcpClient {
    stop: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl TcpClient {
    /// Starts connecting in the background. This requires a tokio runtime.
    pub fn start(node: Arc<CluckNode>, remote: &str, link_name: &str, link_name_hint: Option<&str>, config: TcpConfig) -> anyhow::Result<TcpClient> {
        config.validate()?;
        if !is_valid_link_name(link_name) {
            bail!("invalid link name {:?}", link_name);
        }
        let runtime = Handle::try_current()?;

        let (stop, stop_receiver) = watch::channel(false);
        let (state_sender, state) = watch::channel(ConnectionState::Connecting);

        let remote = remote.to_string();
        let link_name = link_name.to_string();
        let link_name_hint = link_name_hint.map(|s| s.to_string());
        let task = runtime.spawn(async move {
            reconnect_loop(node, remote, link_name, link_name_hint, config, state_sender, stop_receiver).await
        });

        Ok(TcpClient {
            stop,
            state,
            task,
        })
    }

    /// Subscribes to changes of the connection's state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Closes the connection (if any) and ends reconnecting. The link is not registered again
    ///  after this call.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Waits for the client's background task to finish after [TcpClient::stop]
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            debug!("client task ended abnormally: {}", e);
        }
    }
}

#[instrument(name="tcp_client", skip_all, fields(remote = %remote, link = %link_name))]
async fn reconnect_loop(
    node: Arc<CluckNode>,
    remote: String,
    link_name: String,
    link_name_hint: Option<String>,
    config: TcpConfig,
    state: watch::Sender<ConnectionState>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let established = select! {
            r = establish(&remote, link_name_hint.as_deref(), &config, &state) => r,
            _ = stop.changed() => break,
        };

        if let Some((stream, initial_data)) = established {
            info!("connected to {}", remote);
            let final_state = run_connection(&node, stream, initial_data, &link_name, &config, &state, stop.clone(), true)
                .instrument(Span::current())
                .await;
            info!("disconnected from {} ({:?})", remote, final_state);
        }

        if *stop.borrow() {
            break;
        }
        select! {
            _ = sleep(config.reconnect_delay) => {}
            _ = stop.changed() => break,
        }
    }

    state.send_replace(ConnectionState::Closing);
    debug!("client stopped");
}

/// Connects and exchanges handshake headers, returning `None` if either fails
async fn establish(remote: &str, link_name_hint: Option<&str>, config: &TcpConfig, state: &watch::Sender<ConnectionState>) -> Option<(TcpStream, BytesMut)> {
    state.send_replace(ConnectionState::Connecting);
    let mut stream = match timeout(config.connect_timeout, TcpStream::connect(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("connecting failed: {}", e);
            return None;
        }
        Err(_) => {
            debug!("connecting timed out after {:?}", config.connect_timeout);
            return None;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {}", e);
    }

    state.send_replace(ConnectionState::Handshaking);
    match timeout(config.handshake_timeout, exchange_headers(&mut stream, link_name_hint)).await {
        Ok(Ok((_, initial_data))) => Some((stream, initial_data)),
        Ok(Err(e)) => {
            debug!("handshake failed: {}", e);
            None
        }
        Err(_) => {
            debug!("handshake timed out after {:?}", config.handshake_timeout);
            None
        }
    }
}
