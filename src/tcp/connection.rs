use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::CluckError;
use crate::node::{CluckNode, Link, LinkRef};
use crate::protocol::checksum::ChecksumSequence;
use crate::protocol::keepalive::KeepaliveMonitor;
use crate::protocol::{prepend_link, Frame};
use crate::tcp::connection_state::ConnectionState;
use crate::tcp::tcp_config::TcpConfig;
use crate::tcp::tracing_link::{describe_payload, trace_inbound, trace_outbound_keepalive, TracingLink};

/// The node-facing end of a TCP connection: messages sent to it are queued for the connection's
///  writer task. The link asks to be removed once the writer is gone.
///
/// The queue is bounded. While it is full (i.e. the peer does not keep up with reading), further
///  messages are dropped.
pub struct TcpLink {
    link_name: String,
    outgoing: mpsc::Sender<Frame>,
    is_overflowing: AtomicBool,
}

impl TcpLink {
    pub fn new(link_name: &str, queue_len: usize) -> (TcpLink, mpsc::Receiver<Frame>) {
        let (outgoing, receiver) = mpsc::channel(queue_len);
        let link = TcpLink {
            link_name: link_name.to_string(),
            outgoing,
            is_overflowing: AtomicBool::new(false),
        };
        (link, receiver)
    }
}

impl Link for TcpLink {
    fn send(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> bool {
        match self.outgoing.try_send(Frame::new(target, source, payload)) {
            Ok(()) => {
                if self.is_overflowing.swap(false, Ordering::AcqRel) {
                    debug!("send queue of link {} accepts messages again", self.link_name);
                }
                true
            }
            Err(TrySendError::Full(frame)) => {
                if !self.is_overflowing.swap(true, Ordering::AcqRel) {
                    warn!("send queue of link {} is full - dropping messages, starting with one to {:?}", self.link_name, frame.target);
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Runs an established (i.e. handshaken) connection until it ends, with its link registered on
///  the node as `link_name`. `initial_data` is whatever was received after the peer's handshake
///  header.
///
/// Returns the terminal state, which is also published through `state`.
pub async fn run_connection(
    node: &Arc<CluckNode>,
    stream: TcpStream,
    initial_data: BytesMut,
    link_name: &str,
    config: &TcpConfig,
    state: &watch::Sender<ConnectionState>,
    stop: watch::Receiver<bool>,
    notify_network: bool,
) -> ConnectionState {
    if *stop.borrow() {
        debug!("transport stopped before link {} was registered", link_name);
        state.send_replace(ConnectionState::Closing);
        return ConnectionState::Closing;
    }

    let (tcp_link, outgoing_receiver) = TcpLink::new(link_name, config.send_queue_len);
    let link: LinkRef = if config.trace_frames {
        Arc::new(TracingLink::new(link_name, Arc::new(tcp_link)))
    }
    else {
        Arc::new(tcp_link)
    };

    if let Err(e) = node.add_or_replace_link(link.clone(), link_name) {
        warn!("could not register link {}: {}", link_name, e);
        state.send_replace(ConnectionState::Failed);
        return ConnectionState::Failed;
    }
    state.send_replace(ConnectionState::Active);
    debug!("connection active as link {}", link_name);
    if notify_network {
        node.notify_network_modified();
    }

    let (read_half, write_half) = stream.into_split();
    let mut writer = tokio::spawn(write_loop(write_half, outgoing_receiver, link_name.to_string(), config.keepalive_interval, config.trace_frames));

    let result = select! {
        r = read_loop(read_half, initial_data, node, link_name, &link, config, stop) => r,
        r = &mut writer => match r {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        },
    };
    writer.abort();
    node.remove_link_if(link_name, &link);

    let final_state = match result {
        Ok(()) => ConnectionState::Closing,
        Err(e) if is_regular_close(&e) => {
            debug!("connection closed: {}", e);
            ConnectionState::Closing
        }
        Err(e) => {
            warn!("connection failed: {}", e);
            ConnectionState::Failed
        }
    };
    state.send_replace(final_state);
    final_state
}

/// Resets and similar 'peer went away' errors end a connection regularly rather than as a failure
fn is_regular_close(e: &anyhow::Error) -> bool {
    let io_error = match e.downcast_ref::<CluckError>() {
        Some(CluckError::Transport(io_error)) => Some(io_error),
        _ => e.downcast_ref::<std::io::Error>(),
    };

    io_error.is_some_and(|e| matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof))
}

/// Returns `Ok` when the connection ends regularly: the peer closed it, its keepalives expired,
///  or the connection was stopped locally
async fn read_loop(
    mut read_half: OwnedReadHalf,
    mut buf: BytesMut,
    node: &CluckNode,
    link_name: &str,
    link: &LinkRef,
    config: &TcpConfig,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut keepalive = KeepaliveMonitor::new(config.keepalive_timeout);

    loop {
        // nothing is routed after the transport was stopped, not even data that was received before
        if *stop.borrow() {
            debug!("connection stopped");
            return Ok(());
        }

        while let Some(frame) = Frame::try_decode(&mut buf, config.max_payload_len)? {
            let is_keepalive = frame.is_keepalive();
            if keepalive.on_frame_received(is_keepalive) {
                info!("detected keepalive message - expecting future keepalives on {}", link_name);
            }

            if config.trace_frames {
                trace_inbound(link_name, frame.target.as_deref(), frame.source.as_deref(), &frame.payload, is_keepalive);
            }
            dispatch_inbound(node, link_name, link, frame, config);

            if *stop.borrow() {
                debug!("connection stopped");
                return Ok(());
            }
        }

        select! {
            _ = stop.changed() => {
                debug!("connection stopped");
                return Ok(());
            }
            r = timeout(config.read_poll_timeout, read_half.read_buf(&mut buf)) => match r {
                Err(_) => {
                    if keepalive.is_expired() {
                        debug!("no frame received for {:?} - keepalive expired", config.keepalive_timeout);
                        return Ok(());
                    }
                }
                Ok(Ok(0)) => {
                    debug!("connection closed by peer");
                    return Ok(());
                }
                Ok(Ok(n)) => trace!("received {} bytes", n),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn dispatch_inbound(node: &CluckNode, link_name: &str, link: &LinkRef, frame: Frame, config: &TcpConfig) {
    let source = prepend_link(link_name, frame.source.as_deref());

    let started = Instant::now();
    node.transmit(frame.target.as_deref(), Some(&source), &frame.payload, Some(link));

    if config.trace_frames {
        let elapsed = started.elapsed();
        if elapsed > config.slow_dispatch_threshold {
            warn!("dispatching a message from {} to {:?} took {:?}: {}", source, frame.target, elapsed, describe_payload(&frame.payload));
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Frame>,
    link_name: String,
    keepalive_interval: Option<Duration>,
    trace_frames: bool,
) -> anyhow::Result<()> {
    let mut checksums = ChecksumSequence::new();
    let mut keepalive = keepalive_interval.map(|d| {
        let mut result = interval(d);
        result.set_missed_tick_behavior(MissedTickBehavior::Delay);
        result
    });
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let frame = select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
            _ = next_keepalive(&mut keepalive) => {
                if trace_frames {
                    trace_outbound_keepalive(&link_name);
                }
                Frame::keepalive()
            }
        };

        buf.clear();
        append_frame(&mut buf, &frame, &mut checksums);
        // everything else that is already queued goes out in the same write
        while let Ok(frame) = outgoing.try_recv() {
            append_frame(&mut buf, &frame, &mut checksums);
        }
        write_half.write_all(&buf).await?;
    }
}

fn append_frame(buf: &mut BytesMut, frame: &Frame, checksums: &mut ChecksumSequence) {
    if let Err(e) = frame.encode(checksums.next_base(), buf) {
        warn!("dropping frame to {:?} that can not be encoded: {}", frame.target, e);
    }
}

async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => { interval.tick().await; }
        None => std::future::pending().await,
    }
}
