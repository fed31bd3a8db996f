use tracing::{trace, Level};

use crate::node::{Link, LinkRef, RmtTag};

/// Wraps a link, logging every message sent through it at TRACE level
pub struct TracingLink {
    link_name: String,
    inner: LinkRef,
}

impl TracingLink {
    pub fn new(link_name: &str, inner: LinkRef) -> TracingLink {
        TracingLink {
            link_name: link_name.to_string(),
            inner,
        }
    }
}

impl Link for TracingLink {
    fn send(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> bool {
        if tracing::enabled!(Level::TRACE) {
            trace!("[LOCAL] SEND {} -> {}: {}", path_or_null(source), outbound_path(&self.link_name, target), describe_payload(payload));
        }
        self.inner.send(target, source, payload)
    }
}

/// Logs an inbound frame at TRACE level. Keepalives are logged by tag only.
pub fn trace_inbound(link_name: &str, target: Option<&str>, source: Option<&str>, payload: &[u8], is_keepalive: bool) {
    if !tracing::enabled!(Level::TRACE) {
        return;
    }
    if is_keepalive {
        trace!("[{}] RECV keepalive", link_name);
    }
    else {
        trace!("[{}] RECV {} -> {}: {}", link_name, path_or_null(source), path_or_null(target), describe_payload(payload));
    }
}

pub fn trace_outbound_keepalive(link_name: &str) {
    trace!("[{}] SEND keepalive", link_name);
}

/// The payload's tag name and size, with the rest of the payload as hex
pub fn describe_payload(payload: &[u8]) -> String {
    let size = match payload.len() {
        1 => "1 byte".to_string(),
        n => format!("{} bytes", n),
    };
    match payload.split_first() {
        None => "EMPTY".to_string(),
        Some((&tag, [])) => format!("{} ({})", RmtTag::describe(tag), size),
        Some((&tag, rest)) => format!("{} <{}> ({})", RmtTag::describe(tag), hex::encode(rest), size),
    }
}

fn path_or_null(path: Option<&str>) -> &str {
    path.unwrap_or("null")
}

/// The path a message takes from the local node: the link, followed by the target within the
///  remote node if there is one
fn outbound_path(link_name: &str, target: Option<&str>) -> String {
    match target {
        Some(target) => format!("{}/{}", link_name, target),
        None => link_name.to_string(),
    }
}
