//! The TCP wire protocol: handshake headers, checksummed frames and the keepalive convention.

pub mod checksum;
pub mod frame;
pub mod handshake;
pub mod keepalive;

pub use frame::Frame;

/// The source path a message gets when it arrives through the link named `link_name`, so that
///  replies are routed back through the same link
pub fn prepend_link(link_name: &str, source: Option<&str>) -> String {
    match source {
        Some(source) => format!("{}/{}", link_name, source),
        None => link_name.to_string(),
    }
}
