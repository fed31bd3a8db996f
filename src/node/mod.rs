//! In-process routing: the [CluckNode] and the [Link] abstraction it routes through.

pub mod cluck_node;
pub mod link;
pub mod missing_link;
pub mod rmt;
pub mod structure;

pub use cluck_node::CluckNode;
pub use link::{Link, LinkRef};
pub use rmt::RmtTag;

/// Target (and, on the receiving side, suffix) of broadcast messages
pub const BROADCAST_TARGET: &str = "*";

/// Source of network modification notifications
pub const MODIFICATION_SOURCE: &str = "#modsrc";
