use std::sync::Arc;

use crate::node::BROADCAST_TARGET;

/// A [Link] is a named, directed endpoint in a [crate::node::CluckNode]'s link table. Sending to
///  a path routes through the link named by the path's first segment, handing it the rest of the
///  path as `target`.
///
/// `send` returns whether the link should stay registered: `false` means the link has become
///  permanently unusable (e.g. its connection is gone), and the node removes it. Ordinary
///  transport problems are never signalled by panicking - a panic is treated as a bug in the
///  link, logged, and counted as a failure to deliver that one message.
///
/// Implementations are called synchronously from routing code running on arbitrary threads, so
///  `send` must not block for any significant amount of time.
pub trait Link: Send + Sync + 'static {
    fn send(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> bool;
}

pub type LinkRef = Arc<dyn Link>;

/// Link names are single path segments, and `*` is reserved for broadcasts
pub fn is_valid_link_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != BROADCAST_TARGET
}

/// Links are compared by identity rather than by value. Only the data pointer is compared, vtable
///  pointers for the same type are not guaranteed to be unique.
pub fn is_same_link(a: &LinkRef, b: &LinkRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
