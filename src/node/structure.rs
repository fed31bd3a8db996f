use crate::node::link::Link;
use crate::node::rmt::RmtTag;
use crate::node::BROADCAST_TARGET;

/// The link that [crate::node::CluckNode::subscribe_to_structure_notifications] registers: it
///  reacts to a broadcast `[NOTIFY]` message and ignores everything else.
pub struct StructureNotificationLink {
    callback: Box<dyn Fn() + Send + Sync>,
}

impl StructureNotificationLink {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> StructureNotificationLink {
        StructureNotificationLink {
            callback: Box::new(callback),
        }
    }
}

impl Link for StructureNotificationLink {
    fn send(&self, target: Option<&str>, _source: Option<&str>, payload: &[u8]) -> bool {
        if target == Some(BROADCAST_TARGET) && payload == [u8::from(RmtTag::Notify)] {
            (self.callback)();
        }
        true
    }
}
