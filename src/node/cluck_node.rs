use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, warn};

use crate::error::CluckError;
use crate::node::link::{is_same_link, is_valid_link_name, LinkRef};
use crate::node::missing_link::MissingLinkReporter;
use crate::node::rmt::RmtTag;
use crate::node::structure::StructureNotificationLink;
use crate::node::{BROADCAST_TARGET, MODIFICATION_SOURCE};
use crate::rpc::rpc_manager::{RpcManager, DEFAULT_RPC_ENDPOINT};
use crate::util::atomic_map::AtomicMap;

/// The routing hub of a process: it owns the table of named [crate::node::Link]s and delivers
///  messages to them, either directly by path or as a broadcast to all links.
///
/// There is meant to be one node per process, created once at startup and handed to everything
///  that needs bus access. All operations are safe to call concurrently from any thread; routing
///  is synchronous and never holds a lock while a link handles a message, so links may send
///  further messages (or modify the link table) from inside `send`.
pub struct CluckNode {
    myself: Weak<CluckNode>,
    links: AtomicMap<String, LinkRef>,
    missing_links: MissingLinkReporter,
    rpc_manager: OnceLock<Arc<RpcManager>>,
}

impl CluckNode {
    pub fn new() -> Arc<CluckNode> {
        Arc::new_cyclic(|myself| CluckNode {
            myself: myself.clone(),
            links: AtomicMap::new(),
            missing_links: MissingLinkReporter::default(),
            rpc_manager: OnceLock::new(),
        })
    }

    /// Binds `link` to `name`. Binding the same link instance to the same name a second time is
    ///  a no-op.
    pub fn add_link(&self, link: LinkRef, name: &str) -> Result<(), CluckError> {
        check_link_name(name)?;

        self.links.update(|links| {
            match links.get(name) {
                Some(prev) if is_same_link(prev, &link) => Ok(()),
                Some(_) => Err(CluckError::DuplicateName(name.to_string())),
                None => {
                    links.insert(name.to_string(), link);
                    Ok(())
                }
            }
        })
    }

    /// Binds `link` to `name`, replacing any link that was bound to it before - this is how
    ///  transports re-register after reconnecting
    pub fn add_or_replace_link(&self, link: LinkRef, name: &str) -> Result<(), CluckError> {
        check_link_name(name)?;

        if self.links.update(|links| links.insert(name.to_string(), link)).is_some() {
            debug!("replaced current link on: {}", name);
        }
        Ok(())
    }

    pub fn remove_link(&self, name: &str) -> bool {
        self.links.update(|links| links.remove(name))
            .is_some()
    }

    /// Removes the binding for `name` only if it is bound to this exact link instance, leaving a
    ///  replacement that was registered in the meantime untouched
    pub fn remove_link_if(&self, name: &str, link: &LinkRef) -> bool {
        self.links.update(|links| {
            match links.get(name) {
                Some(current) if is_same_link(current, link) => {
                    links.remove(name);
                    true
                }
                _ => false,
            }
        })
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.get(name).is_some()
    }

    pub fn link_names(&self) -> Vec<String> {
        let mut result = self.links.load()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn link_name_of(&self, link: &LinkRef) -> Option<String> {
        self.links.load()
            .iter()
            .find(|(_, l)| is_same_link(l, link))
            .map(|(name, _)| name.clone())
    }

    /// Sends a message to `target`, a `/`-separated path relative to this node, with `source` as
    ///  the return path. The first path segment selects the link, which receives the rest of the
    ///  path as its target.
    ///
    /// A target of `*` broadcasts to all links except `deny_link`, which is how transports
    ///  avoid echoing a broadcast back to where it came from.
    pub fn transmit(&self, target: Option<&str>, source: Option<&str>, payload: &[u8], deny_link: Option<&LinkRef>) {
        let target = match target {
            None => {
                if !RmtTag::is_negative_ack(payload) {
                    warn!("received message addressed to unreceiving node (source: {:?})", source);
                }
                return;
            }
            Some(t) => t,
        };

        if target == BROADCAST_TARGET {
            self.broadcast(source, payload, deny_link);
            return;
        }

        let (direct, indirect) = match target.split_once('/') {
            Some((direct, indirect)) => (direct, Some(indirect)),
            None => (target, None),
        };

        match self.links.get(direct) {
            None => self.report_missing_link(target, direct, source, payload),
            Some(link) => {
                if dispatch(direct, &link, indirect, source, payload) == Some(false) {
                    debug!("link {} asked to be removed", direct);
                    self.remove_link_if(direct, &link);
                }
            }
        }
    }

    /// Sends a message to every link except `deny_link`, with target `*`.
    ///
    /// Iterates over a snapshot of the link table: links added during the broadcast do not
    ///  receive it, links removed during the broadcast still do, and every link receives it at
    ///  most once.
    pub fn broadcast(&self, source: Option<&str>, payload: &[u8], deny_link: Option<&LinkRef>) {
        let snapshot = self.links.load();
        for (name, link) in snapshot.iter() {
            if deny_link.is_some_and(|deny| is_same_link(deny, link)) {
                continue;
            }

            if dispatch(name, link, Some(BROADCAST_TARGET), source, payload) == Some(false) {
                debug!("link {} asked to be removed during broadcast", name);
                self.remove_link_if(name, link);
            }
        }
    }

    /// Tells everyone on the network that its structure changed (e.g. a connection was opened),
    ///  prompting them to re-discover what is reachable
    pub fn notify_network_modified(&self) {
        self.transmit(Some(BROADCAST_TARGET), Some(MODIFICATION_SOURCE), &[RmtTag::Notify.into()], None);
    }

    pub fn subscribe_to_structure_notifications(&self, name: &str, callback: impl Fn() + Send + Sync + 'static) -> Result<(), CluckError> {
        self.add_link(Arc::new(StructureNotificationLink::new(callback)), name)
    }

    /// The node's RPC manager, created and registered on first use
    pub fn get_rpc_manager(&self) -> Arc<RpcManager> {
        self.rpc_manager
            .get_or_init(|| {
                debug!("creating RPC manager at {}", DEFAULT_RPC_ENDPOINT);
                let manager = RpcManager::new(self.myself.clone(), DEFAULT_RPC_ENDPOINT);
                if self.links.update(|links| links.insert(DEFAULT_RPC_ENDPOINT.to_string(), manager.reply_link())).is_some() {
                    warn!("RPC manager replaced a link at {}", DEFAULT_RPC_ENDPOINT);
                }
                manager
            })
            .clone()
    }

    fn report_missing_link(&self, target: &str, direct: &str, source: Option<&str>, payload: &[u8]) {
        if self.missing_links.should_report(target, direct, payload) {
            warn!("no link for {} ({}) from {:?}", target, direct, source);
            self.transmit(source, Some(target), &[RmtTag::NegativeAck.into()], None);
        }
    }
}

fn check_link_name(name: &str) -> Result<(), CluckError> {
    if !is_valid_link_name(name) {
        return Err(CluckError::InvalidLinkName(name.to_string()));
    }
    Ok(())
}

/// Returns the link's verdict on whether it should stay registered, or `None` if it panicked
fn dispatch(name: &str, link: &LinkRef, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> Option<bool> {
    match catch_unwind(AssertUnwindSafe(|| link.send(target, source, payload))) {
        Ok(keep) => Some(keep),
        Err(panic) => {
            error!("error while dispatching to link {} (target {:?}): {}", name, target, panic_message(panic.as_ref()));
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    }
    else if let Some(s) = panic.downcast_ref::<String>() {
        s
    }
    else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::time::advance;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use crate::node::link::Link;
    use crate::test_util::recording_link::{RecordedMessage, RecordingLink};
    use super::*;

    struct PanickingLink;
    impl Link for PanickingLink {
        fn send(&self, _target: Option<&str>, _source: Option<&str>, _payload: &[u8]) -> bool {
            panic!("this link is broken");
        }
    }

    /// adds and removes links on its node while handling a message
    struct MutatingLink {
        node: Weak<CluckNode>,
        to_add: Arc<RecordingLink>,
    }
    impl Link for MutatingLink {
        fn send(&self, _target: Option<&str>, _source: Option<&str>, _payload: &[u8]) -> bool {
            if let Some(node) = self.node.upgrade() {
                node.add_or_replace_link(self.to_add.clone(), "late").unwrap();
                node.remove_link("b");
            }
            true
        }
    }

    #[rstest]
    #[case::single_segment("a", None)]
    #[case::two_segments("a/sub1", Some("sub1"))]
    #[case::deep_path("a/b/c/d", Some("b/c/d"))]
    #[case::trailing_slash("a/", Some(""))]
    fn test_transmit_direct(#[case] target: &str, #[case] expected_suffix: Option<&str>) {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        let b = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();
        node.add_link(b.clone(), "b").unwrap();

        node.transmit(Some(target), Some("src"), &[7, 1], None);

        assert_eq!(a.take_received(), vec![RecordedMessage::new(expected_suffix, Some("src"), &[7, 1])]);
        b.assert_nothing_received();
    }

    #[test]
    fn test_transmit_preserves_absent_source() {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();

        node.transmit(Some("a/x"), None, &[0], None);

        a.assert_received(Some("x"), None, &[0]);
    }

    #[test]
    fn test_add_link_duplicate_name() {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();

        // the same instance again is fine
        node.add_link(a.clone(), "a").unwrap();

        let other = RecordingLink::new();
        assert!(matches!(node.add_link(other.clone(), "a"), Err(CluckError::DuplicateName(n)) if n == "a"));

        node.transmit(Some("a"), None, &[1], None);
        a.assert_received(None, None, &[1]);
        other.assert_nothing_received();
    }

    #[rstest]
    #[case::empty("")]
    #[case::slash("a/b")]
    #[case::broadcast("*")]
    fn test_add_link_invalid_name(#[case] name: &str) {
        let node = CluckNode::new();
        assert!(matches!(node.add_link(RecordingLink::new(), name), Err(CluckError::InvalidLinkName(_))));
        assert!(matches!(node.add_or_replace_link(RecordingLink::new(), name), Err(CluckError::InvalidLinkName(_))));
        assert!(node.link_names().is_empty());
    }

    #[test]
    fn test_add_or_replace_link() {
        let node = CluckNode::new();
        let first = RecordingLink::new();
        let second = RecordingLink::new();
        node.add_or_replace_link(first.clone(), "peer").unwrap();
        node.add_or_replace_link(second.clone(), "peer").unwrap();

        node.transmit(Some("peer"), None, &[1], None);

        first.assert_nothing_received();
        second.assert_received(None, None, &[1]);
    }

    #[test]
    fn test_remove_link() {
        let node = CluckNode::new();
        node.add_link(RecordingLink::new(), "a").unwrap();

        assert!(node.remove_link("a"));
        assert!(!node.remove_link("a"));
        assert!(!node.has_link("a"));
    }

    #[test]
    fn test_remove_link_if_keeps_replacement() {
        let node = CluckNode::new();
        let old: LinkRef = RecordingLink::new();
        let new: LinkRef = RecordingLink::new();
        node.add_or_replace_link(old.clone(), "peer").unwrap();
        node.add_or_replace_link(new.clone(), "peer").unwrap();

        assert!(!node.remove_link_if("peer", &old));
        assert!(node.has_link("peer"));
        assert!(node.remove_link_if("peer", &new));
        assert!(!node.has_link("peer"));
    }

    #[test]
    fn test_link_name_of() {
        let node = CluckNode::new();
        let a: LinkRef = RecordingLink::new();
        let unbound: LinkRef = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();

        assert_eq!(node.link_name_of(&a), Some("a".to_string()));
        assert_eq!(node.link_name_of(&unbound), None);
    }

    #[test]
    fn test_link_returning_false_is_removed() {
        let node = CluckNode::new();
        let dead = RecordingLink::failing();
        node.add_link(dead.clone(), "dead").unwrap();

        node.transmit(Some("dead/x"), Some("src"), &[1], None);

        dead.assert_received(Some("x"), Some("src"), &[1]);
        assert!(!node.has_link("dead"));
    }

    #[test]
    fn test_panicking_link_stays_registered() {
        let node = CluckNode::new();
        node.add_link(Arc::new(PanickingLink), "broken").unwrap();

        node.transmit(Some("broken"), Some("src"), &[1], None);
        assert!(node.has_link("broken"));
    }

    #[test]
    fn test_broadcast_skips_deny_link() {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        let b = RecordingLink::new();
        let c = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();
        node.add_link(b.clone(), "b").unwrap();
        node.add_link(c.clone(), "c").unwrap();

        let deny: LinkRef = b.clone();
        node.transmit(Some("*"), Some("src"), &[12], Some(&deny));

        a.assert_received(Some("*"), Some("src"), &[12]);
        b.assert_nothing_received();
        c.assert_received(Some("*"), Some("src"), &[12]);
    }

    #[test]
    fn test_deny_link_does_not_affect_direct_delivery() {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();

        let deny: LinkRef = a.clone();
        node.transmit(Some("a"), Some("src"), &[1], Some(&deny));
        a.assert_received(None, Some("src"), &[1]);
    }

    #[test]
    fn test_broadcast_survives_panicking_and_dead_links() {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        let dead = RecordingLink::failing();
        let z = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();
        node.add_link(Arc::new(PanickingLink), "broken").unwrap();
        node.add_link(dead.clone(), "dead").unwrap();
        node.add_link(z.clone(), "z").unwrap();

        node.broadcast(Some("src"), &[1], None);

        a.assert_received(Some("*"), Some("src"), &[1]);
        dead.assert_received(Some("*"), Some("src"), &[1]);
        z.assert_received(Some("*"), Some("src"), &[1]);
        assert_eq!(node.link_names(), vec!["a".to_string(), "broken".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_broadcast_tolerates_modification_during_iteration() {
        let node = CluckNode::new();
        let b = RecordingLink::new();
        let late = RecordingLink::new();
        node.add_link(Arc::new(MutatingLink { node: Arc::downgrade(&node), to_add: late.clone() }), "a").unwrap();
        node.add_link(b.clone(), "b").unwrap();

        node.broadcast(Some("src"), &[1], None);

        // 'b' was part of the snapshot, 'late' was not
        assert_eq!(b.take_received().len(), 1);
        late.assert_nothing_received();
        assert!(!node.has_link("b"));
        assert!(node.has_link("late"));
    }

    #[test]
    fn test_concurrent_broadcast_delivers_exactly_once() {
        let node = CluckNode::new();
        let stable = (0..4)
            .map(|i| {
                let link = RecordingLink::new();
                node.add_link(link.clone(), &format!("stable-{}", i)).unwrap();
                link
            })
            .collect::<Vec<_>>();

        let done = Arc::new(AtomicBool::new(false));
        let churn = {
            let node = node.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut i = 0usize;
                while !done.load(Ordering::Acquire) {
                    let name = format!("churn-{}", i % 8);
                    node.add_or_replace_link(RecordingLink::new(), &name).unwrap();
                    node.remove_link(&format!("churn-{}", (i + 3) % 8));
                    i += 1;
                }
            })
        };

        for _ in 0..500 {
            node.broadcast(Some("src"), &[1], None);
        }
        done.store(true, Ordering::Release);
        churn.join().unwrap();

        for link in stable {
            assert_eq!(link.take_received().len(), 500);
        }
    }

    #[test]
    fn test_absent_target_is_not_routed() {
        let node = CluckNode::new();
        let a = RecordingLink::new();
        node.add_link(a.clone(), "a").unwrap();

        node.transmit(None, Some("src"), &[1], None);
        node.transmit(None, Some("src"), &[RmtTag::NegativeAck.into()], None);

        a.assert_nothing_received();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_link_sends_single_negative_ack() {
        let node = CluckNode::new();
        let src = RecordingLink::new();
        node.add_link(src.clone(), "src").unwrap();
        node.transmit(Some("foo"), Some("src/reply"), &[0x00], None);

        assert_eq!(src.take_received(), vec![RecordedMessage::new(Some("reply"), Some("foo"), &[RmtTag::NegativeAck.into()])]);
    }

    /// counts WARN events
    struct WarnCounter(Arc<AtomicUsize>);
    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_ack_for_missing_source_is_not_reported() {
        let node = CluckNode::new();
        let num_warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(num_warnings.clone()));

        tracing::subscriber::with_default(subscriber, || {
            // there is no link at "src" either, so the negative ack goes nowhere and is not
            //  reported in turn
            node.transmit(Some("foo"), Some("src"), &[0x00], None);
            assert_eq!(num_warnings.load(Ordering::SeqCst), 1);

            node.transmit(Some("foo"), Some("src"), &[0x00], None);
            assert_eq!(num_warnings.load(Ordering::SeqCst), 1);
        });
        assert!(node.link_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_link_reports_are_rate_limited() {
        let node = CluckNode::new();
        let src = RecordingLink::new();
        node.add_link(src.clone(), "src").unwrap();

        node.transmit(Some("foo"), Some("src"), &[0], None);
        node.transmit(Some("foo/x"), Some("src"), &[0], None);
        assert_eq!(src.take_received().len(), 1);

        node.transmit(Some("bar"), Some("src"), &[0], None);
        assert_eq!(src.take_received().len(), 1);

        advance(Duration::from_millis(1000)).await;
        node.transmit(Some("bar"), Some("src"), &[0], None);
        assert_eq!(src.take_received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_link_ignores_negative_acks_and_research_paths() {
        let node = CluckNode::new();
        let src = RecordingLink::new();
        node.add_link(src.clone(), "src").unwrap();

        node.transmit(Some("foo"), Some("src"), &[RmtTag::NegativeAck.into()], None);
        node.transmit(Some("foo/rsch-abc"), Some("src"), &[0], None);
        src.assert_nothing_received();
    }

    #[test]
    fn test_structure_notifications() {
        let node = CluckNode::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            node.subscribe_to_structure_notifications("watcher", move || { counter.fetch_add(1, Ordering::SeqCst); }).unwrap();
        }
        let other = RecordingLink::new();
        node.add_link(other.clone(), "other").unwrap();

        node.notify_network_modified();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        other.assert_received(Some("*"), Some(MODIFICATION_SOURCE), &[RmtTag::Notify.into()]);

        // direct messages and other broadcasts are ignored
        node.transmit(Some("watcher"), Some("src"), &[RmtTag::Notify.into()], None);
        node.broadcast(Some("src"), &[RmtTag::Ping.into()], None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rpc_manager_is_cached() {
        let node = CluckNode::new();
        let first = node.get_rpc_manager();
        let second = node.get_rpc_manager();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(node.has_link(DEFAULT_RPC_ENDPOINT));
    }
}
