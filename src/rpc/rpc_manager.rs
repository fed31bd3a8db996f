use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::CluckError;
use crate::node::{CluckNode, Link, LinkRef, RmtTag, BROADCAST_TARGET};

pub const DEFAULT_RPC_ENDPOINT: &str = "rpc-endpoint";
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingInvocation {
    issued_at: Instant,
    target: String,
    reply: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
struct PendingTable {
    next_id: u32,
    pending: FxHashMap<u32, PendingInvocation>,
}

/// Invokes remote procedures: a call sends `[INVOKE, args..]` to the procedure's path, with a
///  source path that is unique to the call. The reply `[INVOKE_REPLY, result..]` is sent back to
///  that source, which routes it to this manager's endpoint link.
///
/// There is one manager per node, see [CluckNode::get_rpc_manager].
pub struct RpcManager {
    myself: Weak<RpcManager>,
    node: Weak<CluckNode>,
    endpoint: String,
    default_timeout: Duration,
    pending: Mutex<PendingTable>,
}

impl RpcManager {
    /// Creates a manager; registering its [RpcManager::reply_link] on the node as `endpoint` is
    ///  the caller's responsibility
    pub fn new(node: Weak<CluckNode>, endpoint: &str) -> Arc<RpcManager> {
        Arc::new_cyclic(|myself| RpcManager {
            myself: myself.clone(),
            node,
            endpoint: endpoint.to_string(),
            default_timeout: DEFAULT_RPC_TIMEOUT,
            pending: Default::default(),
        })
    }

    /// The link that receives replies, to be registered at the manager's endpoint name
    pub fn reply_link(&self) -> LinkRef {
        Arc::new(ReplyLink {
            manager: self.myself.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn invoke_default(&self, target: &str, args: &[u8]) -> Result<Vec<u8>, CluckError> {
        self.invoke(target, args, self.default_timeout).await
    }

    /// Calls the procedure at `target` and waits for its reply.
    ///
    /// A call that is not answered within `timeout` fails with [CluckError::Timeout], and
    ///  replies arriving afterwards are discarded. That includes calls to targets that do not
    ///  exist: the negative ack they trigger is logged, but not reported as a separate error.
    pub async fn invoke(&self, target: &str, args: &[u8], timeout: Duration) -> Result<Vec<u8>, CluckError> {
        let node = self.node.upgrade()
            .ok_or(CluckError::NodeDropped)?;

        let (reply, reply_receiver) = oneshot::channel();
        let id = self.register(target, reply);
        let _guard = PendingGuard { manager: self, id };

        let source = format!("{}/{:08x}", self.endpoint, id);
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(RmtTag::Invoke.into());
        payload.extend_from_slice(args);

        trace!("invoking {} as {}", target, source);
        node.transmit(Some(target), Some(&source), &payload, None);
        drop(node);

        match tokio::time::timeout(timeout, reply_receiver).await {
            Ok(Ok(result)) => Ok(result),
            // the entry is only ever removed without replying when the invocation ends
            Ok(Err(_)) => Err(CluckError::NodeDropped),
            Err(_) => {
                debug!("invocation {:08x} of {} timed out", id, target);
                Err(CluckError::Timeout { target: target.to_string(), timeout })
            }
        }
    }

    pub fn num_pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Assigns an id that is not used by any pending invocation
    fn register(&self, target: &str, reply: oneshot::Sender<Vec<u8>>) -> u32 {
        let mut table = self.lock();

        let mut id = table.next_id;
        while table.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        table.next_id = id.wrapping_add(1);

        table.pending.insert(id, PendingInvocation {
            issued_at: Instant::now(),
            target: target.to_string(),
            reply,
        });
        id
    }

    fn on_message(&self, id_path: Option<&str>, source: Option<&str>, payload: &[u8]) {
        let id_path = match id_path {
            None => {
                debug!("ignoring message to the RPC endpoint itself from {:?}", source);
                return;
            }
            Some(BROADCAST_TARGET) => return,
            Some(p) => p,
        };

        let id = match parse_id(id_path) {
            Some(id) => id,
            None => {
                debug!("ignoring message for malformed invocation id {:?}", id_path);
                return;
            }
        };

        match RmtTag::of(payload) {
            Some(RmtTag::InvokeReply) => {
                // removal under the lock guarantees that only one reply is delivered
                let pending = self.lock().pending.remove(&id);
                match pending {
                    Some(invocation) => {
                        trace!("reply for invocation {:08x} of {} after {:?}", id, invocation.target, invocation.issued_at.elapsed());
                        if invocation.reply.send(payload[1..].to_vec()).is_err() {
                            debug!("invocation {:08x} was abandoned before its reply arrived", id);
                        }
                    }
                    None => debug!("discarding reply for unknown or expired invocation {:08x} from {:?}", id, source),
                }
            }
            Some(RmtTag::NegativeAck) => {
                if let Some(invocation) = self.lock().pending.get(&id) {
                    warn!("invocation {:08x} could not be delivered to {} (reported by {:?})", id, invocation.target, source);
                }
            }
            _ => warn!("unexpected message for invocation {:08x} from {:?}: {}", id, source,
                payload.first().map(|&tag| RmtTag::describe(tag)).unwrap_or_else(|| "EMPTY".to_string())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// ids are always sent as eight hex digits
fn parse_id(s: &str) -> Option<u32> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// removes an invocation's entry when the invocation ends, however it ends
struct PendingGuard<'a> {
    manager: &'a RpcManager,
    id: u32,
}
impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.lock().pending.remove(&self.id);
    }
}

struct ReplyLink {
    manager: Weak<RpcManager>,
}
impl Link for ReplyLink {
    fn send(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> bool {
        match self.manager.upgrade() {
            Some(manager) => {
                manager.on_message(target, source, payload);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::time::sleep;
    use crate::test_util::recording_link::{RecordedMessage, RecordingLink};
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[rstest]
    #[case::valid("0000002a", Some(0x2a))]
    #[case::upper_case("DEADBEEF", Some(0xdeadbeef))]
    #[case::too_short("2a", None)]
    #[case::sign("+0000002", None)]
    #[case::not_hex("0000002g", None)]
    #[case::nested("0000002a/x", None)]
    fn test_parse_id(#[case] s: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_id(s), expected);
    }

    #[test]
    fn test_register_skips_pending_ids() {
        let manager = RpcManager::new(Weak::new(), DEFAULT_RPC_ENDPOINT);
        manager.lock().next_id = u32::MAX;

        assert_eq!(manager.register("a", oneshot::channel().0), u32::MAX);
        assert_eq!(manager.register("a", oneshot::channel().0), 0);

        manager.lock().next_id = u32::MAX;
        assert_eq!(manager.register("a", oneshot::channel().0), 1);
        assert_eq!(manager.num_pending(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_sends_call_and_resolves_reply() {
        let node = CluckNode::new();
        let procedure = RecordingLink::new();
        node.add_link(procedure.clone(), "robot").unwrap();
        let manager = node.get_rpc_manager();

        let call = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.invoke("robot/calc", &[1, 2], WAIT).await })
        };

        let received = procedure.wait_for_messages(1, WAIT).await;
        assert_eq!(received, vec![RecordedMessage::new(Some("calc"), Some("rpc-endpoint/00000000"), &[13, 1, 2])]);

        node.transmit(Some("rpc-endpoint/00000000"), Some("robot/calc"), &[14, 9, 8], None);
        assert_eq!(call.await.unwrap().unwrap(), vec![9, 8]);
        assert_eq!(manager.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_reply_does_not_resolve() {
        let node = CluckNode::new();
        let procedure = RecordingLink::new();
        node.add_link(procedure.clone(), "robot").unwrap();
        let manager = node.get_rpc_manager();

        let call = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.invoke("robot", &[], WAIT).await })
        };
        procedure.wait_for_messages(1, WAIT).await;

        node.transmit(Some("rpc-endpoint/00000001"), None, &[14, 1], None);
        node.transmit(Some("rpc-endpoint/*"), None, &[14, 1], None);
        node.transmit(Some("rpc-endpoint"), None, &[14, 1], None);
        node.transmit(Some("*"), None, &[14, 1], None);
        // wrong tag for the right id
        node.transmit(Some("rpc-endpoint/00000000"), None, &[1, 1], None);

        assert!(matches!(call.await.unwrap(), Err(CluckError::Timeout { target, timeout }) if target == "robot" && timeout == WAIT));
        assert_eq!(manager.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_resolves_at_most_once() {
        let node = CluckNode::new();
        let procedure = RecordingLink::new();
        node.add_link(procedure.clone(), "robot").unwrap();
        let manager = node.get_rpc_manager();

        let call = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.invoke("robot", &[], WAIT).await })
        };
        procedure.wait_for_messages(1, WAIT).await;

        node.transmit(Some("rpc-endpoint/00000000"), None, &[14, 1], None);
        node.transmit(Some("rpc-endpoint/00000000"), None, &[14, 2], None);
        assert_eq!(call.await.unwrap().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_discarded() {
        let node = CluckNode::new();
        node.add_link(RecordingLink::new(), "robot").unwrap();
        let manager = node.get_rpc_manager();

        assert!(matches!(manager.invoke("robot", &[], Duration::from_millis(100)).await, Err(CluckError::Timeout { .. })));
        assert_eq!(manager.num_pending(), 0);

        node.transmit(Some("rpc-endpoint/00000000"), None, &[14, 1], None);
        assert_eq!(manager.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_times_out() {
        let node = CluckNode::new();
        let manager = node.get_rpc_manager();

        // the negative ack for the missing link reaches the manager, but does not end the call
        let started = Instant::now();
        assert!(matches!(manager.invoke("nowhere/calc", &[1], Duration::from_millis(300)).await, Err(CluckError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_invocation_is_cleaned_up() {
        let node = CluckNode::new();
        node.add_link(RecordingLink::new(), "robot").unwrap();
        let manager = node.get_rpc_manager();

        let call = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.invoke("robot", &[], Duration::from_secs(100)).await })
        };
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.num_pending(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(manager.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_invoke_after_node_was_dropped() {
        let node = CluckNode::new();
        let manager = node.get_rpc_manager();
        drop(node);

        assert!(matches!(manager.invoke_default("robot", &[]).await, Err(CluckError::NodeDropped)));
    }

    #[test]
    fn test_default_timeout() {
        let node = CluckNode::new();
        assert_eq!(node.get_rpc_manager().default_timeout(), Duration::from_secs(5));
        assert_eq!(node.get_rpc_manager().endpoint(), "rpc-endpoint");
    }
}
