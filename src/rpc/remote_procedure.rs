use std::sync::{Arc, Weak};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::error::CluckError;
use crate::node::{CluckNode, Link, RmtTag, BROADCAST_TARGET};

/// A procedure that can be invoked through the bus, see [publish_procedure]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteProcedure: Send + Sync + 'static {
    async fn invoke(&self, args: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// Makes `procedure` available on the node as `name`.
///
/// Each invocation runs in a separate task on the current tokio runtime, and its result is sent
///  back to the invoking source. A procedure returning an error is logged, and no reply is sent:
///  the caller sees a timeout.
pub fn publish_procedure(node: &Arc<CluckNode>, name: &str, procedure: Arc<dyn RemoteProcedure>) -> Result<(), CluckError> {
    let runtime = Handle::try_current()
        .map_err(|e| CluckError::Runtime(e.to_string()))?;

    node.add_link(Arc::new(ProcedureLink {
        node: Arc::downgrade(node),
        name: name.to_string(),
        procedure,
        runtime,
    }), name)
}

struct ProcedureLink {
    node: Weak<CluckNode>,
    name: String,
    procedure: Arc<dyn RemoteProcedure>,
    runtime: Handle,
}

impl Link for ProcedureLink {
    fn send(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> bool {
        if target == Some(BROADCAST_TARGET) {
            return true;
        }
        if RmtTag::of(payload) != Some(RmtTag::Invoke) {
            debug!("procedure {} ignoring non-invocation message from {:?}", self.name, source);
            return true;
        }
        let reply_to = match source {
            Some(s) => s.to_string(),
            None => {
                warn!("invocation of {} without a source - there is nowhere to send the result", self.name);
                return true;
            }
        };

        let node = self.node.clone();
        let name = self.name.clone();
        let procedure = self.procedure.clone();
        let args = payload[1..].to_vec();
        self.runtime.spawn(async move {
            trace!("invoking procedure {} for {}", name, reply_to);
            match procedure.invoke(args).await {
                Ok(result) => {
                    let Some(node) = node.upgrade() else {
                        return;
                    };
                    let mut reply = Vec::with_capacity(result.len() + 1);
                    reply.push(RmtTag::InvokeReply.into());
                    reply.extend_from_slice(&result);
                    node.transmit(Some(&reply_to), Some(&name), &reply, None);
                }
                Err(e) => warn!("procedure {} failed for {}: {}", name, reply_to, e),
            }
        });
        true
    }
}
