//! Request / reply on top of the node's fire-and-forget messaging.

pub mod remote_procedure;
pub mod rpc_manager;

pub use remote_procedure::{publish_procedure, RemoteProcedure};
pub use rpc_manager::RpcManager;
