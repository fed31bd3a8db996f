use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use cluck::node::CluckNode;
use cluck::rpc::{publish_procedure, RemoteProcedure};
use cluck::tcp::{TcpClient, TcpConfig, TcpServer, PORT_PRIMARY};
use tokio::select;
use tracing::{info, Level};

/// Runs a node that accepts connections and / or connects to other nodes, relaying messages
///  between them
#[derive(Parser)]
struct Args {
    /// address to accept connections on, e.g. `0.0.0.0:1540`
    #[clap(long)]
    listen: Option<String>,

    /// remote nodes to connect to, as `<link name>=<host>[:<port>]`
    #[clap(long)]
    connect: Vec<String>,

    /// the name this node asks remote nodes to register it as
    #[clap(long)]
    name: Option<String>,

    #[clap(long, default_value_t = false)]
    trace_frames: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct Echo;

#[async_trait]
impl RemoteProcedure for Echo {
    async fn invoke(&self, args: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(args)
    }
}

fn config(args: &Args) -> TcpConfig {
    if args.trace_frames {
        TcpConfig::tracing()
    }
    else {
        TcpConfig::default()
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.listen.is_none() && args.connect.is_empty() {
        return Err(anyhow!("nothing to do: neither --listen nor --connect was specified"));
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let node = CluckNode::new();
    publish_procedure(&node, "echo", Arc::new(Echo))?;
    {
        let weak_node = Arc::downgrade(&node);
        node.subscribe_to_structure_notifications("structure-log", move || {
            if let Some(node) = weak_node.upgrade() {
                info!("network structure changed - local links: {:?}", node.link_names());
            }
        })?;
    }

    let mut clients = Vec::new();
    for spec in &args.connect {
        let (link_name, remote) = spec.split_once('=')
            .ok_or_else(|| anyhow!("expected <link name>=<address>, was {:?}", spec))?;
        let remote = if remote.contains(':') {
            remote.to_string()
        }
        else {
            format!("{}:{}", remote, PORT_PRIMARY)
        };
        clients.push(TcpClient::start(node.clone(), &remote, link_name, args.name.as_deref(), config(&args))?);
    }

    let server = match &args.listen {
        Some(addr) => Some(TcpServer::bind(node.clone(), addr.as_str(), config(&args)).await?),
        None => None,
    };

    select! {
        result = run_server(server.as_ref()) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    for client in clients {
        client.stop();
        client.join().await;
    }
    Ok(())
}

async fn run_server(server: Option<&TcpServer>) -> anyhow::Result<()> {
    match server {
        Some(server) => server.run().await,
        None => std::future::pending().await,
    }
}
