// wintree-node daemon: joins the window tree and relays commands typed on stdin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wintree_core::{Content, MessageCode, WindowId, WindowInfo, WindowMessage};
use wintree_node::{config, logging, Node, NodeEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Windows seen so far, for resolving ids typed by the user.
type Directory = Arc<Mutex<HashMap<WindowId, WindowInfo>>>;

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("wintree-node {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    logging::init(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let (node, events) = Node::new(cfg.node_settings());
    info!(window = %node.me(), version = VERSION, "starting");
    let directory: Directory = Arc::default();
    tokio::spawn(log_events(events, directory.clone()));

    if let Some(port) = cfg.listen_port {
        node.listen(port)
            .await
            .with_context(|| format!("listen on port {port}"))?;
    }
    for peer in &cfg.connect {
        match node.connect(peer.as_str()).await {
            Ok(edge) => info!(%peer, ?edge, "joined"),
            Err(reason) => warn!(%peer, %reason, "could not join"),
        }
    }

    let outcome = tokio::select! {
        res = shutdown_signal() => res,
        res = commands(&node, &directory) => res,
    };
    node.shutdown();
    outcome
}

async fn log_events(mut events: mpsc::UnboundedReceiver<NodeEvent>, directory: Directory) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::ListenSucceeded { addr } => info!(%addr, "accepting windows"),
            NodeEvent::ListenFailed { port, reason } => warn!(port, %reason, "cannot accept windows"),
            NodeEvent::ConnectSucceeded { peer, edge } => {
                println!("connected: {peer} is our {edge:?}");
                remember(&directory, &peer);
            }
            NodeEvent::ConnectFailed { reason } => println!("connection failed: {reason}"),
            NodeEvent::LinkClosed { peer, edge } => println!("disconnected: {peer} ({edge:?})"),
            NodeEvent::MessageReceived(msg) => {
                remember(&directory, &msg.source);
                debug!(id = %msg.id, from = %msg.source, code = ?msg.code, "received");
            }
            NodeEvent::MessageForwarded(msg) => debug!(id = %msg.id, code = ?msg.code, "forwarded"),
            NodeEvent::MessageDelivered(msg) => show(&msg),
        }
    }
}

fn show(msg: &WindowMessage) {
    match (&msg.code, &msg.content) {
        (MessageCode::Text, Content::Text(text)) => println!("{}: {}", msg.source, text),
        (MessageCode::ListOfMessages, Content::Messages(list)) => {
            println!("{} sent {} message(s):", msg.source, list.len());
            for sent in list {
                println!("  {} {}", sent.id, sent.text);
            }
        }
        _ => debug!(id = %msg.id, code = ?msg.code, "delivered"),
    }
}

fn remember(directory: &Directory, window: &WindowInfo) {
    directory
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(window.unique_id, window.clone());
}

/// Resolve a typed id. Routing only looks at the unique id, so an unseen window still gets a usable handle.
fn lookup(directory: &Directory, raw: &str) -> Option<WindowInfo> {
    let id: WindowId = raw.parse().ok()?;
    let known = directory
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned();
    Some(known.unwrap_or(WindowInfo {
        id: 0,
        unique_id: id,
        cluster: String::new(),
    }))
}

/// Run stdin commands until `quit`. On end of input keep running until signalled.
async fn commands(node: &Node, directory: &Directory) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "" => {}
            "all" => {
                let n = node.broadcast_text(rest);
                println!("handed to {n} neighbor(s)");
            }
            "to" => {
                let (raw, text) = rest.split_once(' ').unwrap_or((rest, ""));
                match lookup(directory, raw) {
                    Some(target) => {
                        let n = node.send_text(target, text);
                        println!("handed to {n} neighbor(s)");
                    }
                    None => println!("not a window id: {raw}"),
                }
            }
            "log" => match lookup(directory, rest) {
                Some(target) => {
                    node.request_messages(target);
                }
                None => println!("not a window id: {rest}"),
            },
            "tree" => {
                let view = node.view();
                println!("me: {}", view.window);
                for (depth, ancestor) in view.lineage.iter().enumerate() {
                    println!("  ancestor {}: {}", depth + 1, ancestor);
                }
                for child in &view.children {
                    println!("  child: {child}");
                }
            }
            "quit" => return Ok(()),
            other => println!("commands: all <text> | to <id> <text> | log <id> | tree | quit (got {other:?})"),
        }
    }
    info!("stdin closed; running until signalled");
    std::future::pending::<()>().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("signal received, shutting down");
    Ok(())
}
