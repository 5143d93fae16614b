//! Events a node reports to whoever consumes it (UI, daemon log, tests).

use std::net::SocketAddr;

use wintree_core::{ConnectFailure, Edge, WindowInfo, WindowMessage};

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ListenFailure {
    #[error("port already in use")]
    PortInUse,
    #[error("listen failed: {0}")]
    Other(String),
}

/// Everything observable about a node. Sent over an unbounded channel; the node keeps only the sender.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    ListenSucceeded { addr: SocketAddr },
    ListenFailed { port: u16, reason: ListenFailure },
    /// An edge was installed. Raised on both ends of the handshake.
    ///
    /// The acceptor installs the edge before the initiator has confirmed it. If the initiator then
    /// refuses (its table changed during the round trip), the acceptor follows up with `LinkClosed`
    /// for the same peer once the dropped socket is noticed.
    ConnectSucceeded { peer: WindowInfo, edge: Edge },
    /// Raised on the initiating side only.
    ConnectFailed { reason: ConnectFailure },
    /// An edge was removed (link died, was killed, or detached on request).
    LinkClosed { peer: WindowInfo, edge: Edge },
    /// Arrived over a link, before routing.
    MessageReceived(WindowMessage),
    /// Terminal at this node.
    MessageDelivered(WindowMessage),
    /// Handed on to at least one neighbor.
    MessageForwarded(WindowMessage),
}
