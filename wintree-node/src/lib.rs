//! Window tree overlay node: TCP links with heartbeats, the node-local topology manager and the
//! event surface consumed by the daemon (or any other front end).

pub mod config;
pub mod event;
mod heartbeat;
mod link;
pub mod logging;
pub mod node;

pub use event::{ListenFailure, NodeEvent};
pub use link::LinkError;
pub use node::{Node, NodeSettings};
pub use wintree_core;
