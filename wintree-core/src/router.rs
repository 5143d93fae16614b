//! Routing decisions: given a window's neighbors and a message, where does the message go next.
//! Pure; the node applies the decision to its links.

use crate::identity::WindowInfo;
use crate::protocol::{TransferType, WindowMessage};

/// Where the message is being dispatched from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Hop {
    /// Sent by the local window itself.
    Origin,
    /// Arrived over a link.
    Relay,
}

/// Outcome of routing one message at one window.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// The message terminates (also) here.
    pub deliver: bool,
    /// Next hop and the message to hand it, route already updated.
    pub forwards: Vec<(WindowInfo, WindowMessage)>,
}

/// Route `msg` at window `me` with the given neighbors (parent and children).
///
/// Never forwards back to `msg.sender`. Misses (unknown route hop, target nowhere below) produce an
/// empty dispatch; there is no negative acknowledgement.
pub fn dispatch(me: &WindowInfo, neighbors: &[WindowInfo], msg: &WindowMessage, hop: Hop) -> Dispatch {
    match msg.transfer_type {
        TransferType::Broadcast => broadcast(neighbors, msg, hop),
        TransferType::LookForChildren => match &msg.target {
            None => broadcast(neighbors, msg, hop),
            Some(target) if target.unique_id == me.unique_id => Dispatch {
                deliver: true,
                forwards: Vec::new(),
            },
            Some(_) => {
                let mut traced = msg.clone();
                traced.route.push(me.clone());
                Dispatch {
                    deliver: false,
                    forwards: fan_out(neighbors, &traced),
                }
            }
        },
        TransferType::UseRoute => replay(me, neighbors, msg),
    }
}

fn broadcast(neighbors: &[WindowInfo], msg: &WindowMessage, hop: Hop) -> Dispatch {
    Dispatch {
        deliver: hop == Hop::Relay,
        forwards: fan_out(neighbors, msg),
    }
}

/// Every neighbor except the one the message came from.
fn fan_out(neighbors: &[WindowInfo], msg: &WindowMessage) -> Vec<(WindowInfo, WindowMessage)> {
    let came_from = msg.sender.as_ref().map(|s| s.unique_id);
    neighbors
        .iter()
        .filter(|n| Some(n.unique_id) != came_from)
        .map(|n| (n.clone(), msg.clone()))
        .collect()
}

fn replay(me: &WindowInfo, neighbors: &[WindowInfo], msg: &WindowMessage) -> Dispatch {
    let mut rest = msg.clone();
    loop {
        let Some(next) = rest.route.pop() else {
            return Dispatch {
                deliver: true,
                forwards: Vec::new(),
            };
        };
        if next.unique_id == me.unique_id {
            continue;
        }
        return match neighbors.iter().find(|n| n.unique_id == next.unique_id) {
            Some(n) => Dispatch {
                deliver: false,
                forwards: vec![(n.clone(), rest)],
            },
            None => Dispatch::default(),
        };
    }
}
