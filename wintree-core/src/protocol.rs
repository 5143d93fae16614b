//! Window tree wire protocol: message model, link codes, handshake messages and version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{WindowInfo, WindowView};

/// Current protocol version. Sent in the handshake `Hello`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Leading byte of every unit sent over an established link.
///
/// Extends the two-code wire (transfer, keep-alive) with `KeepAliveReply`, so that answering a keep-alive
/// never triggers another answer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum NetworkCode {
    /// Followed by one length-prefixed `WindowMessage` body.
    WindowMessageTransfer = 0x01,
    /// Liveness probe. No body; answered with `KeepAliveReply`.
    KeepAlive = 0x02,
    /// Answer to a probe. No body; never answered.
    KeepAliveReply = 0x03,
}

impl TryFrom<u8> for NetworkCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NetworkCode::WindowMessageTransfer),
            0x02 => Ok(NetworkCode::KeepAlive),
            0x03 => Ok(NetworkCode::KeepAliveReply),
            other => Err(other),
        }
    }
}

/// What the content of a message means.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageCode {
    Text,
    /// Content is the view of a window whose place in the tree changed.
    NodesUpdate,
    /// Request (empty content) or response (list of sent texts) for a window's sent-message log.
    ListOfMessages,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageStatus {
    Transfer,
    Response,
}

/// Routing mode of a message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransferType {
    /// Search the tree for `target`, recording the route on the way.
    LookForChildren,
    /// Deliver everywhere in the tree.
    Broadcast,
    /// Replay a recorded route backwards.
    UseRoute,
}

/// A text message a window originated, as listed in a `ListOfMessages` response.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SentText {
    pub id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Empty,
    Text(String),
    Node(WindowView),
    Messages(Vec<SentText>),
}

/// An application message routed across the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMessage {
    pub id: Uuid,
    pub source: WindowInfo,
    pub target: Option<WindowInfo>,
    pub code: MessageCode,
    pub status: MessageStatus,
    pub transfer_type: TransferType,
    pub expects_response: bool,
    pub content: Content,
    /// Hops traversed so far, oldest first. Consumed from the back by `UseRoute`.
    pub route: Vec<WindowInfo>,
    /// Last hop. Stamped locally on send and on receipt, never put on the wire.
    #[serde(skip)]
    pub sender: Option<WindowInfo>,
}

impl WindowMessage {
    /// New transfer message. Targeted messages search the tree; untargeted ones broadcast.
    pub fn new(source: WindowInfo, target: Option<WindowInfo>, code: MessageCode) -> Self {
        let transfer_type = if target.is_some() {
            TransferType::LookForChildren
        } else {
            TransferType::Broadcast
        };
        Self {
            id: Uuid::new_v4(),
            source,
            target,
            code,
            status: MessageStatus::Transfer,
            transfer_type,
            expects_response: false,
            content: Content::Empty,
            route: Vec::new(),
            sender: None,
        }
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn with_transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    pub fn expecting_response(mut self) -> Self {
        self.expects_response = true;
        self
    }

    /// Response to this message from `responder`, sent back along the recorded route.
    pub fn response(&self, responder: WindowInfo, content: Content) -> Self {
        Self {
            id: self.id,
            source: responder,
            target: Some(self.source.clone()),
            code: self.code,
            status: MessageStatus::Response,
            transfer_type: TransferType::UseRoute,
            expects_response: false,
            content,
            route: self.route.clone(),
            sender: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Which end of an edge the peer is, seen from the local window.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Edge {
    /// The peer is our parent.
    Parent,
    /// The peer is our child.
    Child,
}

impl Edge {
    /// The same edge seen from the peer.
    pub fn opposite(self) -> Edge {
        match self {
            Edge::Parent => Edge::Child,
            Edge::Child => Edge::Parent,
        }
    }
}

/// Why a connection attempt did not produce an edge.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum ConnectFailure {
    #[error("connection would create a cycle")]
    Cycle,
    #[error("maximum number of children exceeded")]
    DegreeExceeded,
    #[error("window unreachable or handshake failed")]
    Unknown,
}

/// Messages exchanged once, before the first coded unit, to agree on an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Handshake {
    /// Initiator describes itself.
    Hello {
        protocol_version: u8,
        view: WindowView,
    },
    /// Acceptor installed the edge. `edge` is what the initiator is to the acceptor.
    Accepted { view: WindowView, edge: Edge },
    Rejected { reason: ConnectFailure },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targeted_messages_search_untargeted_broadcast() {
        let a = WindowInfo::new(1, "lab");
        let b = WindowInfo::new(2, "lab");
        let m = WindowMessage::new(a.clone(), Some(b), MessageCode::Text);
        assert_eq!(m.transfer_type, TransferType::LookForChildren);
        let m = WindowMessage::new(a, None, MessageCode::Text);
        assert_eq!(m.transfer_type, TransferType::Broadcast);
        assert_eq!(m.status, MessageStatus::Transfer);
    }

    #[test]
    fn response_reverses_endpoints_and_keeps_route() {
        let a = WindowInfo::new(1, "lab");
        let hop = WindowInfo::new(2, "lab");
        let c = WindowInfo::new(3, "lab");
        let mut req =
            WindowMessage::new(a.clone(), Some(c.clone()), MessageCode::ListOfMessages);
        req.route = vec![a.clone(), hop.clone()];
        let resp = req.response(c.clone(), Content::Messages(vec![]));
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.source, c);
        assert_eq!(resp.target, Some(a.clone()));
        assert_eq!(resp.status, MessageStatus::Response);
        assert_eq!(resp.transfer_type, TransferType::UseRoute);
        assert_eq!(resp.route, vec![a, hop]);
    }

    #[test]
    fn network_codes() {
        assert_eq!(NetworkCode::try_from(0x01), Ok(NetworkCode::WindowMessageTransfer));
        assert_eq!(NetworkCode::try_from(0x02), Ok(NetworkCode::KeepAlive));
        assert_eq!(NetworkCode::try_from(0x03), Ok(NetworkCode::KeepAliveReply));
        assert_eq!(NetworkCode::try_from(0x7f), Err(0x7f));
        assert_eq!(NetworkCode::KeepAlive as u8, 0x02);
    }

    #[test]
    fn edge_opposite() {
        assert_eq!(Edge::Parent.opposite(), Edge::Child);
        assert_eq!(Edge::Child.opposite(), Edge::Parent);
    }
}
