//! Window tree overlay: identities, wire protocol, topology table and routing rules.
//! No I/O; the node crate drives sockets and applies the decisions made here.

pub mod identity;
pub mod protocol;
pub mod router;
pub mod topology;
pub mod wire;

pub use identity::{WindowId, WindowInfo, WindowView};
pub use protocol::{
    ConnectFailure, Content, Edge, Handshake, MessageCode, MessageStatus, NetworkCode, SentText,
    TransferType, WindowMessage, PROTOCOL_VERSION,
};
pub use router::{dispatch, Dispatch, Hop};
pub use topology::{Topology, DEFAULT_MAX_CHILDREN};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
