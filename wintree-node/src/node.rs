//! Node-local topology manager: owns the window's edges and links, runs handshakes, routes messages.
//!
//! All edge mutations (handshake completion, link teardown, explicit detach) and every routing
//! decision happen under one lock per node, so a message is never forwarded over a half-removed edge.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wintree_core::router::{self, Hop};
use wintree_core::wire;
use wintree_core::{
    ConnectFailure, Content, Edge, Handshake, MessageCode, MessageStatus, SentText, Topology,
    WindowId, WindowInfo, WindowMessage, WindowView, DEFAULT_MAX_CHILDREN, PROTOCOL_VERSION,
};

use crate::event::{ListenFailure, NodeEvent};
use crate::link::{read_frame, write_frame, Link, LinkError, LinkOwner, LinkSettings};

/// Keep-alive period of the reference deployment; long enough that the monitor is dormant in practice.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1_000_000);

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

const SENT_LOG_CAPACITY: usize = 1024;

/// Pause after a failed accept (descriptor exhaustion and the like) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Construction-time configuration of a node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub window_id: i32,
    pub cluster: String,
    pub max_children: usize,
    /// Zero disables the heartbeat monitor.
    pub heartbeat_interval: Duration,
    /// Bounds a message body read, the handshake and the outbound TCP connect.
    pub read_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            window_id: 0,
            cluster: "localhost".to_string(),
            max_children: DEFAULT_MAX_CHILDREN,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Handle to the local window. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    me: WindowInfo,
    settings: NodeSettings,
    state: Mutex<NodeState>,
    events: mpsc::UnboundedSender<NodeEvent>,
    shutdown: watch::Sender<bool>,
    next_serial: AtomicU64,
}

/// Edges and links change together: a peer has a link iff it has an edge.
struct NodeState {
    topology: Topology,
    links: HashMap<WindowId, Link>,
    /// Text messages originated here, newest first.
    sent: Vec<SentText>,
}

impl Node {
    /// Create a node with a fresh identity. Events arrive on the returned receiver.
    pub fn new(settings: NodeSettings) -> (Node, mpsc::UnboundedReceiver<NodeEvent>) {
        let me = WindowInfo::new(settings.window_id, settings.cluster.clone());
        Self::with_window(me, settings)
    }

    pub fn with_window(
        me: WindowInfo,
        settings: NodeSettings,
    ) -> (Node, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let inner = Inner {
            state: Mutex::new(NodeState {
                topology: Topology::new(me.clone(), settings.max_children),
                links: HashMap::new(),
                sent: Vec::new(),
            }),
            me,
            settings,
            events,
            shutdown,
            next_serial: AtomicU64::new(1),
        };
        (
            Node {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn me(&self) -> &WindowInfo {
        &self.inner.me
    }

    pub fn view(&self) -> WindowView {
        self.inner.view()
    }

    pub fn parent(&self) -> Option<WindowInfo> {
        self.inner.state().topology.parent().cloned()
    }

    pub fn children(&self) -> Vec<WindowInfo> {
        self.inner.state().topology.children().to_vec()
    }

    /// Text messages this window originated, newest first.
    pub fn sent_messages(&self) -> Vec<SentText> {
        self.inner.state().sent.clone()
    }

    /// Accept connections on `port` (0 picks a free one). Never retries.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, ListenFailure> {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) => return Err(self.inner.listen_failed(port, e)),
        };
        let addr = listener
            .local_addr()
            .map_err(|e| self.inner.listen_failed(port, e))?;
        info!(%addr, window = %self.inner.me, "listening");
        self.inner.emit(NodeEvent::ListenSucceeded { addr });
        tokio::spawn(accept_loop(self.inner.clone(), listener));
        Ok(addr)
    }

    /// Join the window listening at `addr`. The outcome is also raised as an event.
    pub async fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<Edge, ConnectFailure> {
        let result = self.inner.clone().handshake_connect(addr).await;
        if let Err(reason) = result {
            info!(%reason, "connection failed");
            self.inner.emit(NodeEvent::ConnectFailed { reason });
        }
        result
    }

    /// Send a message originated here. Returns how many neighbors it was handed to; zero means nobody.
    pub fn transfer_message(&self, msg: WindowMessage) -> usize {
        self.inner.originate(msg)
    }

    pub fn broadcast_text(&self, text: impl Into<String>) -> usize {
        let msg = WindowMessage::new(self.inner.me.clone(), None, MessageCode::Text)
            .with_content(Content::Text(text.into()));
        self.transfer_message(msg)
    }

    pub fn send_text(&self, target: WindowInfo, text: impl Into<String>) -> usize {
        let msg = WindowMessage::new(self.inner.me.clone(), Some(target), MessageCode::Text)
            .with_content(Content::Text(text.into()));
        self.transfer_message(msg)
    }

    /// Ask `target` for its sent text messages. The answer arrives as a delivered `ListOfMessages` response.
    pub fn request_messages(&self, target: WindowInfo) -> usize {
        let msg =
            WindowMessage::new(self.inner.me.clone(), Some(target), MessageCode::ListOfMessages)
                .expecting_response();
        self.transfer_message(msg)
    }

    /// Detach from the parent. With `notify_peer` the link is flushed and half-closed so the parent drops
    /// its edge right away; otherwise it is cut.
    pub fn remove_parent(&self, notify_peer: bool) -> Option<WindowInfo> {
        let mut state = self.inner.state();
        let parent = state.topology.parent()?.unique_id;
        self.inner
            .teardown(&mut state, &parent, None, notify_peer)
            .map(|(peer, _)| peer)
    }

    pub fn remove_child(&self, child: &WindowId, notify_peer: bool) -> Option<WindowInfo> {
        let mut state = self.inner.state();
        if state.topology.edge_to(child) != Some(Edge::Child) {
            return None;
        }
        self.inner
            .teardown(&mut state, child, None, notify_peer)
            .map(|(peer, _)| peer)
    }

    /// Tear down the link to `peer` and remove its edge. Idempotent.
    pub fn kill(&self, peer: &WindowId) -> Option<Edge> {
        let mut state = self.inner.state();
        self.inner
            .teardown(&mut state, peer, None, false)
            .map(|(_, edge)| edge)
    }

    /// Stop accepting, close every link and forget all edges.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let links: Vec<Link> = {
            let mut state = self.inner.state();
            state.topology.clear();
            state.links.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.close(true);
        }
        info!(window = %self.inner.me, "node shut down");
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn view(&self) -> WindowView {
        self.state().topology.view()
    }

    fn link_settings(&self) -> LinkSettings {
        let interval = self.settings.heartbeat_interval;
        LinkSettings {
            read_timeout: self.settings.read_timeout,
            heartbeat: (!interval.is_zero()).then_some(interval),
        }
    }

    fn listen_failed(&self, port: u16, e: io::Error) -> ListenFailure {
        let reason = if e.kind() == io::ErrorKind::AddrInUse {
            ListenFailure::PortInUse
        } else {
            ListenFailure::Other(e.to_string())
        };
        warn!(port, error = %e, "listen failed");
        self.emit(NodeEvent::ListenFailed {
            port,
            reason: reason.clone(),
        });
        reason
    }

    async fn handshake_connect<A: ToSocketAddrs>(
        self: Arc<Self>,
        addr: A,
    ) -> Result<Edge, ConnectFailure> {
        let limit = self.settings.read_timeout;
        let mut stream = match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(error = %e, "tcp connect failed");
                return Err(ConnectFailure::Unknown);
            }
            Err(_) => {
                debug!("tcp connect timed out");
                return Err(ConnectFailure::Unknown);
            }
        };
        let hello = Handshake::Hello {
            protocol_version: PROTOCOL_VERSION,
            view: self.view(),
        };
        let reply = tokio::time::timeout(limit, async {
            write_frame(&mut stream, &hello).await?;
            read_frame::<Handshake, _>(&mut stream).await
        })
        .await;
        let reply = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!(error = %e, "handshake failed");
                return Err(ConnectFailure::Unknown);
            }
            Err(_) => {
                debug!("handshake timed out");
                return Err(ConnectFailure::Unknown);
            }
        };
        match reply {
            Handshake::Accepted { view, edge } => self.complete(stream, view, edge.opposite()),
            Handshake::Rejected { reason } => Err(reason),
            Handshake::Hello { .. } => Err(ConnectFailure::Unknown),
        }
    }

    /// Initiator: install the edge the acceptor agreed to, unless our table changed meanwhile.
    /// On refusal the stream is dropped and the acceptor's receive loop removes its half.
    fn complete(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: WindowView,
        edge: Edge,
    ) -> Result<Edge, ConnectFailure> {
        let mut state = self.state();
        if self.is_shut_down() {
            return Err(ConnectFailure::Unknown);
        }
        state.topology.confirm(&remote, edge)?;
        self.install(&mut state, stream, &remote, edge, None);
        Ok(edge)
    }

    async fn handshake_accept(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let hello = match tokio::time::timeout(
            self.settings.read_timeout,
            read_frame::<Handshake, _>(&mut stream),
        )
        .await
        {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "handshake failed");
                return;
            }
            Err(_) => {
                debug!(%addr, "handshake timed out");
                return;
            }
        };
        let verdict = match hello {
            Handshake::Hello {
                protocol_version,
                view,
            } if protocol_version == PROTOCOL_VERSION => self.admit(stream, view),
            Handshake::Hello {
                protocol_version, ..
            } => {
                warn!(%addr, protocol_version, "unsupported protocol version");
                Err((stream, ConnectFailure::Unknown))
            }
            _ => Err((stream, ConnectFailure::Unknown)),
        };
        if let Err((mut stream, reason)) = verdict {
            info!(%addr, %reason, "connection refused");
            let _ = write_frame(&mut stream, &Handshake::Rejected { reason }).await;
        }
    }

    /// Acceptor: check and install atomically. The answer is queued as the link's first unit.
    fn admit(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: WindowView,
    ) -> Result<(), (TcpStream, ConnectFailure)> {
        let mut state = self.state();
        if self.is_shut_down() {
            return Err((stream, ConnectFailure::Unknown));
        }
        let edge = match state.topology.admit(&remote) {
            Ok(edge) => edge,
            Err(reason) => return Err((stream, reason)),
        };
        let answer = Handshake::Accepted {
            view: state.topology.view(),
            edge,
        };
        let preamble = match wire::encode_frame(&answer) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "cannot encode handshake answer");
                return Err((stream, ConnectFailure::Unknown));
            }
        };
        self.install(&mut state, stream, &remote, edge, Some(preamble));
        Ok(())
    }

    fn install(
        self: &Arc<Self>,
        state: &mut NodeState,
        stream: TcpStream,
        remote: &WindowView,
        edge: Edge,
        preamble: Option<Vec<u8>>,
    ) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let peer = remote.window.clone();
        let link = Link::spawn(
            stream,
            peer.clone(),
            serial,
            self.link_settings(),
            self.clone(),
            preamble,
        );
        state.topology.attach(remote, edge);
        if let Some(stale) = state.links.insert(peer.unique_id, link) {
            stale.close(false);
        }
        info!(peer = %peer, ?edge, serial, "edge established");
        if edge == Edge::Parent {
            self.push_lineage(state);
        }
        self.emit(NodeEvent::ConnectSucceeded { peer, edge });
    }

    /// The kill procedure: drop the link and whichever edge leads to `peer`.
    /// With `serial`, only that incarnation of the link is affected. Idempotent.
    fn teardown(
        &self,
        state: &mut NodeState,
        peer: &WindowId,
        serial: Option<u64>,
        graceful: bool,
    ) -> Option<(WindowInfo, Edge)> {
        let current = state
            .links
            .get(peer)
            .is_some_and(|l| serial.map_or(true, |s| s == l.serial));
        if !current {
            return None;
        }
        let link = state.links.remove(peer)?;
        let edge = state.topology.detach(peer);
        let info = link.peer.clone();
        let serial = link.serial;
        link.close(graceful);
        let edge = edge?;
        info!(peer = %info, ?edge, serial, "edge removed");
        if edge == Edge::Parent {
            self.push_lineage(state);
        }
        self.emit(NodeEvent::LinkClosed {
            peer: info.clone(),
            edge,
        });
        Some((info, edge))
    }

    /// Send each child our current view so it can refresh its lineage.
    fn push_lineage(&self, state: &NodeState) {
        let view = state.topology.view();
        for child in state.topology.children() {
            let mut update =
                WindowMessage::new(self.me.clone(), Some(child.clone()), MessageCode::NodesUpdate)
                    .with_content(Content::Node(view.clone()));
            update.sender = Some(self.me.clone());
            if let Some(link) = state.links.get(&child.unique_id) {
                link.send(&update);
            }
        }
    }

    fn originate(&self, msg: WindowMessage) -> usize {
        if msg.code == MessageCode::Text && msg.source.is(&self.me.unique_id) {
            if let Some(text) = msg.text() {
                let mut state = self.state();
                state.sent.insert(
                    0,
                    SentText {
                        id: msg.id,
                        text: text.to_owned(),
                    },
                );
                state.sent.truncate(SENT_LOG_CAPACITY);
            }
        }
        self.route(msg, Hop::Origin, None)
    }

    /// Route one message. `via` is the link it arrived on; messages from a link that is no longer
    /// current are dropped. Returns how many neighbors were handed the message.
    fn route(&self, mut msg: WindowMessage, hop: Hop, via: Option<(&WindowId, u64)>) -> usize {
        let (handed, reply) = {
            let mut state = self.state();
            match via {
                Some((peer, serial)) => {
                    if !state.links.get(peer).is_some_and(|l| l.serial == serial) {
                        debug!(%peer, serial, "dropping message from stale link");
                        return 0;
                    }
                    self.emit(NodeEvent::MessageReceived(msg.clone()));
                }
                None => msg.sender = Some(self.me.clone()),
            }

            let decision = router::dispatch(&self.me, &state.topology.neighbors(), &msg, hop);
            let mut handed = 0;
            for (next, mut fwd) in decision.forwards {
                fwd.sender = Some(self.me.clone());
                match state.links.get(&next.unique_id) {
                    Some(link) if link.send(&fwd) => handed += 1,
                    _ => debug!(peer = %next.unique_id, "neighbor link unavailable"),
                }
            }
            if hop == Hop::Relay && handed > 0 {
                self.emit(NodeEvent::MessageForwarded(msg.clone()));
            }

            let mut reply = None;
            if decision.deliver {
                reply = self.on_delivered(&mut state, &msg);
                self.emit(NodeEvent::MessageDelivered(msg));
            }
            (handed, reply)
        };
        if let Some(reply) = reply {
            self.route(reply, Hop::Origin, None);
        }
        handed
    }

    /// Local side effects of a delivered message. May yield a response to send.
    fn on_delivered(&self, state: &mut NodeState, msg: &WindowMessage) -> Option<WindowMessage> {
        match (&msg.code, &msg.content) {
            (MessageCode::NodesUpdate, Content::Node(view)) => {
                if state.topology.adopt_lineage(view) {
                    debug!(root = %state.topology.root(), "lineage updated");
                    self.push_lineage(state);
                }
                None
            }
            (MessageCode::ListOfMessages, Content::Empty) if msg.status == MessageStatus::Transfer => {
                Some(msg.response(self.me.clone(), Content::Messages(state.sent.clone())))
            }
            _ => None,
        }
    }
}

impl LinkOwner for Inner {
    fn on_message(&self, peer: &WindowInfo, serial: u64, msg: WindowMessage) {
        self.route(msg, Hop::Relay, Some((&peer.unique_id, serial)));
    }

    fn on_link_failed(&self, peer: &WindowId, serial: u64, err: LinkError) {
        let mut state = self.state();
        if self.teardown(&mut state, peer, Some(serial), false).is_some() {
            debug!(%peer, serial, error = %err, "link torn down");
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => if changed.is_err() { break },
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming connection");
                    tokio::spawn(inner.clone().handshake_accept(stream, addr));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!("acceptor stopped");
}
