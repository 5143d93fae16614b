//! A window's place in the tree: one optional parent, bounded children, and the admission rules for new edges.

use crate::identity::{WindowId, WindowInfo, WindowView};
use crate::protocol::{ConnectFailure, Edge};

/// Default bound on the number of children a window accepts.
pub const DEFAULT_MAX_CHILDREN: usize = 8;

/// Local edge table. Holds identities only; links are looked up by `WindowId` elsewhere.
#[derive(Debug, Clone)]
pub struct Topology {
    me: WindowInfo,
    parent: Option<WindowInfo>,
    /// Parent's own lineage (grandparent first). Empty without a parent.
    above_parent: Vec<WindowInfo>,
    children: Vec<WindowInfo>,
    max_children: usize,
}

impl Topology {
    pub fn new(me: WindowInfo, max_children: usize) -> Self {
        Self {
            me,
            parent: None,
            above_parent: Vec::new(),
            children: Vec::new(),
            max_children,
        }
    }

    pub fn me(&self) -> &WindowInfo {
        &self.me
    }

    pub fn parent(&self) -> Option<&WindowInfo> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[WindowInfo] {
        &self.children
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    /// Ancestor chain, parent first.
    pub fn lineage(&self) -> Vec<WindowInfo> {
        self.parent
            .iter()
            .chain(self.above_parent.iter())
            .cloned()
            .collect()
    }

    pub fn root(&self) -> &WindowId {
        self.above_parent
            .last()
            .or(self.parent.as_ref())
            .map(|w| &w.unique_id)
            .unwrap_or(&self.me.unique_id)
    }

    pub fn view(&self) -> WindowView {
        WindowView {
            window: self.me.clone(),
            lineage: self.lineage(),
            children: self.children.clone(),
            max_children: self.max_children as u32,
        }
    }

    /// Parent first, then children in attach order.
    pub fn neighbors(&self) -> Vec<WindowInfo> {
        self.parent
            .iter()
            .chain(self.children.iter())
            .cloned()
            .collect()
    }

    pub fn edge_to(&self, id: &WindowId) -> Option<Edge> {
        if self.parent.as_ref().is_some_and(|p| p.is(id)) {
            Some(Edge::Parent)
        } else if self.children.iter().any(|c| c.is(id)) {
            Some(Edge::Child)
        } else {
            None
        }
    }

    fn would_close_cycle(&self, remote: &WindowView) -> bool {
        let remote_id = &remote.window.unique_id;
        self.me.is(remote_id) || self.edge_to(remote_id).is_some() || remote.root() == self.root()
    }

    /// Acceptor side: decide whether `remote` may join. Returns what the remote would be to us.
    ///
    /// A parentless initiator becomes our child. An initiator that already has a parent can only
    /// take us as its child when we are a root; two non-roots cannot be joined.
    ///
    /// Lineages of other windows may lag behind a parent change, so root comparison alone cannot
    /// prove the new edge is loop free. A root is hung below another window only when it has no
    /// subtree or the new parent is itself a root; anything else is refused as `Unknown`.
    pub fn admit(&self, remote: &WindowView) -> Result<Edge, ConnectFailure> {
        if self.would_close_cycle(remote) {
            return Err(ConnectFailure::Cycle);
        }
        if remote.parent().is_none() {
            if self.children.len() >= self.max_children {
                return Err(ConnectFailure::DegreeExceeded);
            }
            if !may_hang(!remote.children.is_empty(), self.parent.is_some()) {
                return Err(ConnectFailure::Unknown);
            }
            Ok(Edge::Child)
        } else if self.parent.is_none() {
            if !may_hang(!self.children.is_empty(), true) {
                return Err(ConnectFailure::Unknown);
            }
            if !remote.has_free_slot() {
                return Err(ConnectFailure::DegreeExceeded);
            }
            Ok(Edge::Parent)
        } else {
            Err(ConnectFailure::Unknown)
        }
    }

    /// Initiator side: re-check an acceptor's verdict against the current table.
    /// `edge` is what the acceptor would be to us; `remote` is its view before the edge.
    pub fn confirm(&self, remote: &WindowView, edge: Edge) -> Result<(), ConnectFailure> {
        if self.would_close_cycle(remote) {
            return Err(ConnectFailure::Cycle);
        }
        match edge {
            Edge::Parent if self.parent.is_some() => Err(ConnectFailure::Unknown),
            Edge::Parent if !may_hang(!self.children.is_empty(), remote.parent().is_some()) => {
                Err(ConnectFailure::Unknown)
            }
            Edge::Child if self.children.len() >= self.max_children => {
                Err(ConnectFailure::DegreeExceeded)
            }
            Edge::Child if remote.parent().is_some() => Err(ConnectFailure::Unknown),
            Edge::Child if !may_hang(!remote.children.is_empty(), self.parent.is_some()) => {
                Err(ConnectFailure::Unknown)
            }
            _ => Ok(()),
        }
    }

    /// Install an edge to `remote`. Call only after `admit` or `confirm` succeeded.
    pub fn attach(&mut self, remote: &WindowView, edge: Edge) {
        match edge {
            Edge::Parent => {
                self.parent = Some(remote.window.clone());
                self.above_parent = remote.lineage.clone();
            }
            Edge::Child => {
                if !self.children.iter().any(|c| c == &remote.window) {
                    self.children.push(remote.window.clone());
                }
            }
        }
    }

    /// Remove whichever edge leads to `id`. Idempotent: unknown ids are a no-op.
    pub fn detach(&mut self, id: &WindowId) -> Option<Edge> {
        if self.parent.as_ref().is_some_and(|p| p.is(id)) {
            self.parent = None;
            self.above_parent.clear();
            return Some(Edge::Parent);
        }
        let before = self.children.len();
        self.children.retain(|c| !c.is(id));
        (self.children.len() != before).then_some(Edge::Child)
    }

    /// Take over the lineage advertised by our parent. Returns true if ours changed.
    pub fn adopt_lineage(&mut self, parent_view: &WindowView) -> bool {
        match &self.parent {
            Some(p) if p.unique_id == parent_view.window.unique_id => {
                if self.above_parent == parent_view.lineage {
                    return false;
                }
                self.above_parent = parent_view.lineage.clone();
                true
            }
            _ => false,
        }
    }

    /// Drop every edge.
    pub fn clear(&mut self) {
        self.parent = None;
        self.above_parent.clear();
        self.children.clear();
    }
}

/// Whether a root may become the child of a new parent without risking a loop.
fn may_hang(child_has_subtree: bool, parent_has_parent: bool) -> bool {
    !child_has_subtree || !parent_has_parent
}
