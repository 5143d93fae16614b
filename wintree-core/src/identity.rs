//! Window identity: unique id, user-chosen numeric id, cluster label, and the view a window advertises.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique window id. Assigned once at creation; the key for every routing and liveness comparison.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WindowId(Uuid);

impl WindowId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        WindowId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        WindowId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for WindowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(WindowId)
    }
}

/// Identity of one window in the overlay. `id` is user-chosen and may collide; `unique_id` never does.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: i32,
    pub unique_id: WindowId,
    pub cluster: String,
}

impl WindowInfo {
    /// New identity with a freshly generated unique id.
    pub fn new(id: i32, cluster: impl Into<String>) -> Self {
        Self {
            id,
            unique_id: WindowId::generate(),
            cluster: cluster.into(),
        }
    }

    pub fn is(&self, other: &WindowId) -> bool {
        self.unique_id == *other
    }
}

impl fmt::Display for WindowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{} ({})", self.id, self.cluster, self.unique_id)
    }
}

/// What a window tells its peers about itself: identity, ancestor chain (parent first), children and child capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowView {
    pub window: WindowInfo,
    pub lineage: Vec<WindowInfo>,
    pub children: Vec<WindowInfo>,
    pub max_children: u32,
}

impl WindowView {
    pub fn parent(&self) -> Option<&WindowInfo> {
        self.lineage.first()
    }

    /// Root of the tree this window belongs to, as far as the window knows.
    pub fn root(&self) -> &WindowId {
        self.lineage
            .last()
            .map(|w| &w.unique_id)
            .unwrap_or(&self.window.unique_id)
    }

    pub fn has_free_slot(&self) -> bool {
        self.children.len() < self.max_children as usize
    }
}
