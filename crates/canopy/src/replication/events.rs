use crate::identity::UniqueId;
use crate::net::PeerId;
use crate::scene::EntityHandle;

/// Notifications for the host application, drained once per frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    EntityAdded {
        handle: EntityHandle,
        /// False for entities that only exist on this process.
        replicated: bool,
    },
    EntityRemoved {
        unique_id: Option<UniqueId>,
    },
    PlayerAdded {
        peer: PeerId,
        handle: EntityHandle,
    },
    PlayerRemoved {
        peer: PeerId,
    },
    /// The first full snapshot has been applied.
    Synced,
    ResyncRequested {
        unresolved: Vec<UniqueId>,
    },
}
