use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scene::{EntityHandle, GroupFlags, SceneTree};

/// Connection-level identifier of a process. The authority is always `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const AUTHORITY: PeerId = PeerId(1);

    pub fn is_authority(self) -> bool {
        self == Self::AUTHORITY
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(PeerId)
    }
}

/// Client-side replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    AwaitingSnapshot,
    Synced,
}

#[derive(Debug)]
pub struct PeerConnection {
    pub peer: PeerId,
    pub player: Option<EntityHandle>,
    pub snapshots_sent: u32,
    pub forced_updates_sent: u32,
}

impl PeerConnection {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            player: None,
            snapshots_sent: 0,
            forced_updates_sent: 0,
        }
    }
}

/// Peers known to the authority.
#[derive(Debug)]
pub struct ConnectionTable {
    peers: HashMap<PeerId, PeerConnection>,
    max_peers: usize,
}

impl ConnectionTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    pub fn insert(&mut self, peer: PeerId) -> Result<&mut PeerConnection, &'static str> {
        if !self.peers.contains_key(&peer) && self.peers.len() >= self.max_peers {
            return Err("peer table full");
        }
        Ok(self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(peer)))
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(&peer)
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<PeerConnection> {
        self.peers.remove(&peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// `PeerId` to the `Player` entity representing it.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: HashMap<PeerId, EntityHandle>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: PeerId, handle: EntityHandle) -> Option<EntityHandle> {
        self.players.insert(peer, handle)
    }

    /// Forgets any peer mapped to `handle`.
    pub fn remove_entity(&mut self, handle: EntityHandle) -> Option<PeerId> {
        let peer = self
            .players
            .iter()
            .find(|&(_, &h)| h == handle)
            .map(|(&peer, _)| peer)?;
        self.players.remove(&peer);
        Some(peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<EntityHandle> {
        self.players.get(&peer).copied()
    }

    /// Map lookup with a fallback scan of `Player` entities by their `OID`.
    pub fn find(&mut self, tree: &SceneTree, peer: PeerId) -> Option<EntityHandle> {
        if let Some(handle) = self.get(peer).filter(|&h| tree.contains(h)) {
            return Some(handle);
        }

        let found = tree.descendants(tree.root()).into_iter().find(|&handle| {
            tree.get(handle).is_some_and(|entity| {
                entity.flags.contains(GroupFlags::PLAYER) && entity.owner_id() == Some(peer)
            })
        });
        match found {
            Some(handle) => {
                self.players.insert(peer, handle);
            }
            None => {
                self.players.remove(&peer);
            }
        }
        found
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Entity, Subtree};

    #[test]
    fn table_respects_capacity() {
        let mut table = ConnectionTable::new(2);
        table.insert(PeerId(2)).unwrap();
        table.insert(PeerId(3)).unwrap();
        assert!(table.insert(PeerId(4)).is_err());
        // re-inserting a known peer is fine
        assert!(table.insert(PeerId(2)).is_ok());
        assert_eq!(table.peer_ids(), vec![PeerId(2), PeerId(3)]);
    }

    #[test]
    fn player_lookup_falls_back_to_owner_metadata() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let mut entity = Entity::new("Player_5", "Player").with_group("Player");
        entity.set_owner_id(PeerId(5));
        let handle = tree.insert(root, Subtree::new(entity)).unwrap();

        let mut players = PlayerRegistry::new();
        assert_eq!(players.get(PeerId(5)), None);
        assert_eq!(players.find(&tree, PeerId(5)), Some(handle));
        assert_eq!(players.get(PeerId(5)), Some(handle));
        assert_eq!(players.find(&tree, PeerId(6)), None);
    }

    #[test]
    fn peer_id_parses_trimmed() {
        assert_eq!(" 12 ".parse::<PeerId>().unwrap(), PeerId(12));
        assert!(PeerId::AUTHORITY.is_authority());
    }
}
