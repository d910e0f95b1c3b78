use std::collections::VecDeque;

use crate::capability::{NetworkData, Ownership, StepContext};
use crate::identity::{IdentityError, IdentityRegistry, UniqueId};
use crate::net::{
    ConnectionState, ConnectionTable, DataType, DeltaUpdate, Envelope, FullSnapshot, GraphError,
    PeerId, PlayerRegistry, ProtocolError, RpcCall, StructuralAdd, StructuralRemove, Transport,
    TransportError, WireNode, graph,
};
use crate::registry::TypeRegistry;
use crate::rpc::{RpcError, RpcScope};
use crate::scene::{Entity, EntityHandle, GroupFlags, SceneTree, Subtree, TreeError};
use crate::value::{Value, ValueDecoder, ValueEncoder};

use super::config::ReplicationConfig;
use super::deferred::{DeferredOp, DeferredQueue};
use super::events::ReplicationEvent;
use super::pending::PendingAdds;
use super::timing::{IntervalTimer, StepClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("identity {0} is not known here")]
    UnresolvedReference(UniqueId),
    #[error("structural add for already known identity {0}")]
    DuplicateStructuralAdd(UniqueId),
    #[error("rpc dispatch failed: {0}")]
    RpcDispatch(#[from] RpcError),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] ProtocolError),
    #[error("{0:?} discarded before the first full snapshot")]
    Gated(DataType),
    #[error("{0:?} is not accepted by this role")]
    UnexpectedMessage(DataType),
    #[error("parent {0:?} has no identity to attach replicated entities under")]
    UnboundParent(EntityHandle),
    #[error("only the authority may {0}")]
    NotAuthority(&'static str),
    #[error("peer {peer} rejected: {reason}")]
    PeerRejected { peer: PeerId, reason: &'static str },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReplicationError {
    /// Expected protocol discards, as opposed to failures worth a warning.
    pub fn is_discard(&self) -> bool {
        matches!(self, Self::Gated(_) | Self::DuplicateStructuralAdd(_))
    }
}

type PlayerFactory = Box<dyn Fn(PeerId) -> Subtree>;

/// One process's side of the replicated scene.
///
/// Owns the tree, the identity map and the transport. Everything runs on the
/// caller's thread: inbound envelopes go through [`receive`](Self::receive),
/// time goes through [`advance`](Self::advance).
pub struct Replicator<T: Transport> {
    role: Role,
    local_peer: PeerId,
    state: ConnectionState,
    config: ReplicationConfig,
    tree: SceneTree,
    identities: IdentityRegistry,
    types: TypeRegistry,
    players: PlayerRegistry,
    peers: ConnectionTable,
    transport: T,
    deferred: DeferredQueue,
    pending_adds: PendingAdds,
    update_timer: IntervalTimer,
    physics: StepClock,
    resync_requested: bool,
    events: VecDeque<ReplicationEvent>,
    player_factory: PlayerFactory,
}

impl<T: Transport> Replicator<T> {
    pub fn authority(config: ReplicationConfig, types: TypeRegistry, transport: T) -> Self {
        let mut replicator = Self::new(Role::Authority, PeerId::AUTHORITY, config, types, transport);
        replicator.state = ConnectionState::Synced;
        replicator
    }

    pub fn client(peer: PeerId, config: ReplicationConfig, types: TypeRegistry, transport: T) -> Self {
        Self::new(Role::Client, peer, config, types, transport)
    }

    fn new(
        role: Role,
        local_peer: PeerId,
        config: ReplicationConfig,
        types: TypeRegistry,
        transport: T,
    ) -> Self {
        let mut tree = SceneTree::new();
        let mut identities = IdentityRegistry::new(config.local_id_ceiling);
        identities.bind_root(&mut tree);

        Self {
            role,
            local_peer,
            state: ConnectionState::Connecting,
            tree,
            identities,
            types,
            players: PlayerRegistry::new(),
            peers: ConnectionTable::new(config.max_peers),
            transport,
            deferred: DeferredQueue::new(),
            pending_adds: PendingAdds::new(config.max_pending_adds),
            update_timer: IntervalTimer::new(config.update_interval_secs()),
            physics: StepClock::new(config.physics_tick_rate),
            resync_requested: false,
            events: VecDeque::new(),
            player_factory: Box::new(default_player),
            config,
        }
    }

    /// Replaces how player entities are built for connecting peers. The engine
    /// still names them, tags them `Player` and stamps their `OID`.
    pub fn set_player_factory(&mut self, factory: impl Fn(PeerId) -> Subtree + 'static) {
        self.player_factory = Box::new(factory);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_authority(&self) -> bool {
        self.role == Role::Authority
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn tree(&self) -> &SceneTree {
        &self.tree
    }

    /// Direct access for game logic. Structural changes belong in
    /// [`attach`](Self::attach) and [`detach`](Self::detach).
    pub fn tree_mut(&mut self) -> &mut SceneTree {
        &mut self.tree
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn peers(&self) -> &ConnectionTable {
        &self.peers
    }

    pub fn pending_adds(&self) -> usize {
        self.pending_adds.len()
    }

    pub fn deferred_mut(&mut self) -> &mut DeferredQueue {
        &mut self.deferred
    }

    /// Peers that would receive a delta, counting the authority itself.
    pub fn connected_peers(&self) -> usize {
        1 + self.peers.len()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ReplicationEvent> + '_ {
        self.events.drain(..)
    }

    pub fn resolve(&self, id: UniqueId) -> Option<EntityHandle> {
        self.identities.resolve(id)
    }

    pub fn entity(&self, handle: EntityHandle) -> Option<&Entity> {
        self.tree.get(handle)
    }

    pub fn entity_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        self.tree.get_mut(handle)
    }

    pub fn capability<C: NetworkData>(&self, handle: EntityHandle) -> Option<&C> {
        self.tree.capability(handle)?.downcast_ref::<C>()
    }

    pub fn capability_mut<C: NetworkData>(&mut self, handle: EntityHandle) -> Option<&mut C> {
        self.tree.capability_mut(handle)?.downcast_mut::<C>()
    }

    /// Entities that take part in replication, root excluded.
    pub fn replicated_count(&self) -> usize {
        let root = self.tree.root();
        self.tree
            .descendants(root)
            .into_iter()
            .filter(|&h| h != root && !self.tree.is_local_only(h))
            .count()
    }

    /// Nearest `Player` ancestor decides: local when it is ours. Without one,
    /// the authority owns everything. Local-only entities are always ours.
    pub fn ownership(&self, handle: EntityHandle) -> Ownership {
        if self.tree.is_local_only(handle) {
            return Ownership::Local;
        }
        let player = self
            .tree
            .find_ancestor_or_self(handle, |e| e.flags.contains(GroupFlags::PLAYER));
        match player {
            Some(player) => {
                let owner = self.tree.get(player).and_then(|e| e.owner_id());
                if owner == Some(self.local_peer) {
                    Ownership::Local
                } else {
                    Ownership::Remote
                }
            }
            None if self.is_authority() => Ownership::Local,
            None => Ownership::Remote,
        }
    }

    // ---- structural hooks ----

    /// Puts `subtree` under `parent`. On the authority, replicated subtrees get
    /// authoritative ids and are announced right away; everything else gets
    /// local ids and stays on this process.
    pub fn attach(&mut self, parent: EntityHandle, subtree: Subtree) -> Result<EntityHandle, ReplicationError> {
        let parent_entity = self.tree.get(parent).ok_or(TreeError::UnknownEntity(parent))?;
        let replicated = self.is_authority()
            && !subtree.entity.flags.contains(GroupFlags::LOCAL_ONLY)
            && !self.tree.is_local_only(parent);
        let parent_id = parent_entity.unique_id();
        if replicated && parent_id.is_none() {
            return Err(ReplicationError::UnboundParent(parent));
        }

        let handle = self.tree.insert(parent, subtree)?;

        if replicated {
            let assigned = self.identities.assign_authoritative(&mut self.tree, handle)?;
            log::debug!("attached {handle:?} with {} new ids", assigned.len());
        } else {
            self.identities.assign_local(&mut self.tree, handle)?;
        }

        self.ready_subtree(handle);
        self.register_players(handle);
        self.events
            .push_back(ReplicationEvent::EntityAdded { handle, replicated });

        let announcement = parent_id.filter(|_| replicated).and_then(|parent| {
            graph::serialize(&self.tree, handle).map(|node| StructuralAdd { parent, node })
        });
        if let Some(add) = announcement {
            self.broadcast(&Envelope::StructuralAdd(add))?;
        }
        Ok(handle)
    }

    /// Frees `handle` and its subtree. The authority announces the removal of
    /// replicated entities first; clients may only detach their own local ones.
    pub fn detach(&mut self, handle: EntityHandle) -> Result<Subtree, ReplicationError> {
        if !self.tree.contains(handle) {
            return Err(TreeError::UnknownEntity(handle).into());
        }
        let replicated = !self.tree.is_local_only(handle);
        if replicated && !self.is_authority() {
            return Err(ReplicationError::NotAuthority("detach replicated entities"));
        }

        let unique_id = self.tree.get(handle).and_then(Entity::unique_id);
        self.unregister_players(handle);
        self.identities.retire(&self.tree, handle);

        match unique_id {
            Some(unique_id) if replicated => {
                self.broadcast(&Envelope::StructuralRemove(StructuralRemove { unique_id }))?;
            }
            _ => {}
        }

        let subtree = self.tree.remove(handle)?;
        self.events
            .push_back(ReplicationEvent::EntityRemoved { unique_id });
        Ok(subtree)
    }

    // ---- connection hooks ----

    /// Authority side of a new connection: creates the peer's player entity
    /// and sends the joining peer its full snapshot.
    pub fn peer_connected(&mut self, peer: PeerId) -> Result<EntityHandle, ReplicationError> {
        if !self.is_authority() {
            return Err(ReplicationError::NotAuthority("accept peers"));
        }
        if peer == self.local_peer {
            return Err(ReplicationError::PeerRejected {
                peer,
                reason: "peer id is taken by the authority",
            });
        }
        self.peers
            .insert(peer)
            .map_err(|reason| ReplicationError::PeerRejected { peer, reason })?;

        let player = self.spawn_player(peer)?;
        if let Some(connection) = self.peers.get_mut(peer) {
            connection.player = Some(player);
        }
        log::info!("peer {peer} connected as {player:?}");

        self.send_full_snapshot(peer)?;
        Ok(player)
    }

    /// Authority side of a disconnect: the peer's player goes away with it.
    pub fn peer_disconnected(&mut self, peer: PeerId) -> Result<(), ReplicationError> {
        if !self.is_authority() {
            return Err(ReplicationError::NotAuthority("drop peers"));
        }
        let Some(connection) = self.peers.remove(peer) else {
            log::debug!("disconnect for unknown peer {peer}");
            return Ok(());
        };

        let player = connection
            .player
            .filter(|&handle| self.tree.contains(handle))
            .or_else(|| self.players.find(&self.tree, peer));
        if let Some(player) = player {
            self.detach(player)?;
        }
        log::info!("peer {peer} disconnected");
        Ok(())
    }

    /// The authority's own player entity.
    pub fn spawn_local_player(&mut self) -> Result<EntityHandle, ReplicationError> {
        if !self.is_authority() {
            return Err(ReplicationError::NotAuthority("spawn players"));
        }
        self.spawn_player(self.local_peer)
    }

    fn spawn_player(&mut self, peer: PeerId) -> Result<EntityHandle, ReplicationError> {
        let mut subtree = (self.player_factory)(peer);
        subtree.entity.name = player_name(peer);
        subtree.entity.flags |= GroupFlags::PLAYER;
        subtree.entity.set_owner_id(peer);

        let root = self.tree.root();
        self.attach(root, subtree)
    }

    /// Client: the transport accepted us; wait for the snapshot.
    pub fn connection_accepted(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::AwaitingSnapshot;
            log::info!("peer {} awaiting snapshot", self.local_peer);
        }
    }

    /// The only teardown signal. A client drops everything it learned from the
    /// authority and goes back to `Connecting`; the authority drops its peers.
    pub fn disconnected(&mut self) -> Result<(), ReplicationError> {
        if self.is_authority() {
            for peer in self.peers.peer_ids() {
                self.peer_disconnected(peer)?;
            }
            return Ok(());
        }

        let root = self.tree.root();
        let replicated: Vec<EntityHandle> = self
            .tree
            .children(root)
            .iter()
            .copied()
            .filter(|&h| !self.tree.is_local_only(h))
            .collect();
        for handle in replicated {
            let unique_id = self.tree.get(handle).and_then(Entity::unique_id);
            self.identities.retire(&self.tree, handle);
            self.tree.remove(handle)?;
            self.events
                .push_back(ReplicationEvent::EntityRemoved { unique_id });
        }

        self.players.clear();
        self.pending_adds.clear();
        self.resync_requested = false;
        self.state = ConnectionState::Connecting;
        log::info!("peer {} disconnected, replicated state dropped", self.local_peer);
        Ok(())
    }

    /// Player entity of `peer`. A miss on a client asks for a resync.
    pub fn player_entity(&mut self, peer: PeerId) -> Result<Option<EntityHandle>, ReplicationError> {
        if let Some(handle) = self.players.find(&self.tree, peer) {
            return Ok(Some(handle));
        }
        log::warn!("no player entity for peer {peer}");
        self.request_resync(Vec::new())?;
        Ok(None)
    }

    pub fn local_player(&mut self) -> Result<Option<EntityHandle>, ReplicationError> {
        self.player_entity(self.local_peer)
    }

    // ---- inbound ----

    /// Handles one inbound envelope. Failures are logged and returned; none of
    /// them leaves the engine in an inconsistent state.
    pub fn receive(&mut self, from: PeerId, text: &str) -> Result<(), ReplicationError> {
        let result = Envelope::from_json(text)
            .map_err(ReplicationError::from)
            .and_then(|envelope| self.dispatch(from, envelope));
        self.drain_deferred();

        if let Err(err) = &result {
            if err.is_discard() {
                log::debug!("peer {}: discarded message from {from}: {err}", self.local_peer);
            } else {
                log::warn!("peer {}: message from {from} failed: {err}", self.local_peer);
            }
        }
        result
    }

    fn dispatch(&mut self, from: PeerId, envelope: Envelope) -> Result<(), ReplicationError> {
        let data_type = envelope.data_type();
        match (self.role, envelope) {
            (_, Envelope::RpcCall(call)) => self.handle_rpc(from, call),
            (Role::Authority, Envelope::RequestForceSync) => self.force_update(from),
            (Role::Authority, _) | (Role::Client, Envelope::RequestForceSync) => {
                Err(ReplicationError::UnexpectedMessage(data_type))
            }
            (Role::Client, envelope) => {
                self.check_gate(data_type)?;
                match envelope {
                    Envelope::DeltaUpdate(delta) => self.apply_delta(delta),
                    Envelope::FullSnapshot(snapshot) => self.apply_snapshot(snapshot),
                    Envelope::StructuralAdd(add) => self.apply_structural_add(add),
                    Envelope::StructuralRemove(remove) => self.apply_structural_remove(remove.unique_id),
                    Envelope::RpcCall(_) | Envelope::RequestForceSync => {
                        Err(ReplicationError::UnexpectedMessage(data_type))
                    }
                }
            }
        }
    }

    fn check_gate(&self, data_type: DataType) -> Result<(), ReplicationError> {
        let open = match self.state {
            ConnectionState::Synced => true,
            ConnectionState::AwaitingSnapshot => data_type == DataType::FullSnapshot,
            ConnectionState::Connecting => false,
        };
        if open {
            Ok(())
        } else {
            Err(ReplicationError::Gated(data_type))
        }
    }

    fn apply_delta(&mut self, delta: DeltaUpdate) -> Result<(), ReplicationError> {
        let mut unresolved = Vec::new();
        for (id, payload) in &delta.entries {
            let Some(handle) = self.identities.resolve_or_search(&self.tree, *id) else {
                log::debug!("delta entry for unknown identity {id} dropped");
                unresolved.push(*id);
                continue;
            };
            let Some((entity, capability)) = self.tree.entity_and_capability_mut(handle) else {
                log::warn!("delta entry for {id} targets an entity without capability");
                continue;
            };
            if let Err(err) = capability.decode(entity, payload) {
                log::warn!("delta entry for {id} rejected: {err}");
            }
        }

        match unresolved.first().copied() {
            Some(first) => {
                self.request_resync(unresolved)?;
                Err(ReplicationError::UnresolvedReference(first))
            }
            None => Ok(()),
        }
    }

    fn apply_snapshot(&mut self, snapshot: FullSnapshot) -> Result<(), ReplicationError> {
        let root = self.tree.root();
        for node in &snapshot.nodes {
            if let Err(err) = self.merge_node(root, node) {
                log::warn!("snapshot node `{}` skipped: {err}", node.name);
            }
        }

        if self.state != ConnectionState::Synced {
            self.state = ConnectionState::Synced;
            self.events.push_back(ReplicationEvent::Synced);
            log::info!(
                "peer {} synced with {} entities",
                self.local_peer,
                self.replicated_count()
            );
        }
        self.retry_pending_adds();
        Ok(())
    }

    /// Known nodes only contribute their unknown descendants; unknown nodes
    /// are attached whole under `parent`.
    fn merge_node(&mut self, parent: EntityHandle, node: &WireNode) -> Result<(), ReplicationError> {
        let known = node
            .unique_id()
            .and_then(|id| self.identities.resolve_or_search(&self.tree, id));

        match known {
            Some(existing) => {
                for child in &node.children {
                    self.merge_node(existing, child)?;
                }
                Ok(())
            }
            None => self.insert_replicated(parent, node).map(|_| ()),
        }
    }

    fn apply_structural_add(&mut self, add: StructuralAdd) -> Result<(), ReplicationError> {
        self.try_structural_add(add)?;
        self.retry_pending_adds();
        Ok(())
    }

    fn try_structural_add(&mut self, add: StructuralAdd) -> Result<EntityHandle, ReplicationError> {
        let known = add
            .node
            .unique_id()
            .filter(|&id| self.identities.resolve_or_search(&self.tree, id).is_some());
        if let Some(id) = known {
            return Err(ReplicationError::DuplicateStructuralAdd(id));
        }

        let Some(parent) = self.identities.resolve_or_search(&self.tree, add.parent) else {
            let missing = add.parent;
            if let Some(evicted) = self.pending_adds.park(add) {
                log::warn!(
                    "pending add queue full, dropped `{}` waiting on {}",
                    evicted.node.name,
                    evicted.parent
                );
            }
            return Err(ReplicationError::UnresolvedReference(missing));
        };

        self.insert_replicated(parent, &add.node)
    }

    fn retry_pending_adds(&mut self) {
        loop {
            let ready = self
                .pending_adds
                .take_ready(|parent| self.identities.contains(parent));
            if ready.is_empty() {
                break;
            }
            for add in ready {
                match self.try_structural_add(add) {
                    Ok(handle) => log::debug!("pending add resolved as {handle:?}"),
                    Err(err) => log::debug!("pending add dropped: {err}"),
                }
            }
        }
    }

    fn insert_replicated(&mut self, parent: EntityHandle, node: &WireNode) -> Result<EntityHandle, ReplicationError> {
        let subtree = graph::deserialize(node, &self.types)?;
        let handle = self.tree.insert(parent, subtree)?;
        self.identities.record(&mut self.tree, handle)?;
        self.ready_subtree(handle);
        self.register_players(handle);
        self.events.push_back(ReplicationEvent::EntityAdded {
            handle,
            replicated: true,
        });
        Ok(handle)
    }

    fn apply_structural_remove(&mut self, unique_id: UniqueId) -> Result<(), ReplicationError> {
        let dropped = self.pending_adds.forget(unique_id);
        let Some(handle) = self.identities.resolve_or_search(&self.tree, unique_id) else {
            log::debug!("remove for unknown identity {unique_id} ignored ({dropped} pending dropped)");
            return Ok(());
        };
        if handle == self.tree.root() {
            log::warn!("refusing to remove the scene root");
            return Ok(());
        }

        self.unregister_players(handle);
        self.identities.retire(&self.tree, handle);
        self.tree.remove(handle)?;
        self.events.push_back(ReplicationEvent::EntityRemoved {
            unique_id: Some(unique_id),
        });
        Ok(())
    }

    fn handle_rpc(&mut self, from: PeerId, call: RpcCall) -> Result<(), ReplicationError> {
        let caller = self
            .identities
            .resolve_or_search(&self.tree, call.caller)
            .ok_or(RpcError::UnresolvedCaller(call.caller))?;

        let mut decoder = ValueDecoder::new(&mut self.identities, &self.tree);
        let args: Vec<Value> = call.params.iter().map(|param| decoder.decode(param)).collect();
        let unresolved = decoder.into_unresolved();
        if !unresolved.is_empty() {
            self.request_resync(unresolved)?;
        }

        self.types.invoke(
            &mut self.tree,
            &mut self.deferred,
            caller,
            &call.method,
            &args,
            Some(from),
        )?;
        Ok(())
    }

    // ---- outbound ----

    /// Sends `method` on `caller` to `scope`. The authority calling itself runs
    /// the handler in place.
    pub fn rpc(
        &mut self,
        scope: RpcScope,
        caller: EntityHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), ReplicationError> {
        match (self.role, scope) {
            (Role::Client, RpcScope::ToAllClients | RpcScope::ToOneClient(_)) => {
                return Err(ReplicationError::NotAuthority("call RPCs on clients"));
            }
            (Role::Authority, RpcScope::ToAuthority) => return self.invoke(caller, method, args),
            _ => {}
        }

        let entity = self.tree.get(caller).ok_or(RpcError::UnknownEntity(caller))?;
        if self.tree.is_local_only(caller) {
            return Err(RpcError::LocalOnlyCaller(caller).into());
        }
        let caller_id = entity
            .unique_id()
            .ok_or(RpcError::CallerHasNoIdentity(caller))?;

        let encoder = ValueEncoder::new(&self.tree, &self.identities);
        let params = args
            .iter()
            .map(|arg| encoder.encode(arg))
            .collect::<Result<Vec<_>, _>>()
            .map_err(RpcError::from)?;

        let envelope = Envelope::RpcCall(RpcCall {
            caller: caller_id,
            method: method.to_owned(),
            params,
        });
        match scope {
            RpcScope::ToAuthority => self.send_to_authority(&envelope),
            RpcScope::ToAllClients => self.broadcast(&envelope),
            RpcScope::ToOneClient(peer) => self.send_to_peer(peer, &envelope),
        }
    }

    /// Runs a registered method in-process, as the optimistic local copy of a
    /// call.
    pub fn invoke(&mut self, target: EntityHandle, method: &str, args: Vec<Value>) -> Result<(), ReplicationError> {
        let result = self
            .types
            .invoke(&mut self.tree, &mut self.deferred, target, method, &args, None);
        self.drain_deferred();
        result.map_err(ReplicationError::from)
    }

    /// Encodes every replicated capability. `force` ignores dirty flags;
    /// `preserve` leaves them set.
    pub fn collect_delta(&mut self, force: bool, preserve: bool) -> DeltaUpdate {
        let mut delta = DeltaUpdate::default();
        for handle in self.tree.capability_handles() {
            if self.tree.is_local_only(handle) {
                continue;
            }
            let Some(id) = self.tree.get(handle).and_then(Entity::unique_id) else {
                continue;
            };
            if self.identities.is_local_id(id) {
                continue;
            }
            let Some((entity, capability)) = self.tree.entity_and_capability_mut(handle) else {
                continue;
            };
            if let Some(payload) = capability.encode(entity, force, preserve) {
                delta.entries.insert(id, payload);
            }
        }
        delta
    }

    /// Snapshot of every replicated root-level entity. Entities that slipped
    /// into the tree without ids get them now.
    pub fn full_snapshot(&mut self) -> Result<FullSnapshot, ReplicationError> {
        let root = self.tree.root();
        let mut nodes = Vec::new();
        for handle in self.tree.children(root).to_vec() {
            if self.tree.is_local_only(handle) {
                continue;
            }
            if self.is_authority() {
                self.identities.assign_authoritative(&mut self.tree, handle)?;
            }
            if let Some(node) = graph::serialize(&self.tree, handle) {
                nodes.push(node);
            }
        }
        Ok(FullSnapshot { nodes })
    }

    fn send_full_snapshot(&mut self, peer: PeerId) -> Result<(), ReplicationError> {
        let snapshot = self.full_snapshot()?;
        log::debug!("full snapshot of {} roots to peer {peer}", snapshot.nodes.len());
        self.send_to_peer(peer, &Envelope::FullSnapshot(snapshot))?;
        if let Some(connection) = self.peers.get_mut(peer) {
            connection.snapshots_sent += 1;
        }
        Ok(())
    }

    /// Answers a resync request: every capability, forced, to `peer` only.
    /// Dirty flags stay set for the regular cycle.
    pub fn force_update(&mut self, peer: PeerId) -> Result<(), ReplicationError> {
        if !self.is_authority() {
            return Err(ReplicationError::NotAuthority("force updates"));
        }
        let delta = self.collect_delta(true, true);
        log::debug!("forced update of {} entities to peer {peer}", delta.entries.len());
        if !delta.entries.is_empty() {
            self.send_to_peer(peer, &Envelope::DeltaUpdate(delta))?;
        }
        if let Some(connection) = self.peers.get_mut(peer) {
            connection.forced_updates_sent += 1;
        }
        Ok(())
    }

    fn request_resync(&mut self, unresolved: Vec<UniqueId>) -> Result<(), ReplicationError> {
        if self.is_authority() || self.resync_requested {
            return Ok(());
        }
        self.resync_requested = true;
        log::info!("peer {} requesting resync", self.local_peer);
        self.events
            .push_back(ReplicationEvent::ResyncRequested { unresolved });
        self.send_to_authority(&Envelope::RequestForceSync)
    }

    fn send_to_authority(&mut self, envelope: &Envelope) -> Result<(), ReplicationError> {
        let text = envelope.to_json()?;
        self.transport.send_to_authority(&text)?;
        Ok(())
    }

    fn send_to_peer(&mut self, peer: PeerId, envelope: &Envelope) -> Result<(), ReplicationError> {
        let text = envelope.to_json()?;
        self.transport.send_to_client(peer, &text)?;
        Ok(())
    }

    fn broadcast(&mut self, envelope: &Envelope) -> Result<(), ReplicationError> {
        let text = envelope.to_json()?;
        self.transport.send_to_all_clients(&text)?;
        Ok(())
    }

    // ---- ticking ----

    /// One frame: fixed physics steps, then the update cycle.
    pub fn advance(&mut self, delta: f32) -> Result<(), ReplicationError> {
        self.physics_process(delta);
        self.process(delta)
    }

    pub fn physics_process(&mut self, delta: f32) {
        let dt = self.physics.step();
        for _ in 0..self.physics.steps(delta) {
            self.physics_step(dt);
        }
    }

    fn physics_step(&mut self, dt: f32) {
        let is_authority = self.is_authority();
        for handle in self.tree.capability_handles() {
            let ctx = StepContext {
                dt,
                ownership: self.ownership(handle),
                is_authority,
            };
            if let Some((entity, capability)) = self.tree.entity_and_capability_mut(handle) {
                capability.physics_step(entity, &ctx);
            }
        }
    }

    /// Update cycle: the authority sends its delta, a synced client pushes the
    /// transforms it owns.
    pub fn process(&mut self, delta: f32) -> Result<(), ReplicationError> {
        let result = if self.update_timer.advance(delta) {
            self.resync_requested = false;
            match self.role {
                Role::Authority => self.send_delta(),
                Role::Client if self.state == ConnectionState::Synced => self.push_owned(),
                Role::Client => Ok(()),
            }
        } else {
            Ok(())
        };
        self.drain_deferred();
        result
    }

    fn send_delta(&mut self) -> Result<(), ReplicationError> {
        if self.connected_peers() < self.config.min_peers_for_updates {
            return Ok(());
        }
        let delta = self.collect_delta(false, false);
        if delta.entries.is_empty() {
            return Ok(());
        }
        self.broadcast(&Envelope::DeltaUpdate(delta))
    }

    fn push_owned(&mut self) -> Result<(), ReplicationError> {
        let mut pushes = Vec::new();
        for handle in self.tree.capability_handles() {
            if self.tree.is_local_only(handle) || self.ownership(handle) != Ownership::Local {
                continue;
            }
            let (Some(entity), Some(capability)) = (self.tree.get(handle), self.tree.capability(handle)) else {
                continue;
            };
            if let Some(push) = capability.authority_push(entity) {
                pushes.push((handle, push));
            }
        }

        for (handle, push) in pushes {
            self.rpc(RpcScope::ToAuthority, handle, push.method, push.args)?;
        }
        Ok(())
    }

    fn drain_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        for op in self.deferred.take() {
            let result = match op {
                DeferredOp::Attach { parent, subtree } => self.attach(parent, subtree).map(|_| ()),
                DeferredOp::Detach(handle) => self.detach(handle).map(|_| ()),
            };
            if let Err(err) = result {
                log::warn!("deferred structural change failed: {err}");
            }
        }
    }

    // ---- helpers ----

    fn ready_subtree(&mut self, handle: EntityHandle) {
        for current in self.tree.descendants(handle) {
            if let Some((entity, capability)) = self.tree.entity_and_capability_mut(current) {
                capability.ready(entity);
            }
        }
    }

    fn register_players(&mut self, handle: EntityHandle) {
        for current in self.tree.descendants(handle) {
            let Some(entity) = self.tree.get(current) else {
                continue;
            };
            if !entity.flags.contains(GroupFlags::PLAYER) {
                continue;
            }
            let Some(peer) = entity.owner_id() else {
                log::warn!("player entity `{}` has no owner id", entity.name);
                continue;
            };
            self.players.insert(peer, current);
            self.events.push_back(ReplicationEvent::PlayerAdded {
                peer,
                handle: current,
            });
        }
    }

    fn unregister_players(&mut self, handle: EntityHandle) {
        for current in self.tree.descendants(handle) {
            if let Some(peer) = self.players.remove_entity(current) {
                self.events.push_back(ReplicationEvent::PlayerRemoved { peer });
            }
        }
    }
}

pub(crate) fn player_name(peer: PeerId) -> String {
    format!("Player_{peer}")
}

fn default_player(peer: PeerId) -> Subtree {
    Subtree::new(Entity::new(player_name(peer), "Player"))
}
