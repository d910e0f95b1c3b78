use std::collections::BTreeMap;

use canopy::net::{DeltaUpdate, StructuralAdd, StructuralRemove};
use canopy::value::CodecError;
use canopy::{
    ButtonSync, ConnectionState, Entity, EntityHandle, Envelope, LoopbackHub, LoopbackTransport,
    PeerId, RecordingTransport, ReconcileSettings, ReplicationConfig, ReplicationError,
    ReplicationEvent, Replicator, Route, RpcError, RpcScope, Spatial, Subtree, TransformSync3D,
    TypeRegistry, UniqueId, Value, register_button, register_transform_3d,
};
use glam::Vec3;
use serde_json::json;

const FRAME: f32 = 0.05;

fn types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    register_transform_3d(&mut types, "Crate", ReconcileSettings::DEFAULT_3D).unwrap();
    register_transform_3d(&mut types, "Player", ReconcileSettings::DEFAULT_3D).unwrap();
    register_button(&mut types, "Button").unwrap();
    types
}

fn authority() -> Replicator<RecordingTransport> {
    Replicator::authority(ReplicationConfig::default(), types(), RecordingTransport::new())
}

fn client(peer: u32) -> Replicator<RecordingTransport> {
    let mut client = Replicator::client(
        PeerId(peer),
        ReplicationConfig::default(),
        types(),
        RecordingTransport::new(),
    );
    client.connection_accepted();
    client
}

fn moving_players<T: canopy::Transport>(replicator: &mut Replicator<T>) {
    replicator.set_player_factory(|_| {
        Subtree::new(Entity::node3d("player", "Player", Vec3::ZERO))
            .with_capability(TransformSync3D::default())
    });
}

fn transform_payload(position: Vec3) -> canopy::Payload {
    json!({"SP": position.to_array(), "SR": [0.0, 0.0, 0.0]})
        .as_object()
        .unwrap()
        .clone()
}

fn crate_at(position: Vec3) -> Subtree {
    Subtree::new(Entity::node3d("crate", "Crate", position)).with_capability(TransformSync3D::default())
}

fn button(text: &str) -> Subtree {
    Subtree::new(Entity::new("button", "Button")).with_capability(ButtonSync::new(text))
}

/// Hands everything `from` sent that is addressed to `to` over to `to`.
fn deliver(
    from: &mut Replicator<RecordingTransport>,
    to: &mut Replicator<RecordingTransport>,
) -> Vec<Result<(), ReplicationError>> {
    let sender = from.local_peer();
    let receiver = to.local_peer();
    let to_authority = to.is_authority();

    from.transport_mut()
        .take()
        .into_iter()
        .filter(|(route, _)| match route {
            Route::Authority => to_authority,
            Route::Client(peer) => *peer == receiver,
            Route::AllClients => !to_authority,
        })
        .map(|(_, text)| to.receive(sender, &text))
        .collect()
}

fn synced_pair() -> (Replicator<RecordingTransport>, Replicator<RecordingTransport>) {
    let mut server = authority();
    let mut peer = client(2);
    server.peer_connected(PeerId(2)).unwrap();
    for result in deliver(&mut server, &mut peer) {
        // the player add races the snapshot and is gated
        assert!(accepted(&result));
    }
    assert_eq!(peer.state(), ConnectionState::Synced);
    (server, peer)
}

fn sent_deltas(transport: &RecordingTransport) -> Vec<(Route, DeltaUpdate)> {
    transport
        .decoded()
        .unwrap()
        .into_iter()
        .filter_map(|(route, envelope)| match envelope {
            Envelope::DeltaUpdate(delta) => Some((route, delta)),
            _ => None,
        })
        .collect()
}

fn uid(replicator: &Replicator<impl canopy::Transport>, handle: EntityHandle) -> UniqueId {
    replicator.entity(handle).and_then(Entity::unique_id).unwrap()
}

/// Ok, or dropped on purpose (gated or duplicate).
fn accepted(result: &Result<(), ReplicationError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => err.is_discard(),
    }
}

/// Delivers until the hub is idle. Returns how many envelopes failed outright.
fn pump(hub: &LoopbackHub, replicators: &mut [&mut Replicator<LoopbackTransport>]) -> usize {
    let mut failures = 0;
    while hub.pending() > 0 {
        for replicator in replicators.iter_mut() {
            for delivery in hub.drain(replicator.local_peer()) {
                if !accepted(&replicator.receive(delivery.from, &delivery.envelope)) {
                    failures += 1;
                }
            }
        }
    }
    failures
}

#[test]
fn test_dirty_capability_is_published_once() {
    let mut server = authority();
    let root = server.tree().root();
    for index in 0..6 {
        server.attach(root, Subtree::new(Entity::new(format!("n{index}"), "Node"))).unwrap();
    }
    let ok = server.attach(root, button("OK")).unwrap();
    assert_eq!(uid(&server, ok), UniqueId(7));

    // alone on the network: nothing to send
    server.transport_mut().take();
    server.advance(FRAME).unwrap();
    assert!(server.transport().sent.is_empty());

    server.peer_connected(PeerId(2)).unwrap();
    server.transport_mut().take();

    server.advance(FRAME).unwrap();
    let deltas = sent_deltas(server.transport());
    assert_eq!(deltas.len(), 1);
    let (route, delta) = &deltas[0];
    assert_eq!(*route, Route::AllClients);
    assert_eq!(delta.entries.len(), 1);
    assert_eq!(delta.entries[&UniqueId(7)]["TX"], json!("OK"));

    let raw: serde_json::Value = serde_json::from_str(&server.transport().sent[0].1).unwrap();
    assert_eq!(raw["DAT"], json!(1));
    assert_eq!(raw["NN"]["7"]["TX"], json!("OK"));

    server.transport_mut().take();
    server.advance(FRAME).unwrap();
    assert!(server.transport().sent.is_empty());
}

#[test]
fn test_local_only_capabilities_stay_home() {
    let mut server = authority();
    let root = server.tree().root();
    let hud = server
        .attach(
            root,
            Subtree::new(Entity::new("hud", "Node").with_group("LocalOnly")).with_child(button("menu")),
        )
        .unwrap();
    server.peer_connected(PeerId(2)).unwrap();
    server.transport_mut().take();

    assert!(server.identities().is_local_id(uid(&server, hud)));
    assert!(server.collect_delta(true, true).entries.is_empty());

    server.advance(FRAME).unwrap();
    assert!(server.transport().sent.is_empty());
}

#[test]
fn test_structural_add_lands_under_known_parent() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let shelf = server.attach(root, Subtree::new(Entity::new("shelf", "Node"))).unwrap();
    deliver(&mut server, &mut peer);

    let parent_id = uid(&server, shelf);
    let item = server.attach(shelf, crate_at(Vec3::new(1.0, 0.0, 0.0))).unwrap();
    let item_id = uid(&server, item);

    let sent = server.transport().decoded().unwrap();
    let Some((Route::AllClients, Envelope::StructuralAdd(add))) = sent.last() else {
        panic!("expected a structural add, got {sent:?}");
    };
    assert_eq!(add.parent, parent_id);
    assert_eq!(add.node.unique_id(), Some(item_id));

    let raw: serde_json::Value = serde_json::from_str(&server.transport().sent[0].1).unwrap();
    assert_eq!(raw["DAT"], json!(4));
    assert_eq!(raw["Owner"], json!(parent_id.to_string()));

    for result in deliver(&mut server, &mut peer) {
        result.unwrap();
    }
    let copy = peer.resolve(item_id).unwrap();
    assert_eq!(peer.tree().parent(copy), peer.resolve(parent_id));
    assert_eq!(
        peer.entity(copy).and_then(Entity::position_3d),
        Some(Vec3::new(1.0, 0.0, 0.0))
    );
    assert!(peer.capability::<TransformSync3D>(copy).is_some());
}

#[test]
fn test_structural_add_is_idempotent() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    server.attach(root, crate_at(Vec3::ZERO)).unwrap();
    let (_, add) = server.transport_mut().take().pop().unwrap();

    peer.receive(PeerId::AUTHORITY, &add).unwrap();
    let entities = peer.tree().len();
    assert!(matches!(
        peer.receive(PeerId::AUTHORITY, &add),
        Err(ReplicationError::DuplicateStructuralAdd(_))
    ));
    assert_eq!(peer.tree().len(), entities);
}

#[test]
fn test_messages_before_the_snapshot_are_gated() {
    let mut server = authority();
    let root = server.tree().root();
    let item = server.attach(root, crate_at(Vec3::ZERO)).unwrap();
    let add = server.transport_mut().take().pop().unwrap().1;
    let delta = Envelope::DeltaUpdate(DeltaUpdate {
        entries: BTreeMap::from([(uid(&server, item), transform_payload(Vec3::X))]),
    })
    .to_json()
    .unwrap();

    let mut peer = Replicator::client(
        PeerId(2),
        ReplicationConfig::default(),
        types(),
        RecordingTransport::new(),
    );
    assert!(matches!(
        peer.receive(PeerId::AUTHORITY, &delta),
        Err(ReplicationError::Gated(canopy::DataType::DeltaUpdate))
    ));

    peer.connection_accepted();
    assert_eq!(peer.state(), ConnectionState::AwaitingSnapshot);
    assert!(matches!(
        peer.receive(PeerId::AUTHORITY, &add),
        Err(ReplicationError::Gated(canopy::DataType::StructuralAdd))
    ));
    assert!(matches!(
        peer.receive(PeerId::AUTHORITY, &delta),
        Err(ReplicationError::Gated(_))
    ));
    assert_eq!(peer.replicated_count(), 0);

    let snapshot = Envelope::FullSnapshot(server.full_snapshot().unwrap()).to_json().unwrap();
    peer.receive(PeerId::AUTHORITY, &snapshot).unwrap();
    assert_eq!(peer.state(), ConnectionState::Synced);
    assert!(peer.drain_events().any(|event| event == ReplicationEvent::Synced));

    peer.receive(PeerId::AUTHORITY, &delta).unwrap();
    let copy = peer.resolve(uid(&server, item)).unwrap();
    assert_eq!(
        peer.capability::<TransformSync3D>(copy).unwrap().sync_position(),
        Vec3::new(1.0, 0.0, 0.0)
    );
}

#[test]
fn test_unknown_identity_in_delta_is_dropped() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let ok = server.attach(root, button("OK")).unwrap();
    deliver(&mut server, &mut peer);

    let payload = json!({"TX": "late", "TM": false, "AM": 1, "BM": 1, "AL": 1})
        .as_object()
        .unwrap()
        .clone();
    let unknown = Envelope::DeltaUpdate(DeltaUpdate {
        entries: BTreeMap::from([(UniqueId(55), payload.clone())]),
    })
    .to_json()
    .unwrap();

    assert!(matches!(
        peer.receive(PeerId::AUTHORITY, &unknown),
        Err(ReplicationError::UnresolvedReference(UniqueId(55)))
    ));
    let requests = peer.transport_mut().take();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, Route::Authority);
    assert!(matches!(
        Envelope::from_json(&requests[0].1).unwrap(),
        Envelope::RequestForceSync
    ));

    // one request per cycle
    let _ = peer.receive(PeerId::AUTHORITY, &unknown);
    assert!(peer.transport().sent.is_empty());

    let known = Envelope::DeltaUpdate(DeltaUpdate {
        entries: BTreeMap::from([(uid(&server, ok), payload)]),
    })
    .to_json()
    .unwrap();
    peer.receive(PeerId::AUTHORITY, &known).unwrap();
    let copy = peer.resolve(uid(&server, ok)).unwrap();
    assert_eq!(peer.capability::<ButtonSync>(copy).unwrap().text, "late");
}

#[test]
fn test_client_snaps_drifted_transform() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let item = server.attach(root, crate_at(Vec3::ZERO)).unwrap();
    deliver(&mut server, &mut peer);

    let copy = peer.resolve(uid(&server, item)).unwrap();
    if let Some(Spatial::Node3D(t)) = peer.entity_mut(copy).map(|e| &mut e.spatial) {
        t.position = Vec3::new(10.0, 0.0, 0.0);
    }
    peer.physics_process(0.02);

    assert_eq!(peer.entity(copy).and_then(Entity::position_3d), Some(Vec3::ZERO));
}

#[test]
fn test_rpc_reaches_the_authority_and_clients() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let ok = server.attach(root, button("OK")).unwrap();
    deliver(&mut server, &mut peer);
    let copy = peer.resolve(uid(&server, ok)).unwrap();

    peer.rpc(RpcScope::ToAuthority, copy, "Press", Vec::new()).unwrap();
    for result in deliver(&mut peer, &mut server) {
        result.unwrap();
    }
    assert_eq!(server.capability::<ButtonSync>(ok).unwrap().presses(), 1);

    server
        .rpc(RpcScope::ToAllClients, ok, "SetText", vec![Value::from("Go")])
        .unwrap();
    for result in deliver(&mut server, &mut peer) {
        result.unwrap();
    }
    assert_eq!(peer.capability::<ButtonSync>(copy).unwrap().text, "Go");

    assert!(matches!(
        peer.rpc(RpcScope::ToAllClients, copy, "SetText", vec![Value::from("x")]),
        Err(ReplicationError::NotAuthority(_))
    ));
    let peer_root = peer.tree().root();
    let local = peer.attach(peer_root, button("local")).unwrap();
    assert!(matches!(
        peer.rpc(RpcScope::ToAuthority, local, "Press", Vec::new()),
        Err(ReplicationError::RpcDispatch(RpcError::LocalOnlyCaller(_)))
    ));
    assert!(matches!(
        peer.detach(copy),
        Err(ReplicationError::NotAuthority(_))
    ));
}

#[test]
fn test_rpc_with_non_finite_argument_is_not_sent() {
    let (mut server, _peer) = synced_pair();
    let root = server.tree().root();
    let ok = server.attach(root, button("OK")).unwrap();
    server.transport_mut().take();

    let err = server
        .rpc(RpcScope::ToAllClients, ok, "Toggled", vec![Value::Float(f64::NAN)])
        .unwrap_err();
    assert!(matches!(
        err,
        ReplicationError::RpcDispatch(RpcError::Codec(CodecError::NonFiniteFloat(_)))
    ));
    assert!(server.transport().sent.is_empty());
}

#[test]
fn test_rpc_entity_arguments_travel_as_identities() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let ok = server.attach(root, button("OK")).unwrap();
    let item = server.attach(root, crate_at(Vec3::ZERO)).unwrap();
    deliver(&mut server, &mut peer);

    server
        .rpc(
            RpcScope::ToOneClient(PeerId(2)),
            ok,
            "Toggled",
            vec![Value::from(true)],
        )
        .unwrap();
    let sent = server.transport().decoded().unwrap();
    assert!(matches!(sent[0].0, Route::Client(PeerId(2))));
    deliver(&mut server, &mut peer);
    let copy = peer.resolve(uid(&server, ok)).unwrap();
    assert!(peer.capability::<ButtonSync>(copy).unwrap().is_toggled_on());

    // arity is checked on the receiving side
    server
        .rpc(RpcScope::ToAllClients, ok, "Toggled", vec![Value::from(item), Value::from(true)])
        .unwrap();
    let results = deliver(&mut server, &mut peer);
    assert!(matches!(
        results[0],
        Err(ReplicationError::RpcDispatch(RpcError::ArityMismatch { .. }))
    ));
}

#[test]
fn test_forced_update_goes_to_the_requester_only() {
    let mut server = authority();
    let root = server.tree().root();
    let ok = server.attach(root, button("OK")).unwrap();
    server.peer_connected(PeerId(2)).unwrap();
    server.peer_connected(PeerId(3)).unwrap();
    server.transport_mut().take();

    let request = Envelope::RequestForceSync.to_json().unwrap();
    server.receive(PeerId(2), &request).unwrap();
    let forced = sent_deltas(server.transport());
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].0, Route::Client(PeerId(2)));
    assert!(forced[0].1.entries.contains_key(&uid(&server, ok)));
    assert_eq!(server.peers().get(PeerId(2)).unwrap().forced_updates_sent, 1);

    // the regular cycle still carries the pending change to everyone
    server.transport_mut().take();
    server.advance(FRAME).unwrap();
    let regular = sent_deltas(server.transport());
    assert_eq!(regular.len(), 1);
    assert_eq!(regular[0].0, Route::AllClients);
    assert!(regular[0].1.entries.contains_key(&uid(&server, ok)));
}

#[test]
fn test_pending_add_is_retried_once_the_parent_arrives() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let shelf = server.attach(root, Subtree::new(Entity::new("shelf", "Node"))).unwrap();
    let item = server.attach(shelf, crate_at(Vec3::ONE)).unwrap();

    let mut sent = server.transport_mut().take();
    let (_, item_add) = sent.pop().unwrap();
    let (_, shelf_add) = sent.pop().unwrap();

    let shelf_id = uid(&server, shelf);
    assert!(matches!(
        peer.receive(PeerId::AUTHORITY, &item_add),
        Err(ReplicationError::UnresolvedReference(id)) if id == shelf_id
    ));
    assert_eq!(peer.pending_adds(), 1);

    peer.receive(PeerId::AUTHORITY, &shelf_add).unwrap();
    assert_eq!(peer.pending_adds(), 0);
    let copy = peer.resolve(uid(&server, item)).unwrap();
    assert_eq!(peer.tree().parent(copy), peer.resolve(shelf_id));
}

#[test]
fn test_structural_remove_frees_the_subtree() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let shelf = server
        .attach(root, Subtree::new(Entity::new("shelf", "Node")).with_child(button("OK")))
        .unwrap();
    deliver(&mut server, &mut peer);
    let shelf_id = uid(&server, shelf);
    let before = peer.tree().len();

    server.detach(shelf).unwrap();
    let sent = server.transport().decoded().unwrap();
    assert!(matches!(&sent[0].1, Envelope::StructuralRemove(remove) if remove.unique_id == shelf_id));

    for result in deliver(&mut server, &mut peer) {
        result.unwrap();
    }
    assert_eq!(peer.tree().len(), before - 2);
    assert!(peer.resolve(shelf_id).is_none());

    // removing an unknown identity is a no-op
    let stale = Envelope::StructuralRemove(StructuralRemove { unique_id: shelf_id })
        .to_json()
        .unwrap();
    peer.receive(PeerId::AUTHORITY, &stale).unwrap();
}

#[test]
fn test_snapshot_merges_into_known_entities() {
    let (mut server, mut peer) = synced_pair();
    let root = server.tree().root();
    let shelf = server.attach(root, Subtree::new(Entity::new("shelf", "Node"))).unwrap();
    deliver(&mut server, &mut peer);

    // the client missed this add
    server.attach(shelf, button("late")).unwrap();
    server.transport_mut().take();
    let entities = peer.tree().len();

    let snapshot = Envelope::FullSnapshot(server.full_snapshot().unwrap()).to_json().unwrap();
    peer.receive(PeerId::AUTHORITY, &snapshot).unwrap();

    assert_eq!(peer.tree().len(), entities + 1);
    assert_eq!(peer.replicated_count(), server.replicated_count());
}

#[test]
fn test_loopback_clients_converge() {
    let hub = LoopbackHub::new();
    let config = ReplicationConfig::default();
    let mut server = Replicator::authority(config.clone(), types(), hub.endpoint(PeerId::AUTHORITY));
    let mut alice = Replicator::client(PeerId(2), config.clone(), types(), hub.endpoint(PeerId(2)));
    let mut bob = Replicator::client(PeerId(3), config, types(), hub.endpoint(PeerId(3)));
    moving_players(&mut server);

    let root = server.tree().root();
    let item = server.attach(root, crate_at(Vec3::ZERO)).unwrap();

    alice.connection_accepted();
    bob.connection_accepted();
    server.peer_connected(PeerId(2)).unwrap();
    server.peer_connected(PeerId(3)).unwrap();
    assert_eq!(pump(&hub, &mut [&mut server, &mut alice, &mut bob]), 0);

    assert_eq!(alice.state(), ConnectionState::Synced);
    assert_eq!(bob.state(), ConnectionState::Synced);
    assert_eq!(alice.replicated_count(), server.replicated_count());
    assert_eq!(bob.replicated_count(), server.replicated_count());
    assert!(alice.local_player().unwrap().is_some());

    if let Some(Spatial::Node3D(t)) = server.entity_mut(item).map(|e| &mut e.spatial) {
        t.position = Vec3::new(2.0, 0.0, 0.0);
    }
    server.advance(FRAME).unwrap();
    assert_eq!(pump(&hub, &mut [&mut server, &mut alice, &mut bob]), 0);

    let item_id = uid(&server, item);
    for peer in [&alice, &bob] {
        let copy = peer.resolve(item_id).unwrap();
        assert_eq!(
            peer.capability::<TransformSync3D>(copy).unwrap().sync_position(),
            Vec3::new(2.0, 0.0, 0.0)
        );
    }
}

#[test]
fn test_owned_transform_is_pushed_to_the_authority() {
    let hub = LoopbackHub::new();
    let config = ReplicationConfig::default();
    let mut server = Replicator::authority(config.clone(), types(), hub.endpoint(PeerId::AUTHORITY));
    let mut alice = Replicator::client(PeerId(2), config, types(), hub.endpoint(PeerId(2)));
    moving_players(&mut server);

    alice.connection_accepted();
    let player = server.peer_connected(PeerId(2)).unwrap();
    assert_eq!(pump(&hub, &mut [&mut server, &mut alice]), 0);

    let own = alice.local_player().unwrap().unwrap();
    if let Some(Spatial::Node3D(t)) = alice.entity_mut(own).map(|e| &mut e.spatial) {
        t.position = Vec3::new(1.0, 0.0, 0.0);
    }
    alice.advance(FRAME).unwrap();
    assert_eq!(pump(&hub, &mut [&mut server, &mut alice]), 0);

    assert_eq!(
        server.capability::<TransformSync3D>(player).unwrap().sync_position(),
        Vec3::new(1.0, 0.0, 0.0)
    );
    // the owner is not pulled back toward its own stale copy
    assert_eq!(
        alice.entity(own).and_then(Entity::position_3d),
        Some(Vec3::new(1.0, 0.0, 0.0))
    );
}

#[test]
fn test_disconnect_cascades() {
    let mut server = authority();
    let mut alice = client(2);
    let mut bob = client(3);
    let alice_player = server.peer_connected(PeerId(2)).unwrap();
    let alice_id = uid(&server, alice_player);
    server.peer_connected(PeerId(3)).unwrap();

    let sent = server.transport_mut().take();
    for (route, text) in &sent {
        if matches!(route, Route::AllClients | Route::Client(PeerId(2))) {
            assert!(accepted(&alice.receive(PeerId::AUTHORITY, text)));
        }
        if matches!(route, Route::AllClients | Route::Client(PeerId(3))) {
            assert!(accepted(&bob.receive(PeerId::AUTHORITY, text)));
        }
    }
    assert!(bob.resolve(alice_id).is_some());
    server.drain_events().count();

    server.peer_disconnected(PeerId(2)).unwrap();
    assert!(server.resolve(alice_id).is_none());
    assert!(server
        .drain_events()
        .any(|event| event == ReplicationEvent::PlayerRemoved { peer: PeerId(2) }));

    for result in deliver(&mut server, &mut bob) {
        result.unwrap();
    }
    assert!(bob.resolve(alice_id).is_none());

    // the client side tears down to a clean slate, keeping local entities
    let alice_root = alice.tree().root();
    let hud = alice.attach(alice_root, button("hud")).unwrap();
    alice.disconnected().unwrap();
    assert_eq!(alice.state(), ConnectionState::Connecting);
    assert_eq!(alice.replicated_count(), 0);
    assert!(alice.tree().contains(hud));
    assert!(alice.local_player().unwrap().is_none());
}

#[test]
fn test_client_teardown_keeps_local_identities() {
    let (_server, mut peer) = synced_pair();
    let root = peer.tree().root();
    let hud = peer.attach(root, Subtree::new(Entity::new("hud", "Node"))).unwrap();
    let hud_id = uid(&peer, hud);

    peer.disconnected().unwrap();
    assert!(peer.tree().contains(hud));
    assert_eq!(peer.resolve(hud_id), Some(hud));
    assert_eq!(peer.resolve(UniqueId::ROOT), Some(root));
}

#[test]
fn test_attach_under_unbound_parent_is_refused() {
    let mut server = authority();
    let root = server.tree().root();
    let raw = server
        .tree_mut()
        .insert(root, Subtree::new(Entity::new("raw", "Node")))
        .unwrap();
    server.drain_events().count();

    let err = server.attach(raw, crate_at(Vec3::ZERO)).unwrap_err();
    assert!(matches!(err, ReplicationError::UnboundParent(parent) if parent == raw));
    assert!(server.tree().children(raw).is_empty());
    assert_eq!(server.drain_events().count(), 0);
    assert!(server.transport().sent.is_empty());
}

#[test]
fn test_deferred_structural_changes_apply_after_dispatch() {
    let mut server = authority();
    let root = server.tree().root();
    let ok = server.attach(root, button("OK")).unwrap();
    server.deferred_mut().detach(ok);
    server.deferred_mut().attach(root, crate_at(Vec3::ZERO));
    server.transport_mut().take();

    server.process(0.0).unwrap();
    assert!(!server.tree().contains(ok));
    let sent = server.transport().decoded().unwrap();
    assert!(matches!(sent[0].1, Envelope::StructuralRemove(_)));
    assert!(matches!(sent[1].1, Envelope::StructuralAdd(StructuralAdd { parent: UniqueId::ROOT, .. })));
}
