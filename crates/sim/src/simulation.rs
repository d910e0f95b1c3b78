use std::collections::VecDeque;

use anyhow::{Context, Result};
use glam::Vec3;

use canopy::{
    ButtonSync, ControlLayout, Entity, EntityHandle, LoopbackHub, LoopbackTransport, PeerId,
    ReplicationEvent, Replicator, RpcScope, Spatial, Subtree, TransformSync3D, TypeRegistry,
    UniqueId, register_button, register_transform_3d,
};

use crate::config::SimConfig;

const CRATE_RADIUS: f32 = 4.0;
const PLAYER_SWAY: f32 = 1.5;

fn types(config: &SimConfig) -> Result<TypeRegistry> {
    let replication = config.replication();
    let mut types = TypeRegistry::new();
    register_transform_3d(&mut types, "Crate", replication.reconcile_3d)?;
    register_transform_3d(&mut types, "Player", replication.reconcile_3d)?;
    register_button(&mut types, "Button")?;
    Ok(types)
}

fn player(_peer: PeerId) -> Subtree {
    Subtree::new(Entity::node3d("player", "Player", Vec3::ZERO))
        .with_capability(TransformSync3D::default())
}

fn crate_at(position: Vec3) -> Subtree {
    Subtree::new(Entity::node3d("crate", "Crate", position))
        .with_capability(TransformSync3D::default())
}

fn set_position<T: canopy::Transport>(replicator: &mut Replicator<T>, handle: EntityHandle, position: Vec3) {
    if let Some(Spatial::Node3D(transform)) = replicator.entity_mut(handle).map(|e| &mut e.spatial) {
        transform.position = position;
    }
}

/// One authority and its clients on a loopback hub, driven frame by frame.
pub struct Simulation {
    config: SimConfig,
    hub: LoopbackHub,
    authority: Replicator<LoopbackTransport>,
    clients: Vec<Replicator<LoopbackTransport>>,
    crates: VecDeque<EntityHandle>,
    button: EntityHandle,
    button_id: UniqueId,
    presses_seen: u32,
    failed_deliveries: u32,
    spawned: u32,
    elapsed: f32,
    press_timer: f32,
    respawn_timer: f32,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        let hub = LoopbackHub::new();
        let replication = config.replication();

        let mut authority = Replicator::authority(
            replication.clone(),
            types(&config)?,
            hub.endpoint(PeerId::AUTHORITY),
        );
        authority.set_player_factory(player);
        authority.spawn_local_player()?;

        let root = authority.tree().root();
        let lobby = authority.attach(
            root,
            Subtree::new(Entity::control("lobby", "Panel", ControlLayout::default())).with_child(
                Subtree::new(Entity::control("start", "Button", ControlLayout::default()))
                    .with_capability(ButtonSync::new("Start")),
            ),
        )?;
        let button = authority
            .tree()
            .find_child(lobby, "start")
            .context("lobby has no start button")?;
        let button_id = authority
            .entity(button)
            .and_then(Entity::unique_id)
            .context("start button has no identity")?;

        let mut crates = VecDeque::new();
        for index in 0..config.crates {
            let handle = authority.attach(root, crate_at(Self::crate_position(index as u32, 0.0)))?;
            crates.push_back(handle);
        }

        let mut simulation = Self {
            hub,
            authority,
            clients: Vec::new(),
            crates,
            button,
            button_id,
            presses_seen: 0,
            failed_deliveries: 0,
            spawned: config.crates as u32,
            elapsed: 0.0,
            press_timer: 0.0,
            respawn_timer: 0.0,
            config,
        };

        for index in 0..simulation.config.clients {
            simulation.connect(PeerId(index as u32 + 2))?;
        }
        simulation.pump();
        simulation.log_events();
        Ok(simulation)
    }

    fn crate_position(index: u32, time: f32) -> Vec3 {
        let angle = time + index as f32 * 1.3;
        Vec3::new(angle.cos() * CRATE_RADIUS, 0.5, angle.sin() * CRATE_RADIUS)
    }

    fn connect(&mut self, peer: PeerId) -> Result<()> {
        let mut client = Replicator::client(
            peer,
            self.config.replication(),
            types(&self.config)?,
            self.hub.endpoint(peer),
        );
        client.connection_accepted();

        let root = client.tree().root();
        client.attach(root, Subtree::new(Entity::new("hud", "Node").with_group("LocalOnly")))?;

        self.authority.peer_connected(peer)?;
        self.clients.push(client);
        Ok(())
    }

    /// Delivers queued envelopes until every inbox is empty. Envelopes that
    /// fail for reasons other than an expected discard are counted.
    pub fn pump(&mut self) {
        while self.hub.pending() > 0 {
            for delivery in self.hub.drain(PeerId::AUTHORITY) {
                if let Err(err) = self.authority.receive(delivery.from, &delivery.envelope) {
                    self.failed_deliveries += u32::from(!err.is_discard());
                }
            }
            for client in &mut self.clients {
                for delivery in self.hub.drain(client.local_peer()) {
                    if let Err(err) = client.receive(delivery.from, &delivery.envelope) {
                        self.failed_deliveries += u32::from(!err.is_discard());
                    }
                }
            }
        }
    }

    pub fn frame(&mut self, dt: f32) -> Result<()> {
        self.elapsed += dt;
        self.press_timer += dt;
        self.respawn_timer += dt;

        self.move_crates();
        self.move_players()?;

        if self.press_timer >= self.config.press_every && !self.clients.is_empty() {
            self.press_timer = 0.0;
            self.press_button()?;
        }
        if self.respawn_timer >= self.config.respawn_every {
            self.respawn_timer = 0.0;
            self.respawn_crate()?;
        }

        self.authority.advance(dt)?;
        for client in &mut self.clients {
            client.advance(dt)?;
        }
        self.pump();

        self.relabel_button();
        self.log_events();
        Ok(())
    }

    fn move_crates(&mut self) {
        let handles: Vec<EntityHandle> = self.crates.iter().copied().collect();
        for (index, handle) in handles.into_iter().enumerate() {
            let position = Self::crate_position(index as u32, self.elapsed);
            set_position(&mut self.authority, handle, position);
        }
    }

    fn move_players(&mut self) -> Result<()> {
        let elapsed = self.elapsed;
        for client in &mut self.clients {
            let Some(own) = client.local_player()? else {
                continue;
            };
            let lane = client.local_peer().0 as f32 * 2.0;
            let position = Vec3::new(lane, 0.0, (elapsed + lane).sin() * PLAYER_SWAY);
            set_position(client, own, position);
        }
        Ok(())
    }

    fn press_button(&mut self) -> Result<()> {
        let index = (self.elapsed / self.config.press_every) as usize % self.clients.len();
        let client = &mut self.clients[index];
        let Some(button) = client.resolve(self.button_id) else {
            log::warn!("peer {} does not know the start button yet", client.local_peer());
            return Ok(());
        };
        log::info!("peer {} presses the start button", client.local_peer());
        client.rpc(RpcScope::ToAuthority, button, "Press", Vec::new())?;
        Ok(())
    }

    fn respawn_crate(&mut self) -> Result<()> {
        if let Some(oldest) = self.crates.pop_front() {
            self.authority.detach(oldest)?;
        }
        let root = self.authority.tree().root();
        let handle = self
            .authority
            .attach(root, crate_at(Self::crate_position(self.spawned, self.elapsed)))?;
        self.spawned += 1;
        self.crates.push_back(handle);
        Ok(())
    }

    fn relabel_button(&mut self) {
        let Some(button) = self.authority.capability_mut::<ButtonSync>(self.button) else {
            return;
        };
        if button.presses() != self.presses_seen {
            self.presses_seen = button.presses();
            button.set_text(format!("Pressed {}", self.presses_seen));
        }
    }

    fn log_events(&mut self) {
        for event in self.authority.drain_events() {
            match event {
                ReplicationEvent::PlayerAdded { peer, handle } => {
                    log::info!("authority: player for peer {peer} is {handle:?}");
                }
                ReplicationEvent::PlayerRemoved { peer } => {
                    log::info!("authority: player for peer {peer} removed");
                }
                other => log::debug!("authority: {other:?}"),
            }
        }
        for client in &mut self.clients {
            let peer = client.local_peer();
            for event in client.drain_events() {
                match event {
                    ReplicationEvent::Synced => log::info!("peer {peer}: synced"),
                    ReplicationEvent::ResyncRequested { unresolved } => {
                        log::info!("peer {peer}: resync requested for {unresolved:?}");
                    }
                    other => log::debug!("peer {peer}: {other:?}"),
                }
            }
        }
    }

    /// Compares every client against the authority. True when all agree.
    pub fn report(&self) -> bool {
        let expected = self.authority.replicated_count();
        let stats = self.hub.stats();
        log::info!(
            "authority: {expected} replicated entities, {} messages ({} bytes), {} dropped",
            stats.messages_sent,
            stats.bytes_sent,
            stats.messages_dropped
        );

        let mut consistent = true;
        if self.failed_deliveries > 0 {
            consistent = false;
            log::warn!("{} envelopes failed to apply", self.failed_deliveries);
        }
        for client in &self.clients {
            let count = client.replicated_count();
            let text = client
                .resolve(self.button_id)
                .and_then(|handle| client.capability::<ButtonSync>(handle))
                .map(|button| button.text.clone())
                .unwrap_or_default();

            if count == expected {
                log::info!("peer {}: {count} entities, in sync, button reads {text:?}", client.local_peer());
            } else {
                consistent = false;
                log::warn!(
                    "peer {}: {count} entities, authority has {expected}",
                    client.local_peer()
                );
            }
        }
        consistent
    }

    /// Disconnects every client from both ends.
    pub fn shutdown(&mut self) -> Result<()> {
        for client in &mut self.clients {
            let peer = client.local_peer();
            self.hub.disconnect(peer);
            self.authority.peer_disconnected(peer)?;
            client.disconnected()?;
        }
        self.log_events();
        Ok(())
    }
}
