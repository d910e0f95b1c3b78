use std::any::Any;

use glam::{Vec2, Vec3};

use crate::registry::{RegistryError, RpcContext, TypeRegistry};
use crate::rpc::RpcError;
use crate::scene::{Entity, Spatial};
use crate::value::Value;

use super::{
    AuthorityPush, NetworkData, Ownership, Payload, PayloadError, StepContext, read_field,
    vec2_value, vec3_value,
};

pub const CLIENT_UPDATE_METHOD: &str = "ClientUpdate";

const SYNC_POSITION: &str = "SP";
const SYNC_ROTATION: &str = "SR";

/// Drift tolerance before a correction snaps instead of smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    pub max_distance: f32,
    /// Interpolation rate per second toward the synced value.
    pub lerp_rate: f32,
}

impl ReconcileSettings {
    pub const DEFAULT_3D: Self = Self {
        max_distance: 5.0,
        lerp_rate: 8.0,
    };

    pub const DEFAULT_2D: Self = Self {
        max_distance: 200.0,
        lerp_rate: 8.0,
    };

    fn max_distance_squared(&self) -> f32 {
        self.max_distance * self.max_distance
    }

    fn lerp_weight(&self, dt: f32) -> f32 {
        (self.lerp_rate * dt).clamp(0.0, 1.0)
    }
}

/// Position/rotation replication for `Node3D` entities.
#[derive(Debug, Clone)]
pub struct TransformSync3D {
    sync_position: Vec3,
    sync_rotation: Vec3,
    published: Option<(Vec3, Vec3)>,
    settings: ReconcileSettings,
    dirty: bool,
}

impl Default for TransformSync3D {
    fn default() -> Self {
        Self::new(ReconcileSettings::DEFAULT_3D)
    }
}

impl TransformSync3D {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self {
            sync_position: Vec3::ZERO,
            sync_rotation: Vec3::ZERO,
            published: None,
            settings,
            dirty: false,
        }
    }

    pub fn settings(&self) -> ReconcileSettings {
        self.settings
    }

    pub fn sync_position(&self) -> Vec3 {
        self.sync_position
    }

    pub fn sync_rotation(&self) -> Vec3 {
        self.sync_rotation
    }

    pub fn set_synced(&mut self, position: Vec3, rotation: Vec3) {
        self.sync_position = position;
        self.sync_rotation = rotation;
    }

    /// Applies a transform pushed by the owning client. Refused when the
    /// authority's copy has already drifted past the threshold.
    pub fn accept_client_update(&mut self, host: &Entity, position: Vec3, rotation: Vec3) -> bool {
        let Some(current) = host.position_3d() else {
            return false;
        };
        if current.distance_squared(self.sync_position) > self.settings.max_distance_squared() {
            return false;
        }
        self.sync_position = position;
        self.sync_rotation = rotation;
        self.dirty = true;
        true
    }
}

impl NetworkData for TransformSync3D {
    fn network_update(&self) -> bool {
        self.dirty
    }

    fn set_network_update(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn write_payload(&self, host: &Entity) -> Payload {
        let (position, rotation) = match &host.spatial {
            Spatial::Node3D(t) => (t.position, t.rotation),
            _ => (self.sync_position, self.sync_rotation),
        };
        let mut payload = Payload::new();
        payload.insert(SYNC_POSITION.into(), vec3_value(position));
        payload.insert(SYNC_ROTATION.into(), vec3_value(rotation));
        payload
    }

    fn read_payload(&mut self, _host: &mut Entity, payload: &Payload) -> Result<(), PayloadError> {
        self.sync_position = read_field(payload, SYNC_POSITION)?;
        self.sync_rotation = read_field(payload, SYNC_ROTATION)?;
        Ok(())
    }

    fn ready(&mut self, host: &Entity) {
        if let Spatial::Node3D(t) = &host.spatial {
            self.sync_position = t.position;
            self.sync_rotation = t.rotation;
            self.published = Some((t.position, t.rotation));
        }
    }

    fn physics_step(&mut self, host: &mut Entity, ctx: &StepContext) {
        let Spatial::Node3D(t) = &mut host.spatial else {
            return;
        };
        let drifted =
            t.position.distance_squared(self.sync_position) > self.settings.max_distance_squared();

        match ctx.ownership {
            Ownership::Remote => {
                if drifted {
                    if ctx.is_authority {
                        self.sync_position = t.position;
                        self.dirty = true;
                    } else {
                        t.position = self.sync_position;
                    }
                } else {
                    let weight = self.settings.lerp_weight(ctx.dt);
                    t.position = t.position.lerp(self.sync_position, weight);
                }
                t.rotation = self.sync_rotation;
            }
            Ownership::Local => {
                // authority correction of a client-owned entity
                if drifted && !ctx.is_authority {
                    t.position = self.sync_position;
                }
            }
        }

        if ctx.is_authority {
            let current = (t.position, t.rotation);
            if self.published != Some(current) {
                self.published = Some(current);
                self.dirty = true;
            }
        }
    }

    fn authority_push(&self, host: &Entity) -> Option<AuthorityPush> {
        let Spatial::Node3D(t) = &host.spatial else {
            return None;
        };
        Some(AuthorityPush {
            method: CLIENT_UPDATE_METHOD,
            args: vec![Value::Vector3(t.position), Value::Vector3(t.rotation)],
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Position/rotation replication for `Node2D` entities.
#[derive(Debug, Clone)]
pub struct TransformSync2D {
    sync_position: Vec2,
    sync_rotation: f32,
    published: Option<(Vec2, f32)>,
    settings: ReconcileSettings,
    dirty: bool,
}

impl Default for TransformSync2D {
    fn default() -> Self {
        Self::new(ReconcileSettings::DEFAULT_2D)
    }
}

impl TransformSync2D {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self {
            sync_position: Vec2::ZERO,
            sync_rotation: 0.0,
            published: None,
            settings,
            dirty: false,
        }
    }

    pub fn sync_position(&self) -> Vec2 {
        self.sync_position
    }

    pub fn sync_rotation(&self) -> f32 {
        self.sync_rotation
    }

    pub fn set_synced(&mut self, position: Vec2, rotation: f32) {
        self.sync_position = position;
        self.sync_rotation = rotation;
    }

    pub fn accept_client_update(&mut self, host: &Entity, position: Vec2, rotation: f32) -> bool {
        let Spatial::Node2D(t) = &host.spatial else {
            return false;
        };
        if t.position.distance_squared(self.sync_position) > self.settings.max_distance_squared() {
            return false;
        }
        self.sync_position = position;
        self.sync_rotation = rotation;
        self.dirty = true;
        true
    }
}

impl NetworkData for TransformSync2D {
    fn network_update(&self) -> bool {
        self.dirty
    }

    fn set_network_update(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn write_payload(&self, host: &Entity) -> Payload {
        let (position, rotation) = match &host.spatial {
            Spatial::Node2D(t) => (t.position, t.rotation),
            _ => (self.sync_position, self.sync_rotation),
        };
        let mut payload = Payload::new();
        payload.insert(SYNC_POSITION.into(), vec2_value(position));
        payload.insert(SYNC_ROTATION.into(), rotation.into());
        payload
    }

    fn read_payload(&mut self, _host: &mut Entity, payload: &Payload) -> Result<(), PayloadError> {
        self.sync_position = read_field(payload, SYNC_POSITION)?;
        self.sync_rotation = read_field(payload, SYNC_ROTATION)?;
        Ok(())
    }

    fn ready(&mut self, host: &Entity) {
        if let Spatial::Node2D(t) = &host.spatial {
            self.sync_position = t.position;
            self.sync_rotation = t.rotation;
            self.published = Some((t.position, t.rotation));
        }
    }

    fn physics_step(&mut self, host: &mut Entity, ctx: &StepContext) {
        let Spatial::Node2D(t) = &mut host.spatial else {
            return;
        };
        let drifted =
            t.position.distance_squared(self.sync_position) > self.settings.max_distance_squared();

        match ctx.ownership {
            Ownership::Remote => {
                if drifted {
                    if ctx.is_authority {
                        self.sync_position = t.position;
                        self.dirty = true;
                    } else {
                        t.position = self.sync_position;
                    }
                } else {
                    let weight = self.settings.lerp_weight(ctx.dt);
                    t.position = t.position.lerp(self.sync_position, weight);
                }
                t.rotation = self.sync_rotation;
            }
            Ownership::Local => {
                if drifted && !ctx.is_authority {
                    t.position = self.sync_position;
                }
            }
        }

        if ctx.is_authority {
            let current = (t.position, t.rotation);
            if self.published != Some(current) {
                self.published = Some(current);
                self.dirty = true;
            }
        }
    }

    fn authority_push(&self, host: &Entity) -> Option<AuthorityPush> {
        let Spatial::Node2D(t) = &host.spatial else {
            return None;
        };
        Some(AuthorityPush {
            method: CLIENT_UPDATE_METHOD,
            args: vec![Value::Vector2(t.position), Value::Float(t.rotation.into())],
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn client_update_3d(ctx: &mut RpcContext<'_>, args: &[Value]) -> Result<(), RpcError> {
    let position = args[0]
        .as_vector3()
        .ok_or_else(|| RpcError::argument(0, "Vector3", &args[0]))?;
    let rotation = args[1]
        .as_vector3()
        .ok_or_else(|| RpcError::argument(1, "Vector3", &args[1]))?;

    let handle = ctx.handle;
    let (host, sync) = ctx.entity_and_capability::<TransformSync3D>()?;
    if !sync.accept_client_update(host, position, rotation) {
        log::debug!("rejected client transform for {handle:?}: drifted too far");
    }
    Ok(())
}

fn client_update_2d(ctx: &mut RpcContext<'_>, args: &[Value]) -> Result<(), RpcError> {
    let position = args[0]
        .as_vector2()
        .ok_or_else(|| RpcError::argument(0, "Vector2", &args[0]))?;
    let rotation = args[1]
        .as_float()
        .ok_or_else(|| RpcError::argument(1, "Float", &args[1]))?;

    let handle = ctx.handle;
    let (host, sync) = ctx.entity_and_capability::<TransformSync2D>()?;
    if !sync.accept_client_update(host, position, rotation as f32) {
        log::debug!("rejected client transform for {handle:?}: drifted too far");
    }
    Ok(())
}

/// Gives `type_name` a [`TransformSync3D`] and its `ClientUpdate` method.
pub fn register_transform_3d(
    types: &mut TypeRegistry,
    type_name: &str,
    settings: ReconcileSettings,
) -> Result<(), RegistryError> {
    types.register_capability(type_name, move || Box::new(TransformSync3D::new(settings)))?;
    types.register_method(type_name, CLIENT_UPDATE_METHOD, 2, client_update_3d)
}

/// Gives `type_name` a [`TransformSync2D`] and its `ClientUpdate` method.
pub fn register_transform_2d(
    types: &mut TypeRegistry,
    type_name: &str,
    settings: ReconcileSettings,
) -> Result<(), RegistryError> {
    types.register_capability(type_name, move || Box::new(TransformSync2D::new(settings)))?;
    types.register_method(type_name, CLIENT_UPDATE_METHOD, 2, client_update_2d)
}
