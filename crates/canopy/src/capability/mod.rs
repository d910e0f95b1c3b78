mod button;
mod transform;

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;

use crate::scene::Entity;
use crate::value::Value;

pub use button::{ButtonSync, PRESS_METHOD, SET_TEXT_METHOD, TOGGLED_METHOD, register_button};
pub use transform::{
    CLIENT_UPDATE_METHOD, ReconcileSettings, TransformSync2D, TransformSync3D,
    register_transform_2d, register_transform_3d,
};

/// Capability state as it travels inside `NN` and `IND`.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload field `{0}` is missing")]
    MissingField(&'static str),
    #[error("payload field `{key}` is invalid: {source}")]
    InvalidField {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Who may move an entity on this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// This process is the source of truth.
    Local,
    /// Authoritative state arrives from elsewhere.
    Remote,
}

#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub dt: f32,
    pub ownership: Ownership,
    pub is_authority: bool,
}

/// RPC a capability wants sent to the authority on each update cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityPush {
    pub method: &'static str,
    pub args: Vec<Value>,
}

/// Replicated behaviour attached to an entity.
///
/// Implementors provide the dirty flag and the payload mapping; the engine only
/// ever goes through [`encode`](NetworkData::encode) and
/// [`decode`](NetworkData::decode).
pub trait NetworkData: Any + fmt::Debug {
    /// Dirty flag, set whenever governed state changes locally.
    fn network_update(&self) -> bool;

    fn set_network_update(&mut self, dirty: bool);

    fn write_payload(&self, host: &Entity) -> Payload;

    fn read_payload(&mut self, host: &mut Entity, payload: &Payload) -> Result<(), PayloadError>;

    /// Called once the entity is in the tree and has its identities.
    fn ready(&mut self, _host: &Entity) {}

    fn physics_step(&mut self, _host: &mut Entity, _ctx: &StepContext) {}

    fn authority_push(&self, _host: &Entity) -> Option<AuthorityPush> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// `None` means "no change" and is distinct from an empty payload. A
    /// non-forced encode clears the dirty flag unless `preserve_flag` is set.
    fn encode(&mut self, host: &Entity, force: bool, preserve_flag: bool) -> Option<Payload> {
        if !force && !self.network_update() {
            return None;
        }
        let payload = self.write_payload(host);
        if !preserve_flag {
            self.set_network_update(false);
        }
        Some(payload)
    }

    fn decode(&mut self, host: &mut Entity, payload: &Payload) -> Result<(), PayloadError> {
        self.read_payload(host, payload)
    }

    /// Forced encode that leaves the dirty flag alone.
    fn snapshot(&self, host: &Entity) -> Payload {
        self.write_payload(host)
    }
}

impl dyn NetworkData {
    pub fn downcast_ref<T: NetworkData>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: NetworkData>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

pub(crate) fn read_field<T: DeserializeOwned>(
    payload: &Payload,
    key: &'static str,
) -> Result<T, PayloadError> {
    let value = payload.get(key).ok_or(PayloadError::MissingField(key))?;
    serde_json::from_value(value.clone()).map_err(|source| PayloadError::InvalidField { key, source })
}

pub(crate) fn vec2_value(v: glam::Vec2) -> serde_json::Value {
    serde_json::Value::from(vec![v.x, v.y])
}

pub(crate) fn vec3_value(v: glam::Vec3) -> serde_json::Value {
    serde_json::Value::from(vec![v.x, v.y, v.z])
}
