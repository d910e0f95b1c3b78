use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::identity::{IdentityRegistry, UniqueId};
use crate::scene::{EntityHandle, SceneTree};

use super::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("entity {0:?} has no identity")]
    UnboundEntity(EntityHandle),
    #[error("entity {handle:?} only has local identity {id} and cannot be referenced remotely")]
    LocalOnlyReference { handle: EntityHandle, id: UniqueId },
    #[error("non-finite float {0} has no wire form")]
    NonFiniteFloat(f64),
}

fn finite(value: f64) -> Result<f64, CodecError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CodecError::NonFiniteFloat(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireVector2 {
    #[serde(rename = "X")]
    pub x: f32,
    #[serde(rename = "Y")]
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireVector3 {
    #[serde(rename = "X")]
    pub x: f32,
    #[serde(rename = "Y")]
    pub y: f32,
    #[serde(rename = "Z")]
    pub z: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    #[serde(rename = "Key")]
    pub key: WireValue,
    #[serde(rename = "Value")]
    pub value: WireValue,
}

/// Tagged wire form of a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum WireValue {
    Int {
        #[serde(rename = "Value")]
        value: i64,
    },
    Float {
        #[serde(rename = "Value")]
        value: f64,
    },
    Bool {
        #[serde(rename = "Value")]
        value: bool,
    },
    String {
        #[serde(rename = "Value")]
        value: String,
    },
    Vector2 {
        #[serde(rename = "Value")]
        value: WireVector2,
    },
    Vector3 {
        #[serde(rename = "Value")]
        value: WireVector3,
    },
    Array {
        #[serde(rename = "ArrayElements")]
        elements: Vec<WireValue>,
    },
    Dictionary {
        #[serde(rename = "DictElements")]
        elements: Vec<WireEntry>,
    },
    EntityRef {
        #[serde(rename = "UniqueId")]
        unique_id: Option<UniqueId>,
    },
}

/// Turns values into their wire form. Entity references become identities.
pub struct ValueEncoder<'a> {
    tree: &'a SceneTree,
    ceiling: u32,
}

impl<'a> ValueEncoder<'a> {
    pub fn new(tree: &'a SceneTree, identities: &IdentityRegistry) -> Self {
        Self {
            tree,
            ceiling: identities.ceiling(),
        }
    }

    pub fn encode(&self, value: &Value) -> Result<WireValue, CodecError> {
        Ok(match value {
            Value::Int(v) => WireValue::Int { value: *v },
            Value::Float(v) => WireValue::Float { value: finite(*v)? },
            Value::Bool(v) => WireValue::Bool { value: *v },
            Value::String(v) => WireValue::String { value: v.clone() },
            Value::Vector2(v) => {
                finite(v.x.into())?;
                finite(v.y.into())?;
                WireValue::Vector2 {
                    value: WireVector2 { x: v.x, y: v.y },
                }
            }
            Value::Vector3(v) => {
                finite(v.x.into())?;
                finite(v.y.into())?;
                finite(v.z.into())?;
                WireValue::Vector3 {
                    value: WireVector3 {
                        x: v.x,
                        y: v.y,
                        z: v.z,
                    },
                }
            }
            Value::Array(items) => WireValue::Array {
                elements: items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<_, _>>()?,
            },
            Value::Map(entries) => WireValue::Dictionary {
                elements: entries
                    .iter()
                    .map(|(key, value)| {
                        Ok(WireEntry {
                            key: self.encode(key)?,
                            value: self.encode(value)?,
                        })
                    })
                    .collect::<Result<_, CodecError>>()?,
            },
            Value::EntityRef(None) => WireValue::EntityRef { unique_id: None },
            Value::EntityRef(Some(handle)) => WireValue::EntityRef {
                unique_id: Some(self.identity_of(*handle)?),
            },
        })
    }

    fn identity_of(&self, handle: EntityHandle) -> Result<UniqueId, CodecError> {
        let id = self
            .tree
            .get(handle)
            .and_then(|entity| entity.unique_id())
            .ok_or(CodecError::UnboundEntity(handle))?;
        if id.get() >= self.ceiling {
            return Err(CodecError::LocalOnlyReference { handle, id });
        }
        Ok(id)
    }
}

/// Turns wire values back into values. Unknown identities decode to a null
/// reference and are remembered so the caller can ask for a resync.
pub struct ValueDecoder<'a> {
    identities: &'a mut IdentityRegistry,
    tree: &'a SceneTree,
    unresolved: Vec<UniqueId>,
}

impl<'a> ValueDecoder<'a> {
    pub fn new(identities: &'a mut IdentityRegistry, tree: &'a SceneTree) -> Self {
        Self {
            identities,
            tree,
            unresolved: Vec::new(),
        }
    }

    pub fn decode(&mut self, wire: &WireValue) -> Value {
        match wire {
            WireValue::Int { value } => Value::Int(*value),
            WireValue::Float { value } => Value::Float(*value),
            WireValue::Bool { value } => Value::Bool(*value),
            WireValue::String { value } => Value::String(value.clone()),
            WireValue::Vector2 { value } => Value::Vector2(Vec2::new(value.x, value.y)),
            WireValue::Vector3 { value } => Value::Vector3(Vec3::new(value.x, value.y, value.z)),
            WireValue::Array { elements } => {
                Value::Array(elements.iter().map(|item| self.decode(item)).collect())
            }
            WireValue::Dictionary { elements } => Value::Map(
                elements
                    .iter()
                    .map(|entry| (self.decode(&entry.key), self.decode(&entry.value)))
                    .collect(),
            ),
            WireValue::EntityRef { unique_id: None } => Value::EntityRef(None),
            WireValue::EntityRef {
                unique_id: Some(id),
            } => {
                let handle = self.identities.resolve_or_search(self.tree, *id);
                if handle.is_none() {
                    log::warn!("entity reference {id} could not be resolved");
                    self.unresolved.push(*id);
                }
                Value::EntityRef(handle)
            }
        }
    }

    pub fn unresolved(&self) -> &[UniqueId] {
        &self.unresolved
    }

    pub fn into_unresolved(self) -> Vec<UniqueId> {
        self.unresolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DEFAULT_LOCAL_ID_CEILING;
    use crate::scene::{Entity, Subtree};

    fn setup() -> (SceneTree, IdentityRegistry, EntityHandle) {
        let mut tree = SceneTree::new();
        let mut ids = IdentityRegistry::new(DEFAULT_LOCAL_ID_CEILING);
        ids.bind_root(&mut tree);
        let root = tree.root();
        let handle = tree.insert(root, Subtree::new(Entity::new("door", "Node"))).unwrap();
        ids.assign_authoritative(&mut tree, handle).unwrap();
        (tree, ids, handle)
    }

    #[test]
    fn nested_values_survive_the_wire() {
        let (tree, mut ids, door) = setup();
        let value = Value::Array(vec![
            Value::Int(-4),
            Value::Float(0.25),
            Value::from("hi"),
            Value::Vector2(Vec2::new(1.0, 2.0)),
            Value::Map(vec![
                (Value::from("target"), Value::from(door)),
                (Value::Int(3), Value::Vector3(Vec3::new(1.0, 2.5, -3.0))),
            ]),
            Value::Bool(true),
        ]);

        let wire = ValueEncoder::new(&tree, &ids).encode(&value).unwrap();
        let json = serde_json::to_string(&wire).unwrap();
        let parsed: WireValue = serde_json::from_str(&json).unwrap();

        let mut decoder = ValueDecoder::new(&mut ids, &tree);
        assert_eq!(decoder.decode(&parsed), value);
        assert!(decoder.unresolved().is_empty());
    }

    #[test]
    fn entity_refs_travel_as_identities() {
        let (tree, ids, door) = setup();
        let wire = ValueEncoder::new(&tree, &ids)
            .encode(&Value::from(door))
            .unwrap();

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json, serde_json::json!({"Type": "EntityRef", "UniqueId": "1"}));
    }

    #[test]
    fn unknown_reference_decodes_to_null() {
        let (tree, mut ids, _) = setup();
        let wire: WireValue =
            serde_json::from_str(r#"{"Type":"EntityRef","UniqueId":"55"}"#).unwrap();

        let mut decoder = ValueDecoder::new(&mut ids, &tree);
        assert_eq!(decoder.decode(&wire), Value::EntityRef(None));
        assert_eq!(decoder.into_unresolved(), vec![UniqueId(55)]);
    }

    #[test]
    fn local_entities_cannot_be_referenced() {
        let (mut tree, mut ids, _) = setup();
        let root = tree.root();
        let hud = tree.insert(root, Subtree::new(Entity::new("hud", "Node"))).unwrap();
        ids.assign_local(&mut tree, hud).unwrap();

        let err = ValueEncoder::new(&tree, &ids)
            .encode(&Value::from(hud))
            .unwrap_err();
        assert!(matches!(err, CodecError::LocalOnlyReference { .. }));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let (tree, ids, _) = setup();
        let encoder = ValueEncoder::new(&tree, &ids);

        assert!(matches!(
            encoder.encode(&Value::Float(f64::NAN)),
            Err(CodecError::NonFiniteFloat(_))
        ));
        assert!(matches!(
            encoder.encode(&Value::Array(vec![Value::Vector3(Vec3::new(0.0, f32::INFINITY, 0.0))])),
            Err(CodecError::NonFiniteFloat(v)) if v == f64::INFINITY
        ));
        assert!(matches!(
            encoder.encode(&Value::Vector2(Vec2::new(f32::NEG_INFINITY, 1.0))),
            Err(CodecError::NonFiniteFloat(_))
        ));
        assert!(encoder.encode(&Value::Float(f64::MAX)).is_ok());
    }

    #[test]
    fn wire_shape_matches_tags() {
        let json = serde_json::to_value(WireValue::Vector3 {
            value: WireVector3 {
                x: 1.0,
                y: 0.0,
                z: -1.0,
            },
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Type": "Vector3", "Value": {"X": 1.0, "Y": 0.0, "Z": -1.0}})
        );
    }
}
