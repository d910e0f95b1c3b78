mod codec;

use glam::{Vec2, Vec3};

use crate::scene::EntityHandle;

pub use codec::{CodecError, ValueDecoder, ValueEncoder, WireEntry, WireValue, WireVector2, WireVector3};

/// Dynamic value carried by RPC arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Vector2(Vec2),
    Vector3(Vec3),
    Array(Vec<Value>),
    /// Insertion-ordered pairs; keys may be any value.
    Map(Vec<(Value, Value)>),
    /// `None` when the referenced entity is unknown on this process.
    EntityRef(Option<EntityHandle>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::Bool(_) => "Bool",
            Self::String(_) => "String",
            Self::Vector2(_) => "Vector2",
            Self::Vector3(_) => "Vector3",
            Self::Array(_) => "Array",
            Self::Map(_) => "Dictionary",
            Self::EntityRef(_) => "EntityRef",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Ints widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector2(&self) -> Option<Vec2> {
        match self {
            Self::Vector2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<Vec3> {
        match self {
            Self::Vector3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<EntityHandle> {
        match self {
            Self::EntityRef(v) => *v,
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec2> for Value {
    fn from(v: Vec2) -> Self {
        Self::Vector2(v)
    }
}

impl From<Vec3> for Value {
    fn from(v: Vec3) -> Self {
        Self::Vector3(v)
    }
}

impl From<EntityHandle> for Value {
    fn from(v: EntityHandle) -> Self {
        Self::EntityRef(Some(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}
