use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::capability::Payload;
use crate::identity::UniqueId;
use crate::scene::{Spatial, UNIQUE_ID_META};
use crate::value::WireValue;

const DATA_TYPE_KEY: &str = "DAT";

/// Envelope discriminator. `2` is unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    RpcCall = 0,
    DeltaUpdate = 1,
    FullSnapshot = 3,
    StructuralAdd = 4,
    StructuralRemove = 5,
    RequestForceSync = 6,
}

impl TryFrom<u64> for DataType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::RpcCall,
            1 => Self::DeltaUpdate,
            3 => Self::FullSnapshot,
            4 => Self::StructuralAdd,
            5 => Self::StructuralRemove,
            6 => Self::RequestForceSync,
            other => return Err(ProtocolError::UnknownDataType(other)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no DAT field")]
    MissingDataType,
    #[error("unknown DAT value {0}")]
    UnknownDataType(u64),
}

/// Serialized entity subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNode {
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "T")]
    pub type_name: String,
    #[serde(flatten)]
    pub spatial: Spatial,
    #[serde(rename = "M", default)]
    pub meta: BTreeMap<String, String>,
    #[serde(rename = "G", default)]
    pub groups: Vec<String>,
    #[serde(rename = "C", default)]
    pub children: Vec<WireNode>,
    /// Forced capability payload.
    #[serde(rename = "IND", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl WireNode {
    pub fn unique_id(&self) -> Option<UniqueId> {
        self.meta.get(UNIQUE_ID_META)?.parse().ok()
    }

    /// Every identity carried by this node and its children.
    pub fn identities(&self) -> BTreeSet<UniqueId> {
        let mut ids = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Some(id) = node.unique_id() {
                ids.insert(id);
            }
            stack.extend(node.children.iter());
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    #[serde(rename = "Caller")]
    pub caller: UniqueId,
    #[serde(rename = "MethodName")]
    pub method: String,
    #[serde(rename = "Params", default)]
    pub params: Vec<WireValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeltaUpdate {
    #[serde(rename = "NN")]
    pub entries: BTreeMap<UniqueId, Payload>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FullSnapshot {
    #[serde(rename = "Nodes")]
    pub nodes: Vec<WireNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralAdd {
    /// Identity of the parent the node attaches under.
    #[serde(rename = "Owner")]
    pub parent: UniqueId,
    #[serde(rename = "Node")]
    pub node: WireNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralRemove {
    #[serde(rename = "UniqueId")]
    pub unique_id: UniqueId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    RpcCall(RpcCall),
    DeltaUpdate(DeltaUpdate),
    FullSnapshot(FullSnapshot),
    StructuralAdd(StructuralAdd),
    StructuralRemove(StructuralRemove),
    RequestForceSync,
}

impl Envelope {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::RpcCall(_) => DataType::RpcCall,
            Self::DeltaUpdate(_) => DataType::DeltaUpdate,
            Self::FullSnapshot(_) => DataType::FullSnapshot,
            Self::StructuralAdd(_) => DataType::StructuralAdd,
            Self::StructuralRemove(_) => DataType::StructuralRemove,
            Self::RequestForceSync => DataType::RequestForceSync,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let mut body = match self {
            Self::RpcCall(m) => serde_json::to_value(m)?,
            Self::DeltaUpdate(m) => serde_json::to_value(m)?,
            Self::FullSnapshot(m) => serde_json::to_value(m)?,
            Self::StructuralAdd(m) => serde_json::to_value(m)?,
            Self::StructuralRemove(m) => serde_json::to_value(m)?,
            Self::RequestForceSync => Json::Object(serde_json::Map::new()),
        };
        let Json::Object(fields) = &mut body else {
            return Err(ProtocolError::NotAnObject);
        };
        fields.insert(DATA_TYPE_KEY.to_owned(), (self.data_type() as u8).into());
        Ok(serde_json::to_string(&body)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let mut body: Json = serde_json::from_str(text)?;
        let Json::Object(fields) = &mut body else {
            return Err(ProtocolError::NotAnObject);
        };
        let data_type = fields
            .remove(DATA_TYPE_KEY)
            .and_then(|value| value.as_u64())
            .ok_or(ProtocolError::MissingDataType)?;

        Ok(match DataType::try_from(data_type)? {
            DataType::RpcCall => Self::RpcCall(serde_json::from_value(body)?),
            DataType::DeltaUpdate => Self::DeltaUpdate(serde_json::from_value(body)?),
            DataType::FullSnapshot => Self::FullSnapshot(serde_json::from_value(body)?),
            DataType::StructuralAdd => Self::StructuralAdd(serde_json::from_value(body)?),
            DataType::StructuralRemove => Self::StructuralRemove(serde_json::from_value(body)?),
            DataType::RequestForceSync => Self::RequestForceSync,
        })
    }
}
