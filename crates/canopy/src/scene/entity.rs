use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::identity::UniqueId;
use crate::net::PeerId;

pub const UNIQUE_ID_META: &str = "UID";
pub const OWNER_ID_META: &str = "OID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(pub u32);

impl EntityHandle {
    pub fn id(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Reserved group tags that change how an entity replicates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GroupFlags: u8 {
        /// Never replicated, never snapshotted; applies to the whole subtree.
        const LOCAL_ONLY = 1 << 0;
        /// Represents a connected peer; carries the peer id in `OID` metadata.
        const PLAYER = 1 << 1;
        /// The entity serializes, its children do not.
        const IGNORE_CHILDREN = 1 << 2;
    }
}

impl GroupFlags {
    const NAMES: [(&'static str, GroupFlags); 3] = [
        ("LocalOnly", GroupFlags::LOCAL_ONLY),
        ("Player", GroupFlags::PLAYER),
        ("IgnoreChildren", GroupFlags::IGNORE_CHILDREN),
    ];

    pub fn from_group(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(group, _)| *group == name)
            .map(|(_, flag)| *flag)
    }

    pub fn group_names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(_, flag)| self.contains(*flag))
            .map(|(group, _)| group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    #[serde(rename = "P")]
    pub position: Vec2,
    #[serde(rename = "R")]
    pub rotation: f32,
    #[serde(rename = "S")]
    pub scale: Vec2,
    #[serde(rename = "ZI")]
    pub z_index: i32,
    #[serde(rename = "ZIR")]
    pub z_relative: bool,
    #[serde(rename = "YSE")]
    pub y_sort: bool,
}

impl Default for Transform2D {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            rotation: 0.0,
            scale: Vec2::ONE,
            z_index: 0,
            z_relative: true,
            y_sort: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3D {
    #[serde(rename = "P")]
    pub position: Vec3,
    /// Euler angles in radians.
    #[serde(rename = "R")]
    pub rotation: Vec3,
    #[serde(rename = "S")]
    pub scale: Vec3,
}

impl Default for Transform3D {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLayout {
    #[serde(rename = "P")]
    pub position: Vec2,
    #[serde(rename = "R")]
    pub rotation: f32,
    #[serde(rename = "S")]
    pub scale: Vec2,
    #[serde(rename = "SZ")]
    pub size: Vec2,
    #[serde(rename = "MS")]
    pub min_size: Vec2,
    #[serde(rename = "LM")]
    pub layout_mode: i32,
    #[serde(rename = "LD")]
    pub layout_direction: i32,
    #[serde(rename = "AL")]
    pub anchor_left: f32,
    #[serde(rename = "AR")]
    pub anchor_right: f32,
    #[serde(rename = "AT")]
    pub anchor_top: f32,
    #[serde(rename = "AB")]
    pub anchor_bottom: f32,
    #[serde(rename = "AP")]
    pub anchor_preset: i32,
    #[serde(rename = "OL")]
    pub offset_left: f32,
    #[serde(rename = "OR")]
    pub offset_right: f32,
    #[serde(rename = "OT")]
    pub offset_top: f32,
    #[serde(rename = "OB")]
    pub offset_bottom: f32,
    #[serde(rename = "PO")]
    pub pivot_offset: Vec2,
    #[serde(rename = "ZI")]
    pub z_index: i32,
    #[serde(rename = "ZIR")]
    pub z_relative: bool,
    #[serde(rename = "THM", default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

impl Default for ControlLayout {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            rotation: 0.0,
            scale: Vec2::ONE,
            size: Vec2::ZERO,
            min_size: Vec2::ZERO,
            layout_mode: 0,
            layout_direction: 0,
            anchor_left: 0.0,
            anchor_right: 0.0,
            anchor_top: 0.0,
            anchor_bottom: 0.0,
            anchor_preset: 0,
            offset_left: 0.0,
            offset_right: 0.0,
            offset_top: 0.0,
            offset_bottom: 0.0,
            pivot_offset: Vec2::ZERO,
            z_index: 0,
            z_relative: true,
            theme: None,
        }
    }
}

/// Entity category; decides which transform-like attributes exist.
/// Tagged by `DT` on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "DT")]
pub enum Spatial {
    #[default]
    Node,
    Node2D(Transform2D),
    Node3D(Transform3D),
    Control(ControlLayout),
}

impl Spatial {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Node => "Node",
            Self::Node2D(_) => "Node2D",
            Self::Node3D(_) => "Node3D",
            Self::Control(_) => "Control",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entity {
    pub name: String,
    /// Declared type; selects the capability and RPC methods from the type registry.
    pub type_name: String,
    pub spatial: Spatial,
    pub meta: BTreeMap<String, String>,
    pub flags: GroupFlags,
    /// Groups without replication semantics.
    pub groups: BTreeSet<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn node2d(name: impl Into<String>, type_name: impl Into<String>, position: Vec2) -> Self {
        Self::new(name, type_name).with_spatial(Spatial::Node2D(Transform2D {
            position,
            ..Default::default()
        }))
    }

    pub fn node3d(name: impl Into<String>, type_name: impl Into<String>, position: Vec3) -> Self {
        Self::new(name, type_name).with_spatial(Spatial::Node3D(Transform3D {
            position,
            ..Default::default()
        }))
    }

    pub fn control(name: impl Into<String>, type_name: impl Into<String>, layout: ControlLayout) -> Self {
        Self::new(name, type_name).with_spatial(Spatial::Control(layout))
    }

    pub fn with_spatial(mut self, spatial: Spatial) -> Self {
        self.spatial = spatial;
        self
    }

    pub fn with_flags(mut self, flags: GroupFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.add_to_group(group);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn add_to_group(&mut self, group: impl Into<String>) {
        let group = group.into();
        match GroupFlags::from_group(&group) {
            Some(flag) => self.flags |= flag,
            None => {
                self.groups.insert(group);
            }
        }
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        match GroupFlags::from_group(group) {
            Some(flag) => self.flags.contains(flag),
            None => self.groups.contains(group),
        }
    }

    /// Reserved tags first, then custom groups in order.
    pub fn group_list(&self) -> Vec<String> {
        self.flags
            .group_names()
            .map(str::to_owned)
            .chain(self.groups.iter().cloned())
            .collect()
    }

    pub fn unique_id(&self) -> Option<UniqueId> {
        self.meta.get(UNIQUE_ID_META)?.parse().ok()
    }

    pub fn set_unique_id(&mut self, id: UniqueId) {
        self.meta.insert(UNIQUE_ID_META.to_owned(), id.to_string());
    }

    pub fn owner_id(&self) -> Option<PeerId> {
        self.meta.get(OWNER_ID_META)?.parse().ok()
    }

    pub fn set_owner_id(&mut self, owner: PeerId) {
        self.meta.insert(OWNER_ID_META.to_owned(), owner.to_string());
    }

    pub fn position_3d(&self) -> Option<Vec3> {
        match &self.spatial {
            Spatial::Node3D(transform) => Some(transform.position),
            _ => None,
        }
    }

    pub fn position_2d(&self) -> Option<Vec2> {
        match &self.spatial {
            Spatial::Node2D(transform) => Some(transform.position),
            Spatial::Control(layout) => Some(layout.position),
            _ => None,
        }
    }
}
