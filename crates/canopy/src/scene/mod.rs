mod entity;
mod tree;

pub use entity::{
    ControlLayout, Entity, EntityHandle, GroupFlags, OWNER_ID_META, Spatial, Transform2D,
    Transform3D, UNIQUE_ID_META,
};
pub use tree::{SceneTree, Subtree, TreeError};
