use crate::capability::PayloadError;
use crate::registry::TypeRegistry;
use crate::scene::{Entity, EntityHandle, GroupFlags, SceneTree, Subtree};

use super::protocol::WireNode;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("capability state of `{name}` could not be decoded: {source}")]
    Payload {
        name: String,
        #[source]
        source: PayloadError,
    },
}

/// Serializes `handle` and its replicated descendants. `LocalOnly` entities
/// yield `None`; children of an `IgnoreChildren` entity are left out.
/// Capability state is captured forced, without consuming dirty flags.
pub fn serialize(tree: &SceneTree, handle: EntityHandle) -> Option<WireNode> {
    let entity = tree.get(handle)?;
    if entity.flags.contains(GroupFlags::LOCAL_ONLY) {
        return None;
    }

    let children = if entity.flags.contains(GroupFlags::IGNORE_CHILDREN) {
        Vec::new()
    } else {
        tree.children(handle)
            .iter()
            .filter_map(|&child| serialize(tree, child))
            .collect()
    };

    Some(WireNode {
        name: entity.name.clone(),
        type_name: entity.type_name.clone(),
        spatial: entity.spatial.clone(),
        meta: entity.meta.clone(),
        groups: entity.group_list(),
        children,
        payload: tree.capability(handle).map(|capability| capability.snapshot(entity)),
    })
}

/// Rebuilds a detached subtree, instantiating capabilities by declared type.
pub fn deserialize(node: &WireNode, types: &TypeRegistry) -> Result<Subtree, GraphError> {
    let mut entity = Entity::new(node.name.clone(), node.type_name.clone())
        .with_spatial(node.spatial.clone());
    entity.meta = node.meta.clone();
    for group in &node.groups {
        entity.add_to_group(group.as_str());
    }

    let capability = match &node.payload {
        Some(payload) => match types.instantiate(&node.type_name) {
            Some(mut capability) => {
                capability
                    .decode(&mut entity, payload)
                    .map_err(|source| GraphError::Payload {
                        name: node.name.clone(),
                        source,
                    })?;
                Some(capability)
            }
            None => {
                log::warn!(
                    "`{}` carries capability state but type `{}` has none registered",
                    node.name,
                    node.type_name
                );
                None
            }
        },
        None => None,
    };

    let children = node
        .children
        .iter()
        .map(|child| deserialize(child, types))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Subtree {
        entity,
        capability,
        children,
    })
}

#[cfg(test)]
mod tests {
    use glam::{Vec2, Vec3};

    use super::*;
    use crate::capability::{ButtonSync, ReconcileSettings, TransformSync3D, register_button, register_transform_3d};
    use crate::scene::{ControlLayout, Transform2D, Spatial};

    fn types() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        register_transform_3d(&mut types, "Crate", ReconcileSettings::DEFAULT_3D).unwrap();
        register_button(&mut types, "Button").unwrap();
        types
    }

    fn sample(tree: &mut SceneTree) -> EntityHandle {
        let root = tree.root();
        let panel = Entity::control(
            "panel",
            "Panel",
            ControlLayout {
                size: Vec2::new(200.0, 80.0),
                anchor_right: 1.0,
                theme: Some("res://ui/theme.tres".into()),
                ..Default::default()
            },
        )
        .with_group("Menus")
        .with_meta("UID", "4");

        let subtree = Subtree::new(
            Entity::node3d("crate", "Crate", Vec3::new(1.0, 2.0, 3.0))
                .with_meta("UID", "3")
                .with_group("Pickups"),
        )
        .with_capability(TransformSync3D::default())
        .with_child(
            Subtree::new(panel).with_child(
                Subtree::new(Entity::new("ok", "Button").with_meta("UID", "5"))
                    .with_capability(ButtonSync::new("OK")),
            ),
        )
        .with_child(Subtree::new(
            Entity::new("sprite", "Sprite")
                .with_spatial(Spatial::Node2D(Transform2D {
                    position: Vec2::new(-4.0, 8.0),
                    rotation: 0.5,
                    z_index: 3,
                    y_sort: true,
                    ..Default::default()
                }))
                .with_meta("UID", "6"),
        ));
        tree.insert(root, subtree).unwrap()
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let types = types();
        let mut tree = SceneTree::new();
        let handle = sample(&mut tree);

        let node = serialize(&tree, handle).unwrap();
        let json = serde_json::to_string(&node).unwrap();
        let parsed: WireNode = serde_json::from_str(&json).unwrap();
        let rebuilt = deserialize(&parsed, &types).unwrap();

        let mut copy = SceneTree::new();
        let root = copy.root();
        let copied = copy.insert(root, rebuilt).unwrap();

        assert_eq!(serialize(&copy, copied).unwrap(), node);
        assert_eq!(copy.get(copied), tree.get(handle));

        let button = copy.find_child(copy.find_child(copied, "panel").unwrap(), "ok").unwrap();
        let sync = copy.capability(button).unwrap().downcast_ref::<ButtonSync>().unwrap();
        assert_eq!(sync.text, "OK");
    }

    #[test]
    fn exclusions_are_respected() {
        let mut tree = SceneTree::new();
        let root = tree.root();
        let subtree = Subtree::new(Entity::new("holder", "Node").with_group("IgnoreChildren"))
            .with_child(Subtree::new(Entity::new("hidden", "Node")));
        let holder = tree.insert(root, subtree).unwrap();
        let local = tree
            .insert(root, Subtree::new(Entity::new("hud", "Node").with_group("LocalOnly")))
            .unwrap();

        let node = serialize(&tree, holder).unwrap();
        assert!(node.children.is_empty());
        assert_eq!(node.groups, vec!["IgnoreChildren"]);
        assert!(serialize(&tree, local).is_none());
    }

    #[test]
    fn serializing_does_not_consume_dirty_flags() {
        let mut tree = SceneTree::new();
        let handle = sample(&mut tree);
        let button = tree.find_child(tree.find_child(handle, "panel").unwrap(), "ok").unwrap();

        serialize(&tree, handle).unwrap();
        assert!(tree.capability(button).unwrap().network_update());
    }

    #[test]
    fn bad_capability_state_is_an_error() {
        let types = types();
        let node: WireNode = serde_json::from_str(
            r#"{"N":"ok","T":"Button","DT":"Node","M":{},"G":[],"C":[],"IND":{"TX":5}}"#,
        )
        .unwrap();
        assert!(matches!(
            deserialize(&node, &types),
            Err(GraphError::Payload { .. })
        ));
    }
}
