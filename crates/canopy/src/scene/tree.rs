use std::collections::HashMap;

use crate::capability::NetworkData;

use super::entity::{Entity, EntityHandle, GroupFlags};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("entity {0:?} is not in the tree")]
    UnknownEntity(EntityHandle),
    #[error("the scene root cannot be removed")]
    RootRemoval,
}

/// An owned, detached subtree: what game logic hands to the attach hook and
/// what the graph deserializer produces.
#[derive(Debug)]
pub struct Subtree {
    pub entity: Entity,
    pub capability: Option<Box<dyn NetworkData>>,
    pub children: Vec<Subtree>,
}

impl Subtree {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            capability: None,
            children: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl NetworkData) -> Self {
        self.capability = Some(Box::new(capability));
        self
    }

    pub fn with_child(mut self, child: Subtree) -> Self {
        self.children.push(child);
        self
    }

    /// Entities in this subtree, the root included.
    pub fn entity_count(&self) -> usize {
        1 + self.children.iter().map(Subtree::entity_count).sum::<usize>()
    }
}

#[derive(Debug)]
struct Slot {
    entity: Entity,
    parent: Option<EntityHandle>,
    children: Vec<EntityHandle>,
}

/// Arena of entities. Parents own their children; the parent link is a plain
/// handle used for lookups only.
#[derive(Debug)]
pub struct SceneTree {
    slots: HashMap<EntityHandle, Slot>,
    capabilities: HashMap<EntityHandle, Box<dyn NetworkData>>,
    root: EntityHandle,
    next_handle: u32,
}

impl Default for SceneTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneTree {
    pub fn new() -> Self {
        let root = EntityHandle(0);
        let mut slots = HashMap::new();
        slots.insert(
            root,
            Slot {
                entity: Entity::new("root", "Node"),
                parent: None,
                children: Vec::new(),
            },
        );

        Self {
            slots,
            capabilities: HashMap::new(),
            root,
            next_handle: 1,
        }
    }

    pub fn root(&self) -> EntityHandle {
        self.root
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.slots.contains_key(&handle)
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&Entity> {
        self.slots.get(&handle).map(|slot| &slot.entity)
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        self.slots.get_mut(&handle).map(|slot| &mut slot.entity)
    }

    pub fn parent(&self, handle: EntityHandle) -> Option<EntityHandle> {
        self.slots.get(&handle).and_then(|slot| slot.parent)
    }

    pub fn children(&self, handle: EntityHandle) -> &[EntityHandle] {
        self.slots
            .get(&handle)
            .map(|slot| slot.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn find_child(&self, parent: EntityHandle, name: &str) -> Option<EntityHandle> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&child| self.get(child).is_some_and(|e| e.name == name))
    }

    pub fn capability(&self, handle: EntityHandle) -> Option<&(dyn NetworkData + 'static)> {
        self.capabilities.get(&handle).map(|cap| cap.as_ref())
    }

    pub fn capability_mut(&mut self, handle: EntityHandle) -> Option<&mut (dyn NetworkData + 'static)> {
        self.capabilities.get_mut(&handle).map(|cap| cap.as_mut())
    }

    /// Borrows an entity and its capability together.
    pub fn entity_and_capability_mut(
        &mut self,
        handle: EntityHandle,
    ) -> Option<(&mut Entity, &mut (dyn NetworkData + 'static))> {
        let slot = self.slots.get_mut(&handle)?;
        let capability = self.capabilities.get_mut(&handle)?;
        Some((&mut slot.entity, capability.as_mut()))
    }

    pub fn entity_with_capability_mut(
        &mut self,
        handle: EntityHandle,
    ) -> Option<(&mut Entity, Option<&mut (dyn NetworkData + 'static)>)> {
        let slot = self.slots.get_mut(&handle)?;
        let capability = self.capabilities.get_mut(&handle).map(|cap| cap.as_mut());
        Some((&mut slot.entity, capability))
    }

    pub fn set_capability(
        &mut self,
        handle: EntityHandle,
        capability: Box<dyn NetworkData>,
    ) -> Result<Option<Box<dyn NetworkData>>, TreeError> {
        if !self.contains(handle) {
            return Err(TreeError::UnknownEntity(handle));
        }
        Ok(self.capabilities.insert(handle, capability))
    }

    /// Handles of every entity carrying a capability, in handle order.
    pub fn capability_handles(&self) -> Vec<EntityHandle> {
        let mut handles: Vec<EntityHandle> = self.capabilities.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn insert(&mut self, parent: EntityHandle, subtree: Subtree) -> Result<EntityHandle, TreeError> {
        if !self.contains(parent) {
            return Err(TreeError::UnknownEntity(parent));
        }
        Ok(self.insert_unchecked(parent, subtree))
    }

    fn insert_unchecked(&mut self, parent: EntityHandle, subtree: Subtree) -> EntityHandle {
        let handle = EntityHandle(self.next_handle);
        self.next_handle += 1;

        let Subtree {
            entity,
            capability,
            children,
        } = subtree;

        self.slots.insert(
            handle,
            Slot {
                entity,
                parent: Some(parent),
                children: Vec::with_capacity(children.len()),
            },
        );
        if let Some(capability) = capability {
            self.capabilities.insert(handle, capability);
        }
        if let Some(parent_slot) = self.slots.get_mut(&parent) {
            parent_slot.children.push(handle);
        }

        for child in children {
            self.insert_unchecked(handle, child);
        }

        handle
    }

    /// Detaches and frees `handle` with its whole subtree, handing ownership back.
    pub fn remove(&mut self, handle: EntityHandle) -> Result<Subtree, TreeError> {
        if handle == self.root {
            return Err(TreeError::RootRemoval);
        }
        let parent = self
            .slots
            .get(&handle)
            .ok_or(TreeError::UnknownEntity(handle))?
            .parent;

        if let Some(parent_slot) = parent.and_then(|p| self.slots.get_mut(&p)) {
            parent_slot.children.retain(|&child| child != handle);
        }

        self.take_subtree(handle)
            .ok_or(TreeError::UnknownEntity(handle))
    }

    fn take_subtree(&mut self, handle: EntityHandle) -> Option<Subtree> {
        let slot = self.slots.remove(&handle)?;
        let capability = self.capabilities.remove(&handle);
        let children = slot
            .children
            .into_iter()
            .filter_map(|child| self.take_subtree(child))
            .collect();

        Some(Subtree {
            entity: slot.entity,
            capability,
            children,
        })
    }

    /// Pre-order walk of `handle` and its descendants, collected up front so the
    /// caller may mutate the tree while iterating.
    pub fn descendants(&self, handle: EntityHandle) -> Vec<EntityHandle> {
        let mut out = Vec::new();
        if !self.contains(handle) {
            return out;
        }

        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    /// Nearest entity from `handle` up to the root matching `predicate`.
    pub fn find_ancestor_or_self(
        &self,
        handle: EntityHandle,
        predicate: impl Fn(&Entity) -> bool,
    ) -> Option<EntityHandle> {
        let mut current = Some(handle);
        while let Some(h) = current {
            let slot = self.slots.get(&h)?;
            if predicate(&slot.entity) {
                return Some(h);
            }
            current = slot.parent;
        }
        None
    }

    /// True when the entity or any ancestor is tagged `LocalOnly`.
    pub fn is_local_only(&self, handle: EntityHandle) -> bool {
        self.find_ancestor_or_self(handle, |e| e.flags.contains(GroupFlags::LOCAL_ONLY))
            .is_some()
    }
}
