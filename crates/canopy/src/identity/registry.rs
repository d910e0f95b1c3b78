use std::collections::HashMap;

use crate::scene::{EntityHandle, GroupFlags, SceneTree};

use super::UniqueId;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("authoritative identity range [0, {ceiling}) is exhausted")]
    AuthoritativeExhausted { ceiling: u32 },
    #[error("local identity range [{ceiling}, {max}] is exhausted", max = u32::MAX)]
    LocalExhausted { ceiling: u32 },
    #[error("entity {0:?} is not in the tree")]
    UnknownEntity(EntityHandle),
}

/// Maps identities to live entities and hands out new ones.
///
/// Authoritative ids count up from zero and are only minted by the authority.
/// Local ids count down from `u32::MAX` on every process independently and are
/// never sent over the wire. Neither counter ever moves backwards, so retired
/// ids are not reissued.
#[derive(Debug)]
pub struct IdentityRegistry {
    ceiling: u32,
    next_authoritative: u32,
    local_issued: u32,
    by_id: HashMap<UniqueId, EntityHandle>,
}

impl IdentityRegistry {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            next_authoritative: 0,
            local_issued: 0,
            by_id: HashMap::new(),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: UniqueId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn is_local_id(&self, id: UniqueId) -> bool {
        id.get() >= self.ceiling
    }

    /// Binds the scene root to [`UniqueId::ROOT`].
    pub fn bind_root(&mut self, tree: &mut SceneTree) {
        let root = tree.root();
        if let Some(entity) = tree.get_mut(root) {
            entity.set_unique_id(UniqueId::ROOT);
        }
        self.by_id.insert(UniqueId::ROOT, root);
        self.next_authoritative = self.next_authoritative.max(UniqueId::ROOT.get() + 1);
    }

    fn next_authoritative_id(&mut self) -> Result<UniqueId, IdentityError> {
        if self.next_authoritative >= self.ceiling {
            return Err(IdentityError::AuthoritativeExhausted {
                ceiling: self.ceiling,
            });
        }
        let id = UniqueId(self.next_authoritative);
        self.next_authoritative += 1;
        Ok(id)
    }

    fn next_local_id(&mut self) -> Result<UniqueId, IdentityError> {
        if self.local_issued > u32::MAX - self.ceiling {
            return Err(IdentityError::LocalExhausted {
                ceiling: self.ceiling,
            });
        }
        let id = UniqueId(u32::MAX - self.local_issued);
        self.local_issued = self.local_issued.saturating_add(1);
        Ok(id)
    }

    fn already_bound(&self, tree: &SceneTree, handle: EntityHandle) -> bool {
        tree.get(handle)
            .and_then(|entity| entity.unique_id())
            .is_some_and(|id| self.by_id.get(&id) == Some(&handle))
    }

    fn bind(&mut self, tree: &mut SceneTree, handle: EntityHandle, id: UniqueId) {
        if let Some(entity) = tree.get_mut(handle) {
            entity.set_unique_id(id);
        }
        self.by_id.insert(id, handle);
    }

    /// Depth-first assignment over `handle` and its descendants. Entities under a
    /// `LocalOnly` tag receive local ids instead. Entities already bound keep
    /// their identity. Returns the authoritative ids handed out.
    pub fn assign_authoritative(
        &mut self,
        tree: &mut SceneTree,
        handle: EntityHandle,
    ) -> Result<Vec<UniqueId>, IdentityError> {
        if !tree.contains(handle) {
            return Err(IdentityError::UnknownEntity(handle));
        }

        let mut assigned = Vec::new();
        for current in tree.descendants(handle) {
            if self.already_bound(tree, current) {
                continue;
            }
            let id = if tree.is_local_only(current) {
                self.next_local_id()?
            } else {
                let id = self.next_authoritative_id()?;
                assigned.push(id);
                id
            };
            self.bind(tree, current, id);
        }
        Ok(assigned)
    }

    /// Same traversal as [`assign_authoritative`](Self::assign_authoritative) but
    /// from the local range; tags `handle` as `LocalOnly`.
    pub fn assign_local(
        &mut self,
        tree: &mut SceneTree,
        handle: EntityHandle,
    ) -> Result<Vec<UniqueId>, IdentityError> {
        let entity = tree
            .get_mut(handle)
            .ok_or(IdentityError::UnknownEntity(handle))?;
        entity.flags |= GroupFlags::LOCAL_ONLY;

        let mut assigned = Vec::new();
        for current in tree.descendants(handle) {
            if self.already_bound(tree, current) {
                continue;
            }
            let id = self.next_local_id()?;
            self.bind(tree, current, id);
            assigned.push(id);
        }
        Ok(assigned)
    }

    /// Registers identities that arrived with a replicated subtree. Entities that
    /// came without one get local bookkeeping ids.
    pub fn record(
        &mut self,
        tree: &mut SceneTree,
        handle: EntityHandle,
    ) -> Result<Vec<UniqueId>, IdentityError> {
        let mut recorded = Vec::new();
        for current in tree.descendants(handle) {
            match tree.get(current).and_then(|entity| entity.unique_id()) {
                Some(id) => {
                    match self.by_id.insert(id, current) {
                        Some(previous) if previous != current => {
                            log::warn!("identity {id} rebound from {previous:?} to {current:?}");
                        }
                        _ => {}
                    }
                    recorded.push(id);
                }
                None => {
                    let id = self.next_local_id()?;
                    self.bind(tree, current, id);
                }
            }
        }
        Ok(recorded)
    }

    pub fn resolve(&self, id: UniqueId) -> Option<EntityHandle> {
        self.by_id.get(&id).copied()
    }

    /// Linear depth-first search of the whole tree by `UID` metadata. This is
    /// the degraded path behind [`resolve`](Self::resolve); it costs O(n).
    pub fn search(tree: &SceneTree, id: UniqueId) -> Option<EntityHandle> {
        tree.descendants(tree.root())
            .into_iter()
            .find(|&handle| tree.get(handle).and_then(|e| e.unique_id()) == Some(id))
    }

    /// Map lookup, then tree search. A search hit is cached.
    pub fn resolve_or_search(&mut self, tree: &SceneTree, id: UniqueId) -> Option<EntityHandle> {
        if let Some(handle) = self.resolve(id).filter(|&h| tree.contains(h)) {
            return Some(handle);
        }

        let found = Self::search(tree, id);
        match found {
            Some(handle) => {
                log::debug!("identity {id} recovered by tree search");
                self.by_id.insert(id, handle);
            }
            None => {
                self.by_id.remove(&id);
            }
        }
        found
    }

    pub fn unresolve(&mut self, id: UniqueId) -> Option<EntityHandle> {
        self.by_id.remove(&id)
    }

    /// Drops the mappings of `handle` and its descendants. Call before the
    /// subtree is freed.
    pub fn retire(&mut self, tree: &SceneTree, handle: EntityHandle) -> Vec<UniqueId> {
        let mut retired = Vec::new();
        for current in tree.descendants(handle) {
            let Some(id) = tree.get(current).and_then(|e| e.unique_id()) else {
                continue;
            };
            if self.by_id.get(&id) == Some(&current) {
                self.by_id.remove(&id);
                retired.push(id);
            }
        }
        retired
    }
}
