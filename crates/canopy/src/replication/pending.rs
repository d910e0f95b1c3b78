use std::collections::VecDeque;

use crate::identity::UniqueId;
use crate::net::StructuralAdd;

/// Structural adds whose parent was unknown on arrival. Bounded; the oldest
/// entry is evicted first.
#[derive(Debug)]
pub struct PendingAdds {
    queue: VecDeque<StructuralAdd>,
    capacity: usize,
}

impl PendingAdds {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Parks `add`; returns the entry evicted to make room, if any.
    pub fn park(&mut self, add: StructuralAdd) -> Option<StructuralAdd> {
        if self.capacity == 0 {
            return Some(add);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(add);
        evicted
    }

    /// Removes and returns every parked add whose parent satisfies `known`,
    /// in arrival order.
    pub fn take_ready(&mut self, known: impl Fn(UniqueId) -> bool) -> Vec<StructuralAdd> {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|add| known(add.parent));
        self.queue = waiting;
        ready.into()
    }

    /// Drops parked adds carrying `id` anywhere in their subtree.
    pub fn forget(&mut self, id: UniqueId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|add| !add.node.identities().contains(&id));
        before - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
