use std::collections::VecDeque;

use crate::scene::{EntityHandle, Subtree};

/// Structural change requested while the tree was being walked.
#[derive(Debug)]
pub enum DeferredOp {
    Attach { parent: EntityHandle, subtree: Subtree },
    Detach(EntityHandle),
}

/// Ops queued during traversal; drained by the engine once the walk is over.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    ops: VecDeque<DeferredOp>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, parent: EntityHandle, subtree: Subtree) {
        self.ops.push_back(DeferredOp::Attach { parent, subtree });
    }

    pub fn detach(&mut self, handle: EntityHandle) {
        self.ops.push_back(DeferredOp::Detach(handle));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DeferredOp> + '_ {
        self.ops.drain(..)
    }

    pub(crate) fn take(&mut self) -> VecDeque<DeferredOp> {
        std::mem::take(&mut self.ops)
    }
}
