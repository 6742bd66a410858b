// 9.3: finality gating. a critical instruction waits at its first-seen height
// until `delay` blocks have passed, so the data that triggered it can no
// longer be reorganized away. repeated requests keep the original height.

use crate::instruction::Instruction;
use crate::types::{BlockHeight, UserId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CriticalOpId {
    pub user: UserId,
    pub action: &'static str,
}

impl CriticalOpId {
    pub fn of(instruction: &Instruction) -> Self {
        Self {
            user: instruction.user,
            action: instruction.action.name(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    queued_at: BlockHeight,
    instruction: Instruction,
}

#[derive(Debug, Clone)]
pub struct FinalityQueue {
    delay: u64,
    pending: BTreeMap<CriticalOpId, PendingOp>,
}

impl FinalityQueue {
    pub fn new(delay: u64) -> Self {
        Self {
            delay,
            pending: BTreeMap::new(),
        }
    }

    pub fn set_delay(&mut self, delay: u64) {
        self.delay = delay;
    }

    /// Returns the instruction once its op has matured, queueing it otherwise.
    /// The freshest copy is released so salts and heights are current.
    pub fn gate(&mut self, instruction: Instruction, height: BlockHeight) -> Option<Instruction> {
        let id = CriticalOpId::of(&instruction);
        let queued_at = self.pending.get(&id).map_or(height, |p| p.queued_at);
        if height.since(queued_at) >= self.delay {
            self.pending.remove(&id);
            return Some(instruction);
        }
        self.pending.insert(id, PendingOp { queued_at, instruction });
        None
    }

    /// Drains every op whose delay has elapsed, oldest first, with the height
    /// each was queued at.
    pub fn release_matured(&mut self, height: BlockHeight) -> Vec<(BlockHeight, Instruction)> {
        let matured: Vec<CriticalOpId> = self
            .pending
            .iter()
            .filter(|(_, p)| height.since(p.queued_at) >= self.delay)
            .map(|(id, _)| *id)
            .collect();
        let mut released: Vec<(BlockHeight, Instruction)> = matured
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|p| (p.queued_at, p.instruction))
            .collect();
        released.sort_by_key(|(h, i)| (*h, i.user));
        released
    }

    /// Puts a released op back, keeping its original queue height.
    pub fn restore(&mut self, instruction: Instruction, queued_at: BlockHeight) {
        let id = CriticalOpId::of(&instruction);
        self.pending.insert(id, PendingOp { queued_at, instruction });
    }

    pub fn forget(&mut self, user: UserId) {
        self.pending.retain(|id, _| id.user != user);
    }

    pub fn is_pending(&self, user: UserId) -> bool {
        self.pending.keys().any(|id| id.user == user)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
