//! Multi-user instruction batches.
//!
//! One authorization check covers the call; every item then runs in
//! isolation so a single failing user never blocks the others.

use crate::engine::{EngineError, PositionStateMachine, StepOutcome};
use crate::events::{BatchExecutedEvent, EventPayload};
use crate::instruction::{Action, ExecutionContext, Instruction};
use crate::market::{LendingMarket, SwapRouter};
use crate::position::PositionState;
use crate::types::UserId;
use tracing::{info, warn};

/// Result of one batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub user: UserId,
    pub result: Result<StepOutcome, EngineError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub fail: usize,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchExecutor;

impl BatchExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn execute<L: LendingMarket, S: SwapRouter>(
        &self,
        sm: &mut PositionStateMachine<L, S>,
        ctx: &ExecutionContext,
        instructions: &[Instruction],
    ) -> Result<BatchSummary, EngineError> {
        sm.authorize(ctx)?;
        let config = sm.config();
        if !config.batch_execution_enabled {
            return Err(EngineError::BatchDisabled);
        }
        if instructions.len() > config.max_batch_size {
            return Err(EngineError::BatchTooLarge {
                size: instructions.len(),
                max: config.max_batch_size,
            });
        }

        let items: Vec<BatchItem> = instructions
            .iter()
            .map(|instruction| {
                let result = Self::precheck(sm, instruction).and_then(|()| sm.apply_instruction(instruction));
                if let Err(e) = &result {
                    warn!(user = instruction.user.0, action = %instruction.action, error = %e, "batch item failed");
                }
                BatchItem {
                    user: instruction.user,
                    result,
                }
            })
            .collect();

        let success = items.iter().filter(|i| i.result.is_ok()).count();
        let summary = BatchSummary {
            total: items.len(),
            success,
            fail: items.len() - success,
            items,
        };
        info!(total = summary.total, success = summary.success, fail = summary.fail, "batch executed");
        sm.emit_event(EventPayload::BatchExecuted(BatchExecutedEvent {
            total: summary.total,
            success: summary.success,
            fail: summary.fail,
        }));
        Ok(summary)
    }

    /// Rejects items whose position state cannot accept the action.
    fn precheck<L: LendingMarket, S: SwapRouter>(
        sm: &PositionStateMachine<L, S>,
        instruction: &Instruction,
    ) -> Result<(), EngineError> {
        let user = instruction.user;
        let Some(position) = sm.position(user) else {
            return match instruction.action {
                Action::AutoDeposit { .. } => Ok(()),
                _ => Err(EngineError::PositionNotFound(user)),
            };
        };
        let allowed = match instruction.action {
            Action::LoopStep => position.state == PositionState::Looping,
            Action::UnwindStep => position.state.is_unwinding(),
            Action::AutoDeposit { .. } => false,
            _ => true,
        };
        if !allowed {
            return Err(EngineError::InvalidState {
                user,
                state: position.state,
                action: instruction.action.name(),
            });
        }
        Ok(())
    }
}
