// 8.0: position state machine. owns positions, applies loop and unwind steps
// against the lending market and swap adapters, and publishes every change
// as an event. deterministic, no I/O of its own.

mod admin;
mod config;
mod core;
mod dispatch;
mod flash;
mod lifecycle;
mod looping;
mod results;
mod unwinding;

pub use config::EngineConfig;
pub use core::PositionStateMachine;
pub use results::{EngineError, StepOutcome};
