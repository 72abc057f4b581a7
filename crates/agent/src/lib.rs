//! The agent runtime: task state machine and interrupts, the reasoning
//! engine, context manager, prompt assembler, scheduler, and the control
//! operations exposed to host transports.

pub mod context;
pub mod control;
pub mod cron;
pub mod engine;
pub mod host_tools;
pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod task;

pub use engine::{run_turn, AgentEvent, TurnInput};
pub use state::AppState;
