pub mod amount;
pub mod capability;
pub mod checker;
pub mod config;
pub mod db;
pub mod display;
pub mod effect;
pub mod error;
pub mod evaluator;
pub mod io;
pub mod paths;
pub mod push;
pub mod queue;
pub mod simulator;
pub mod types;

pub use capability::{AccountCapability, ExecutionContext};
pub use checker::{check_action_effect, EffectCheckResult};
pub use effect::ActionEffect;
pub use error::{ActionQueueError, Result};
pub use evaluator::{evaluate_action, ExecutableAction};
pub use queue::{ActionQueue, QueueEvent, TickOutcome};
pub use types::{ActionOp, ActionProgram, ActionProgramState, ActionQueueItem, ActionQueueMap};
