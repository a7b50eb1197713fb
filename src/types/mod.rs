//! Task and outcome types shared by the executor, queue and CLI.
//!
//! - [`task`] - [`Task`] (id, image, command)
//! - [`outcome`] - [`RaceBranch`], [`OutcomeStatus`], [`TaskOutcome`]

pub mod outcome;
pub mod task;

pub use outcome::{OutcomeStatus, RaceBranch, TaskOutcome};
pub use task::{demo_command, Task};
