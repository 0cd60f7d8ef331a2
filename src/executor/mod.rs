mod driver;
mod history;
mod repeat;

pub use driver::{ExecVerdict, Executor, SubtaskOutcome};
pub use history::{Speaker, StepHistory};
pub use repeat::{canonical_action_key, RepeatTracker};
