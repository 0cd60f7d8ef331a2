mod checkpoint;
mod event_log;

pub use checkpoint::{CheckpointStore, OperationCheckpoint};
pub use event_log::EventLog;
