mod context;
mod manager;
mod types;

pub use context::OpContext;
pub use manager::{GraphSelector, OperationManager};
pub use types::{OperationOpts, OperationStatus, OutputMode};
