mod host;
mod types;

pub use host::{HttpToolHost, ToolHost};
pub use types::{ToolOutcome, ToolSpec};
