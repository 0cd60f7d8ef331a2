mod commands;
mod display;

pub use commands::{Cli, Commands, ConfigAction, GraphArg, OutputModeArg};
pub use display::Display;
