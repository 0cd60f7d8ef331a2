use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::operation::{GraphSelector, OutputMode};

#[derive(Parser)]
#[command(name = "redpilot", about = "Autonomous planner/executor/reflector runtime", version)]
pub struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// State directory (default: ./.redpilot).
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the state directory and write a default config.
    Init,

    /// Start an operation and drive it to a terminal state.
    Run {
        /// The goal, in natural language.
        goal: String,

        /// Require a human decision on every plan batch.
        #[arg(long)]
        hitl: bool,

        #[arg(long)]
        max_parallel: Option<usize>,

        #[arg(long)]
        step_budget: Option<usize>,

        #[arg(long)]
        planner_model: Option<String>,

        #[arg(long)]
        executor_model: Option<String>,

        #[arg(long)]
        reflector_model: Option<String>,

        #[arg(long, value_enum, default_value_t)]
        output: OutputModeArg,
    },

    /// Show one operation's status (or all, without an id).
    Status {
        op_id: Option<String>,
    },

    /// List known operations.
    List,

    /// Print an operation's persisted event tail.
    Events {
        op_id: String,

        /// Replay from this sequence number.
        #[arg(long, default_value_t = 0)]
        from_seq: u64,
    },

    /// Dump a checkpointed graph.
    Snapshot {
        op_id: String,

        #[arg(long, value_enum, default_value_t)]
        which: GraphArg,
    },

    /// Inspect or reset configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    Show,
    Reset,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputModeArg {
    Simple,
    #[default]
    Default,
    Debug,
}

impl From<OutputModeArg> for OutputMode {
    fn from(arg: OutputModeArg) -> Self {
        match arg {
            OutputModeArg::Simple => OutputMode::Simple,
            OutputModeArg::Default => OutputMode::Default,
            OutputModeArg::Debug => OutputMode::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum GraphArg {
    #[default]
    Task,
    Causal,
}

impl From<GraphArg> for GraphSelector {
    fn from(arg: GraphArg) -> Self {
        match arg {
            GraphArg::Task => GraphSelector::Task,
            GraphArg::Causal => GraphSelector::Causal,
        }
    }
}
