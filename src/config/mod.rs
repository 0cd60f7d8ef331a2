mod model;
mod settings;

pub use model::{ModelConfig, DEFAULT_EXECUTOR_MODEL, DEFAULT_PLANNER_MODEL, DEFAULT_REFLECTOR_MODEL};
pub use settings::{
    BrokerConfig, ExecutorConfig, HistoryConfig, LlmConfig, OperationConfig, PersistConfig,
    PlannerConfig, RedpilotConfig, ReflectorConfig, StateDir, ToolHostConfig,
};
