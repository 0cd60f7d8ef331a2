use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{RedpilotError, Result};

use super::model::ModelConfig;

/// Root configuration, one section per component.
///
/// Loaded from `<state_dir>/config.toml`; missing sections and fields fall
/// back to defaults so a partial file stays valid across upgrades.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedpilotConfig {
    pub operation: OperationConfig,
    pub llm: LlmConfig,
    pub tools: ToolHostConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub reflector: ReflectorConfig,
    pub broker: BrokerConfig,
    pub persist: PersistConfig,
    pub models: ModelConfig,
}

impl RedpilotConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("config.toml");
        let config: Self = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = state_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| RedpilotError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.operation.max_parallel == 0 {
            errors.push("operation.max_parallel must be greater than 0");
        }
        if self.operation.step_budget == 0 {
            errors.push("operation.step_budget must be greater than 0");
        }
        if self.operation.capacity == 0 {
            errors.push("operation.capacity must be greater than 0");
        }
        if self.operation.abort_grace_secs == 0 {
            errors.push("operation.abort_grace_secs must be greater than 0");
        }

        if self.llm.request_timeout_secs == 0 {
            errors.push("llm.request_timeout_secs must be greater than 0");
        }
        if self.llm.validation_retries == 0 {
            errors.push("llm.validation_retries must be greater than 0");
        }

        if self.tools.call_timeout_secs == 0 {
            errors.push("tools.call_timeout_secs must be greater than 0");
        }
        if self.tools.max_output_bytes < 1024 {
            errors.push("tools.max_output_bytes must be at least 1024");
        }

        if self.executor.max_steps == 0 {
            errors.push("executor.max_steps must be greater than 0");
        }
        if self.executor.repeat_threshold < 2 {
            errors.push("executor.repeat_threshold must be at least 2");
        }
        if self.executor.history.keep_recent == 0 {
            errors.push("executor.history.keep_recent must be greater than 0");
        }
        if self.executor.history.compress_after_messages <= self.executor.history.keep_recent {
            errors.push("executor.history.compress_after_messages must exceed keep_recent");
        }

        if self.planner.memory_window == 0 {
            errors.push("planner.memory_window must be greater than 0");
        }
        if self.planner.max_revisions == 0 {
            errors.push("planner.max_revisions must be greater than 0");
        }

        if self.reflector.inconclusive_replan_threshold == 0 {
            errors.push("reflector.inconclusive_replan_threshold must be greater than 0");
        }

        if self.broker.subscriber_queue < 8 {
            errors.push("broker.subscriber_queue must be at least 8");
        }
        if self.broker.replay_buffer == 0 {
            errors.push("broker.replay_buffer must be greater than 0");
        }

        if self.persist.event_tail == 0 {
            errors.push("persist.event_tail must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RedpilotError::Config(errors.join("; ")))
        }
    }
}

/// Scheduler-level limits for a single operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Maximum Executor workers in flight at once.
    pub max_parallel: usize,
    /// Total execution steps allowed across all subtasks.
    pub step_budget: usize,
    /// Concurrent operations the host accepts before `over-capacity`.
    pub capacity: usize,
    /// Whether plan batches require a human decision.
    pub hitl: bool,
    /// Grace period for cooperative cancellation.
    pub abort_grace_secs: u64,
    /// Automatic retries for L0/L1-attributed subtask failures.
    pub max_task_retries: u32,
    /// Checkpoint after every N reflections.
    pub checkpoint_interval: usize,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            step_budget: 128,
            capacity: 8,
            hitl: false,
            abort_grace_secs: 10,
            max_task_retries: 2,
            checkpoint_interval: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat-completions endpoint base, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Environment variable holding the API key. The key itself never
    /// lands in config files.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    /// Transport retries (connection refused, 5xx, rate limit).
    pub transport_retries: u32,
    /// Schema-validation retries with the validator error appended.
    pub validation_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "REDPILOT_API_KEY".to_string(),
            request_timeout_secs: 120,
            transport_retries: 3,
            validation_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolHostConfig {
    /// Tool host RPC endpoint.
    pub base_url: String,
    /// Per-call deadline.
    pub call_timeout_secs: u64,
    pub transport_retries: u32,
    pub backoff_base_ms: u64,
    /// Tool output beyond this is truncated with a marker.
    pub max_output_bytes: usize,
}

impl Default for ToolHostConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8931".to_string(),
            call_timeout_secs: 120,
            transport_retries: 3,
            backoff_base_ms: 300,
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Planning attempts kept verbatim in planner memory.
    pub memory_window: usize,
    /// Byte budget for each rendered graph summary in the prompt.
    pub summary_budget: usize,
    /// How many times a rejected/invalid batch may be revised before the
    /// operation stalls.
    pub max_revisions: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            memory_window: 10,
            summary_budget: 6_000,
            max_revisions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Step budget per subtask.
    pub max_steps: usize,
    /// Identical failing actions tolerated before the subtask fails.
    pub repeat_threshold: usize,
    /// Consecutive steps proposing nothing before the subtask stalls.
    pub no_progress_patience: usize,
    pub history: HistoryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            repeat_threshold: 3,
            no_progress_patience: 4,
            history: HistoryConfig::default(),
        }
    }
}

/// Message-history compression thresholds for the executor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub compress_after_messages: usize,
    pub compress_after_bytes: usize,
    /// Compress every N executed steps regardless of size.
    pub period_steps: usize,
    /// Latest messages always kept verbatim.
    pub keep_recent: usize,
    /// Minimum messages worth summarizing in one pass.
    pub min_compress: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            compress_after_messages: 24,
            compress_after_bytes: 48 * 1024,
            period_steps: 10,
            keep_recent: 6,
            min_compress: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectorConfig {
    /// Distinct inconclusive audits before an operation-level re-plan.
    pub inconclusive_replan_threshold: usize,
    /// Byte budget for the execution transcript shown to the reflector.
    pub transcript_budget: usize,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            inconclusive_replan_threshold: 3,
            transcript_budget: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bounded queue per subscriber; overflow truncates from the head.
    pub subscriber_queue: usize,
    /// Events retained per operation for late-subscriber replay.
    pub replay_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            replay_buffer: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Event-log tail kept per operation.
    pub event_tail: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self { event_tail: 512 }
    }
}

/// Filesystem layout under the state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    pub root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.root.join("operations")
    }

    pub fn event_db_path(&self) -> PathBuf {
        self.root.join("events.db")
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(self.operations_dir()).await?;
        Ok(())
    }
}
