use serde::{Deserialize, Serialize};

use crate::llm::Role;

pub const DEFAULT_PLANNER_MODEL: &str = "gpt-4o";
pub const DEFAULT_EXECUTOR_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_REFLECTOR_MODEL: &str = "gpt-4o";

/// Per-role model selection.
///
/// The planner and reflector default to the stronger model; execution is
/// the high-volume role and defaults to the cheaper one. Operation options
/// may override any of these per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub planner: String,
    pub executor: String,
    pub reflector: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            planner: DEFAULT_PLANNER_MODEL.to_string(),
            executor: DEFAULT_EXECUTOR_MODEL.to_string(),
            reflector: DEFAULT_REFLECTOR_MODEL.to_string(),
        }
    }
}

impl ModelConfig {
    pub fn resolve(&self, role: Role) -> &str {
        match role {
            Role::Planner => &self.planner,
            Role::Executor => &self.executor,
            Role::Reflector => &self.reflector,
        }
    }

    pub fn override_role(&mut self, role: Role, model: impl Into<String>) {
        let model = model.into();
        if model.is_empty() {
            return;
        }
        match role {
            Role::Planner => self.planner = model,
            Role::Executor => self.executor = model,
            Role::Reflector => self.reflector = model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_per_role() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.resolve(Role::Planner), DEFAULT_PLANNER_MODEL);
        assert_eq!(cfg.resolve(Role::Executor), DEFAULT_EXECUTOR_MODEL);
    }

    #[test]
    fn empty_override_is_ignored() {
        let mut cfg = ModelConfig::default();
        cfg.override_role(Role::Executor, "");
        assert_eq!(cfg.executor, DEFAULT_EXECUTOR_MODEL);
        cfg.override_role(Role::Executor, "claude-sonnet");
        assert_eq!(cfg.executor, "claude-sonnet");
    }
}
