use std::collections::BTreeMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::truncate_at_boundary;

/// One planning cycle, kept for reasoning continuity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningAttempt {
    pub at: DateTime<Utc>,
    pub thought: String,
    pub commands: usize,
    pub goal_achieved: bool,
    /// Filled in after the gate and the store have had their say.
    pub outcome: String,
}

/// Sliding-window long-term memory for the planner.
///
/// Attempts beyond the window fold into a compressed plain-text summary;
/// rejected strategies are remembered so the planner stops proposing them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerMemory {
    window: usize,
    attempts: VecDeque<PlanningAttempt>,
    rejected_strategies: BTreeMap<String, String>,
    compressed_summary: String,
    compression_count: u32,
}

impl PlannerMemory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    pub fn record_attempt(&mut self, attempt: PlanningAttempt) {
        self.attempts.push_back(attempt);
        while self.attempts.len() > self.window {
            let oldest = self.attempts.pop_front().expect("non-empty window");
            let line = format!(
                "[{}] {} ({} ops, {})",
                oldest.at.format("%H:%M:%S"),
                truncate_at_boundary(&oldest.thought, 120),
                oldest.commands,
                oldest.outcome
            );
            if !self.compressed_summary.is_empty() {
                self.compressed_summary.push('\n');
            }
            self.compressed_summary.push_str(&line);
            self.compressed_summary = truncate_at_boundary(&self.compressed_summary, 4_000);
            self.compression_count += 1;
        }
    }

    /// Annotate the latest attempt with what actually happened to it.
    pub fn set_latest_outcome(&mut self, outcome: impl Into<String>) {
        if let Some(latest) = self.attempts.back_mut() {
            latest.outcome = outcome.into();
        }
    }

    /// Remember a strategy the human or the store refused.
    pub fn reject_strategy(&mut self, strategy: impl Into<String>, reason: impl Into<String>) {
        self.rejected_strategies
            .entry(strategy.into())
            .or_insert_with(|| reason.into());
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Render for the planning prompt, bounded.
    pub fn render(&self, budget: usize) -> String {
        let mut sections = Vec::new();

        if !self.compressed_summary.is_empty() {
            sections.push(format!("Earlier planning (compressed):\n{}", self.compressed_summary));
        }

        if !self.attempts.is_empty() {
            let lines: Vec<String> = self
                .attempts
                .iter()
                .map(|a| {
                    format!(
                        "- {} ({} ops, {})",
                        truncate_at_boundary(&a.thought, 140),
                        a.commands,
                        a.outcome
                    )
                })
                .collect();
            sections.push(format!("Recent planning attempts:\n{}", lines.join("\n")));
        }

        if !self.rejected_strategies.is_empty() {
            let lines: Vec<String> = self
                .rejected_strategies
                .iter()
                .map(|(strategy, reason)| format!("- {}: {}", strategy, reason))
                .collect();
            sections.push(format!(
                "Strategies already rejected (do not repeat):\n{}",
                lines.join("\n")
            ));
        }

        if sections.is_empty() {
            return String::new();
        }
        truncate_at_boundary(&sections.join("\n\n"), budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(thought: &str) -> PlanningAttempt {
        PlanningAttempt {
            at: Utc::now(),
            thought: thought.to_string(),
            commands: 1,
            goal_achieved: false,
            outcome: "applied".to_string(),
        }
    }

    #[test]
    fn window_overflow_compresses() {
        let mut memory = PlannerMemory::new(2);
        for i in 0..5 {
            memory.record_attempt(attempt(&format!("attempt {}", i)));
        }
        assert_eq!(memory.attempt_count(), 2);
        let rendered = memory.render(8_000);
        assert!(rendered.contains("compressed"));
        assert!(rendered.contains("attempt 4"));
    }

    #[test]
    fn rejected_strategies_persist_first_reason() {
        let mut memory = PlannerMemory::new(4);
        memory.reject_strategy("brute force", "locked out after 3 tries");
        memory.reject_strategy("brute force", "other");
        let rendered = memory.render(2_000);
        assert!(rendered.contains("locked out"));
        assert!(!rendered.contains("other"));
    }

    #[test]
    fn empty_memory_renders_nothing() {
        assert!(PlannerMemory::new(4).render(1_000).is_empty());
    }
}
