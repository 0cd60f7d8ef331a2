use std::collections::{HashMap, HashSet, VecDeque};

use crate::llm::AuditStatus;

const INSIGHT_WINDOW: usize = 32;

/// Pattern memory across reflections.
///
/// Counts recurring failure/success patterns and tracks how many distinct
/// tasks have audited inconclusive in a row; the scheduler uses the latter
/// as a re-plan trigger.
#[derive(Debug, Default)]
pub struct ReflectionMemory {
    insights: VecDeque<(String, AuditStatus)>,
    failure_patterns: HashMap<String, u32>,
    success_patterns: HashMap<String, u32>,
    inconclusive_tasks: HashSet<String>,
}

impl ReflectionMemory {
    pub fn record(&mut self, task_id: &str, status: AuditStatus, pattern: Option<&str>) {
        self.insights.push_back((task_id.to_string(), status));
        while self.insights.len() > INSIGHT_WINDOW {
            self.insights.pop_front();
        }

        match status {
            AuditStatus::Inconclusive => {
                self.inconclusive_tasks.insert(task_id.to_string());
            }
            AuditStatus::Passed | AuditStatus::Failed => {
                // A decisive audit breaks the inconclusive streak.
                self.inconclusive_tasks.clear();
            }
        }

        if let Some(pattern) = pattern {
            let bucket = match status {
                AuditStatus::Passed => &mut self.success_patterns,
                _ => &mut self.failure_patterns,
            };
            *bucket.entry(pattern.to_string()).or_insert(0) += 1;
        }
    }

    /// Distinct tasks in the current inconclusive streak.
    pub fn consecutive_inconclusive(&self) -> usize {
        self.inconclusive_tasks.len()
    }

    pub fn failure_pattern_count(&self, pattern: &str) -> u32 {
        self.failure_patterns.get(pattern).copied().unwrap_or(0)
    }

    /// Most frequent failure patterns, for the planner's failure digest.
    pub fn top_failure_patterns(&self, limit: usize) -> Vec<(String, u32)> {
        let mut patterns: Vec<(String, u32)> = self
            .failure_patterns
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        patterns.truncate(limit);
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconclusive_streak_counts_distinct_tasks() {
        let mut memory = ReflectionMemory::default();
        memory.record("t1", AuditStatus::Inconclusive, None);
        memory.record("t1", AuditStatus::Inconclusive, None);
        memory.record("t2", AuditStatus::Inconclusive, None);
        assert_eq!(memory.consecutive_inconclusive(), 2);

        memory.record("t3", AuditStatus::Passed, None);
        assert_eq!(memory.consecutive_inconclusive(), 0);
    }

    #[test]
    fn failure_patterns_accumulate() {
        let mut memory = ReflectionMemory::default();
        memory.record("t1", AuditStatus::Failed, Some("HTTP_403_ON_POST"));
        memory.record("t2", AuditStatus::Failed, Some("HTTP_403_ON_POST"));
        memory.record("t3", AuditStatus::Passed, Some("default_creds"));
        assert_eq!(memory.failure_pattern_count("HTTP_403_ON_POST"), 2);
        assert_eq!(memory.top_failure_patterns(5)[0].0, "HTTP_403_ON_POST");
    }
}
