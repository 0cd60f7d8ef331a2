use chrono::Utc;
use tracing::{debug, info};

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::graph::{summary, GraphView};
use crate::guidance::GuidanceSource;
use crate::llm::{ask, schema_text, LlmClient, PlannerReply, Role};
use crate::operation::OpContext;

use super::memory::{PlannerMemory, PlanningAttempt};

const COMMAND_GUIDE: &str = r#"Graph commands (JSON objects, applied atomically as one batch):
  {"command":"ADD_NODE","node_data":{"id":"t1","kind":"task","description":"...","completion_criteria":"...","dependencies":[]}}
  {"command":"UPDATE_NODE","id":"t1","updates":{"description":"..."}}
  {"command":"ADD_EDGE","source":"t2","target":"t1","relation":"depends_on"}
  {"command":"DEPRECATE_NODE","id":"t1","reason":"..."}
  {"command":"ADD_CAUSAL_NODE","variant":"hypothesis","fields":{"description":"...","confidence":0.6}}
  {"command":"ADD_CAUSAL_EDGE","source":"ev-1","target":"hyp-1","relation":"supports","confidence":0.8}
Task ids must be unique; dependency cycles and terminal-status changes are rejected."#;

/// Drives one planning cycle: renders the graphs into a bounded prompt,
/// asks the planner model for a command batch, and keeps the long-term
/// planning memory current.
pub struct Planner {
    config: PlannerConfig,
    validation_retries: u32,
    pub memory: PlannerMemory,
}

impl Planner {
    pub fn new(config: PlannerConfig, validation_retries: u32) -> Self {
        let memory = PlannerMemory::new(config.memory_window);
        Self {
            config,
            validation_retries,
            memory,
        }
    }

    pub async fn plan(
        &mut self,
        llm: &dyn LlmClient,
        guidance: &dyn GuidanceSource,
        ctx: &OpContext,
        view: &GraphView,
        recent_failures: &[String],
    ) -> Result<PlannerReply> {
        let goal = view.goal().to_string();
        let guidance_text = guidance.retrieve(&goal).await.unwrap_or_else(|e| {
            debug!(error = %e, "guidance retrieval failed, continuing without");
            None
        });

        let initial = view.tasks.values().filter(|n| n.is_task()).count() == 0;
        let prompt = self.build_prompt(view, &goal, recent_failures, guidance_text.as_deref(), initial);

        let reply: PlannerReply =
            ask(llm, ctx, Role::Planner, &prompt, self.validation_retries).await?;

        info!(
            op_id = %ctx.op_id,
            commands = reply.graph_operations.len(),
            goal_achieved = reply.goal_achieved,
            "planner replied"
        );

        self.memory.record_attempt(PlanningAttempt {
            at: Utc::now(),
            thought: reply.thought.clone(),
            commands: reply.graph_operations.len(),
            goal_achieved: reply.goal_achieved,
            outcome: "pending".to_string(),
        });

        Ok(reply)
    }

    pub fn max_revisions(&self) -> u32 {
        self.config.max_revisions
    }

    fn build_prompt(
        &self,
        view: &GraphView,
        goal: &str,
        recent_failures: &[String],
        guidance: Option<&str>,
        initial: bool,
    ) -> String {
        let budget = self.config.summary_budget;
        let mut sections = vec![format!("Goal: {}", goal)];

        if initial {
            sections.push(
                "No plan exists yet. Produce the initial task breakdown: at least one task, \
                 each with a crisp completion criterion."
                    .to_string(),
            );
        } else {
            sections.push(format!(
                "Task graph:\n{}",
                summary::render_task_graph(view, budget)
            ));
            sections.push(format!(
                "Belief graph:\n{}",
                summary::render_causal_graph(view, budget)
            ));
            let paths = summary::attack_paths(view, 3);
            if !paths.is_empty() {
                sections.push(format!("Strongest causal chains:\n{}", paths.join("\n")));
            }
            if view.is_dead_end() {
                sections.push(
                    "Every planned task has ended without success. Either emit a recovery \
                     batch with new tasks, or set goal_achieved accordingly."
                        .to_string(),
                );
            }
        }

        if !recent_failures.is_empty() {
            sections.push(format!("Recent failures:\n{}", recent_failures.join("\n")));
        }

        let memory = self.memory.render(budget);
        if !memory.is_empty() {
            sections.push(memory);
        }

        if let Some(text) = guidance {
            sections.push(format!("Retrieved guidance:\n{}", text));
        }

        sections.push(COMMAND_GUIDE.to_string());
        sections.push(format!(
            "Reply with JSON matching this schema:\n{}",
            schema_text::<PlannerReply>()
        ));

        sections.join("\n\n")
    }
}
