//! Bounded text renderings of the dual graphs for prompt assembly.
//!
//! Everything here is a pure function of a snapshot; budgets are byte
//! budgets and cuts are always marked.

use std::collections::HashSet;

use crate::utils::truncate_at_boundary;

use super::causal::{CausalKind, CausalRelation};
use super::status::NodeStatus;
use super::store::GraphState;

/// One line per task: id, status, dependencies, clipped description.
pub fn render_task_graph(state: &GraphState, budget: usize) -> String {
    let mut lines = Vec::new();
    for id in state.topo_order() {
        let node = &state.tasks[&id];
        let deps = if node.dependencies.is_empty() {
            String::new()
        } else {
            format!(" deps=[{}]", node.dependencies.join(","))
        };
        let level = node
            .failure_level
            .map(|l| format!(" {}", l))
            .unwrap_or_default();
        lines.push(format!(
            "- {} [{}]{}{}: {}",
            node.id,
            node.status,
            deps,
            level,
            truncate_at_boundary(&node.description, 120)
        ));
    }
    if lines.is_empty() {
        return "(no tasks planned yet)".to_string();
    }
    truncate_at_boundary(&lines.join("\n"), budget)
}

/// Belief graph grouped by variant, deprecated nodes elided.
pub fn render_causal_graph(state: &GraphState, budget: usize) -> String {
    let groups = [
        CausalKind::Flag,
        CausalKind::ConfirmedVulnerability,
        CausalKind::Vulnerability,
        CausalKind::Hypothesis,
        CausalKind::KeyFact,
        CausalKind::Evidence,
    ];
    let mut lines = Vec::new();
    for kind in groups {
        let mut nodes: Vec<_> = state
            .causal_nodes
            .values()
            .filter(|n| n.kind == kind && !n.deprecated)
            .collect();
        if nodes.is_empty() {
            continue;
        }
        nodes.sort_by(|a, b| {
            b.confidence
                .unwrap_or(0.0)
                .partial_cmp(&a.confidence.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        lines.push(format!("{}:", kind));
        for node in nodes {
            let confidence = node
                .confidence
                .map(|c| format!(" ({:.2})", c))
                .unwrap_or_default();
            lines.push(format!(
                "  - {}{}: {}",
                node.id,
                confidence,
                truncate_at_boundary(&node.description, 100)
            ));
        }
    }
    if lines.is_empty() {
        return "(belief graph is empty)".to_string();
    }
    truncate_at_boundary(&lines.join("\n"), budget)
}

/// Causal chains ending in a vulnerability or flag, strongest first.
///
/// Score is the weakest edge along the chain: a path is only as credible
/// as its flimsiest link.
pub fn attack_paths(state: &GraphState, top_n: usize) -> Vec<String> {
    let targets: Vec<&str> = state
        .causal_nodes
        .values()
        .filter(|n| {
            !n.deprecated
                && matches!(
                    n.kind,
                    CausalKind::Vulnerability
                        | CausalKind::ConfirmedVulnerability
                        | CausalKind::Flag
                )
        })
        .map(|n| n.id.as_str())
        .collect();

    let mut paths: Vec<(f64, Vec<String>)> = Vec::new();
    for target in targets {
        let mut chain = vec![target.to_string()];
        let mut score: f64 = 1.0;
        let mut current = target.to_string();
        let mut seen = HashSet::new();
        seen.insert(current.clone());

        // Walk backwards along the strongest inbound supporting edge.
        while let Some(edge) = state
            .causal_edges
            .iter()
            .filter(|e| {
                e.target == current
                    && !seen.contains(&e.source)
                    && matches!(
                        e.relation,
                        CausalRelation::Supports
                            | CausalRelation::Validates
                            | CausalRelation::Reveals
                    )
            })
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        {
            score = score.min(edge.confidence);
            chain.push(edge.source.clone());
            seen.insert(edge.source.clone());
            current = edge.source.clone();
        }

        if chain.len() > 1 {
            chain.reverse();
            paths.push((score, chain));
        }
    }

    paths.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    paths
        .into_iter()
        .take(top_n)
        .map(|(score, chain)| format!("[{:.2}] {}", score, chain.join(" -> ")))
        .collect()
}

/// Summaries of a task's terminal dependencies: what they did, how they
/// ended, and which beliefs their actions produced.
pub fn dependency_briefing(state: &GraphState, task_id: &str, budget: usize) -> String {
    let Some(task) = state.tasks.get(task_id) else {
        return String::new();
    };
    let mut lines = Vec::new();
    for dep_id in &task.dependencies {
        let Some(dep) = state.tasks.get(dep_id) else {
            continue;
        };
        lines.push(format!(
            "- {} [{}]: {}",
            dep.id,
            dep.status,
            truncate_at_boundary(&dep.description, 100)
        ));
        if let Some(result) = &dep.result {
            lines.push(format!("  outcome: {}", truncate_at_boundary(result, 160)));
        }
        let action_ids: HashSet<&str> = state
            .actions_of(dep_id)
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        for node in state.causal_nodes.values() {
            if node
                .source_action_id
                .as_deref()
                .map(|a| action_ids.contains(a))
                .unwrap_or(false)
            {
                lines.push(format!(
                    "  produced {} {}: {}",
                    node.kind,
                    node.id,
                    truncate_at_boundary(&node.description, 80)
                ));
            }
        }
    }
    if lines.is_empty() {
        return "(no dependencies)".to_string();
    }
    truncate_at_boundary(&lines.join("\n"), budget)
}

/// The causal slice relevant to one subtask: beliefs produced by its
/// ancestors' actions, plus undeprecated hypotheses and stronger nodes
/// that shape what is worth trying next.
pub fn relevant_causal_context(state: &GraphState, task_id: &str, budget: usize) -> String {
    let mut scope: HashSet<String> = HashSet::new();
    let mut related_tasks = state.ancestors(task_id);
    related_tasks.push(task_id.to_string());
    for tid in &related_tasks {
        for action in state.actions_of(tid) {
            scope.insert(action.id.clone());
        }
    }

    let mut lines = Vec::new();
    for node in state.causal_nodes.values() {
        if node.deprecated {
            continue;
        }
        let from_scope = node
            .source_action_id
            .as_deref()
            .map(|a| scope.contains(a))
            .unwrap_or(false);
        let globally_relevant = matches!(
            node.kind,
            CausalKind::Hypothesis
                | CausalKind::Vulnerability
                | CausalKind::ConfirmedVulnerability
                | CausalKind::Flag
        );
        if from_scope || globally_relevant {
            let confidence = node
                .confidence
                .map(|c| format!(" ({:.2})", c))
                .unwrap_or_default();
            lines.push(format!(
                "- {} {}{}: {}",
                node.kind,
                node.id,
                confidence,
                truncate_at_boundary(&node.description, 100)
            ));
        }
    }
    if lines.is_empty() {
        return "(no relevant beliefs yet)".to_string();
    }
    truncate_at_boundary(&lines.join("\n"), budget)
}

/// Recent failed tasks with their attribution, newest first.
pub fn recent_failures(state: &GraphState, limit: usize) -> Vec<String> {
    let mut failed: Vec<_> = state
        .tasks
        .values()
        .filter(|n| n.is_task() && n.status == NodeStatus::Failed)
        .collect();
    failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    failed
        .into_iter()
        .take(limit)
        .map(|n| {
            let level = n
                .failure_level
                .map(|l| format!(" [{}]", l))
                .unwrap_or_default();
            format!(
                "{}{}: {}",
                n.id,
                level,
                truncate_at_boundary(&n.description, 100)
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::causal::CausalDraft;
    use crate::graph::command::GraphCommand;
    use crate::graph::node::NodeDraft;
    use crate::graph::store::GraphStore;

    fn seeded_store() -> GraphStore {
        let store = GraphStore::new("capture the flag");
        store
            .apply(&[
                GraphCommand::AddNode {
                    node_data: NodeDraft::task("t1", "enumerate services"),
                },
                GraphCommand::AddNode {
                    node_data: NodeDraft::task("t2", "exploit weak login")
                        .with_dependencies(vec!["t1".into()]),
                },
            ])
            .unwrap();
        store
    }

    #[test]
    fn task_rendering_lists_dependencies() {
        let store = seeded_store();
        let text = render_task_graph(&store.snapshot(), 4096);
        assert!(text.contains("t2 [pending] deps=[t1]"));
    }

    #[test]
    fn attack_paths_rank_by_weakest_edge() {
        let store = GraphStore::new("goal");
        store
            .apply(&[
                GraphCommand::AddCausalNode {
                    variant: CausalKind::Evidence,
                    fields: CausalDraft::new("verbose sql error").with_source_action("a1"),
                },
                GraphCommand::AddCausalNode {
                    variant: CausalKind::Hypothesis,
                    fields: CausalDraft::new("sqli").with_confidence(0.7),
                },
            ])
            .unwrap();
        let view = store.snapshot();
        let ev = view
            .causal_nodes
            .values()
            .find(|n| n.kind == CausalKind::Evidence)
            .unwrap()
            .id
            .clone();
        let hyp = view
            .causal_nodes
            .values()
            .find(|n| n.kind == CausalKind::Hypothesis)
            .unwrap()
            .id
            .clone();
        store
            .apply(&[
                GraphCommand::AddCausalEdge {
                    source: ev.clone(),
                    target: hyp.clone(),
                    relation: CausalRelation::Supports,
                    confidence: 0.9,
                },
            ])
            .unwrap();
        // Promote the grounded hypothesis so a path target exists.
        store
            .apply(&[GraphCommand::UpdateNode {
                id: hyp.clone(),
                updates: serde_json::json!({"kind": "vulnerability"})
                    .as_object()
                    .unwrap()
                    .clone(),
            }])
            .unwrap();

        let paths = attack_paths(&store.snapshot(), 3);
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with("[0.90]"));
        assert!(paths[0].contains(&format!("{} -> {}", ev, hyp)));
    }

    #[test]
    fn empty_graph_renders_placeholders() {
        let store = GraphStore::new("goal");
        let view = store.snapshot();
        assert_eq!(render_causal_graph(&view, 1024), "(belief graph is empty)");
        assert!(attack_paths(&view, 3).is_empty());
    }
}
