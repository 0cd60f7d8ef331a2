use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{RedpilotError, RejectReason, Rejection, Result};

use super::causal::{CausalEdge, CausalKind, CausalNode, CausalRelation};
use super::command::{validate_batch, GraphCommand};
use super::cycle::detect_cycle;
use super::node::{NodeKind, TaskNode};
use super::status::NodeStatus;

pub const ROOT_ID: &str = "root";

/// Supporting edges nudge a hypothesis up, contradicting edges push it
/// down harder. Bounds keep a hypothesis falsifiable either way.
const SUPPORT_WEIGHT: f64 = 0.10;
const CONTRADICT_WEIGHT: f64 = 0.15;
const CONFIDENCE_CEILING: f64 = 0.95;
const CONFIDENCE_FLOOR: f64 = 0.05;

/// The full dual-graph state. Plain data: snapshots are `Arc` clones and
/// serialization is a pure copy, so inter-graph references stay id-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub root_id: String,
    pub tasks: BTreeMap<String, TaskNode>,
    /// Task ids in insertion order; breaks topological-sort ties
    /// deterministically even when timestamps collide within a batch.
    pub task_order: Vec<String>,
    pub causal_nodes: BTreeMap<String, CausalNode>,
    pub causal_edges: Vec<CausalEdge>,
}

pub type GraphView = Arc<GraphState>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub status_changes: Vec<StatusChange>,
}

impl GraphState {
    fn new(goal: &str) -> Self {
        let mut root = TaskNode::new(ROOT_ID, NodeKind::Root, goal);
        root.transition(NodeStatus::InProgress);
        let mut tasks = BTreeMap::new();
        tasks.insert(root.id.clone(), root);
        Self {
            root_id: ROOT_ID.to_string(),
            tasks,
            task_order: vec![ROOT_ID.to_string()],
            causal_nodes: BTreeMap::new(),
            causal_edges: Vec::new(),
        }
    }

    pub fn root(&self) -> &TaskNode {
        &self.tasks[&self.root_id]
    }

    pub fn goal(&self) -> &str {
        &self.root().description
    }

    /// Dependency map over task-kind nodes, for cycle detection.
    fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        self.tasks
            .values()
            .filter(|n| n.is_task())
            .map(|n| (n.id.clone(), n.dependencies.clone()))
            .collect()
    }

    /// Task ids in topological order (dependencies first), ties broken by
    /// creation order.
    pub fn topo_order(&self) -> Vec<String> {
        let deps = self.dependency_map();
        let position: HashMap<&str, usize> = self
            .task_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, ds) in &deps {
            indegree.entry(id.as_str()).or_insert(0);
            for d in ds {
                if deps.contains_key(d.as_str()) {
                    *indegree.entry(id.as_str()).or_insert(0) += 1;
                    dependents.entry(d.as_str()).or_default().push(id.as_str());
                }
            }
        }

        let sort_key = |id: &str| position.get(id).copied().unwrap_or(usize::MAX);

        let mut available: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        available.sort_by_key(|id| sort_key(id));

        let mut order = Vec::with_capacity(deps.len());
        let mut queue: VecDeque<&str> = available.into();
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            let mut freed = Vec::new();
            for dep in dependents.get(id).cloned().unwrap_or_default() {
                let entry = indegree.get_mut(dep).expect("indegree entry");
                *entry -= 1;
                if *entry == 0 {
                    freed.push(dep);
                }
            }
            freed.sort_by_key(|id| sort_key(id));
            for f in freed {
                queue.push_back(f);
            }
        }
        order
    }

    /// Tasks eligible for dispatch: pending, with every dependency in a
    /// terminal success state. A failed, aborted or deprecated dependency
    /// blocks readiness until the planner prunes or rewires it.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.topo_order()
            .into_iter()
            .filter(|id| {
                let node = &self.tasks[id];
                node.status == NodeStatus::Pending
                    && node.dependencies.iter().all(|dep| {
                        self.tasks
                            .get(dep)
                            .map(|d| d.status.is_success())
                            .unwrap_or(false)
                    })
            })
            .collect()
    }

    /// Transitive dependencies of a task.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self
            .tasks
            .get(id)
            .map(|n| n.dependencies.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(node) = self.tasks.get(&next) {
                queue.extend(node.dependencies.iter().cloned());
                out.push(next);
            }
        }
        out
    }

    /// Transitive dependents of a task, plus its own actions.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for node in self.tasks.values() {
                let is_dependent = node.dependencies.iter().any(|d| d == current);
                let is_child = node.parent.as_deref() == Some(current);
                if (is_dependent || is_child) && seen.insert(node.id.clone()) {
                    queue.push_back(node.id.as_str());
                    out.push(node.id.clone());
                }
            }
        }
        out
    }

    /// Direct graph neighborhood: dependencies, dependents, children and
    /// parent.
    pub fn neighbors(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if let Some(node) = self.tasks.get(id) {
            out.extend(node.dependencies.iter().cloned());
            if let Some(parent) = &node.parent {
                out.push(parent.clone());
            }
        }
        for node in self.tasks.values() {
            if node.dependencies.iter().any(|d| d == id)
                || node.parent.as_deref() == Some(id)
            {
                out.push(node.id.clone());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Action nodes belonging to a task, oldest first.
    pub fn actions_of(&self, task_id: &str) -> Vec<&TaskNode> {
        let mut actions: Vec<&TaskNode> = self
            .tasks
            .values()
            .filter(|n| n.is_action() && n.parent.as_deref() == Some(task_id))
            .collect();
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        actions
    }

    pub fn in_progress_tasks(&self) -> usize {
        self.tasks
            .values()
            .filter(|n| n.is_task() && n.status == NodeStatus::InProgress)
            .count()
    }

    /// True when every top-level task sits in a terminal non-success
    /// state: the planner must either re-plan or concede.
    pub fn is_dead_end(&self) -> bool {
        let tasks: Vec<&TaskNode> = self.tasks.values().filter(|n| n.is_task()).collect();
        !tasks.is_empty()
            && tasks
                .iter()
                .all(|n| n.status.is_terminal() && !n.status.is_success())
    }
}

/// The dual-graph store. Mutation is serialized behind the write lock;
/// readers hold cheap `Arc` snapshots that never observe a half-applied
/// batch.
pub struct GraphStore {
    state: RwLock<GraphView>,
}

impl GraphStore {
    pub fn new(goal: &str) -> Self {
        Self {
            state: RwLock::new(Arc::new(GraphState::new(goal))),
        }
    }

    /// Rebuild from a checkpointed state.
    pub fn from_state(state: GraphState) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
        }
    }

    pub fn snapshot(&self) -> GraphView {
        self.state.read().clone()
    }

    pub fn ready_tasks(&self) -> Vec<String> {
        self.snapshot().ready_tasks()
    }

    /// Apply a command batch atomically. On any rejection the whole batch
    /// rolls back and every offending command is reported.
    pub fn apply(&self, batch: &[GraphCommand]) -> Result<ApplyOutcome> {
        let mut guard = self.state.write();
        let mut scratch: GraphState = guard.as_ref().clone();

        let mut rejections = validate_batch(batch);
        let structurally_bad: HashSet<usize> = rejections.iter().map(|r| r.index).collect();

        let mut outcome = ApplyOutcome::default();
        for (index, command) in batch.iter().enumerate() {
            if structurally_bad.contains(&index) {
                continue;
            }
            match apply_command(&mut scratch, command) {
                Ok(Some(change)) => {
                    outcome.applied += 1;
                    outcome.status_changes.push(change);
                }
                Ok(None) => outcome.applied += 1,
                Err((reason, detail)) => {
                    rejections.push(Rejection::new(index, reason, detail));
                }
            }
        }

        if rejections.is_empty() {
            *guard = Arc::new(scratch);
            Ok(outcome)
        } else {
            rejections.sort_by_key(|r| r.index);
            Err(RedpilotError::Invariant(rejections))
        }
    }
}

type CommandResult = std::result::Result<Option<StatusChange>, (RejectReason, String)>;

fn apply_command(state: &mut GraphState, command: &GraphCommand) -> CommandResult {
    match command {
        GraphCommand::AddNode { node_data } => {
            let draft = node_data.clone();
            if state.tasks.contains_key(&draft.id) {
                return Err((
                    RejectReason::DuplicateId,
                    format!("node {} already exists", draft.id),
                ));
            }
            if draft.kind == NodeKind::Root {
                return Err((
                    RejectReason::InvariantViolation,
                    "operation already has a root".to_string(),
                ));
            }
            for dep in &draft.dependencies {
                if !state.tasks.contains_key(dep) {
                    return Err((
                        RejectReason::UnknownId,
                        format!("dependency {} of {} does not exist", dep, draft.id),
                    ));
                }
            }

            let mut node = draft.into_node();
            match node.kind {
                NodeKind::Task => {
                    if node.parent.is_none() {
                        node.parent = Some(state.root_id.clone());
                    }
                }
                NodeKind::Action => {
                    let parent_id = node.parent.clone().ok_or_else(|| {
                        (
                            RejectReason::InvariantViolation,
                            format!("action {} has no parent task", node.id),
                        )
                    })?;
                    let parent = state.tasks.get(&parent_id).ok_or_else(|| {
                        (
                            RejectReason::UnknownId,
                            format!("parent {} of action {} does not exist", parent_id, node.id),
                        )
                    })?;
                    if !parent.is_task() {
                        return Err((
                            RejectReason::InvariantViolation,
                            format!("parent {} of action {} is not a task", parent_id, node.id),
                        ));
                    }
                    // Actions inherit their parent's lifecycle: a terminal
                    // task accepts no new actions.
                    if parent.status.is_terminal() {
                        return Err((
                            RejectReason::InvariantViolation,
                            format!(
                                "parent {} is terminal; action {} rejected",
                                parent_id, node.id
                            ),
                        ));
                    }
                }
                NodeKind::Root => unreachable!("rejected above"),
            }

            let id = node.id.clone();
            state.tasks.insert(id.clone(), node);
            if let Some(path) = detect_cycle(&state.dependency_map()) {
                state.tasks.remove(&id);
                return Err((
                    RejectReason::Cycle,
                    format!("adding {} closes a cycle: {}", id, path.join(" -> ")),
                ));
            }
            state.task_order.push(id);
            Ok(None)
        }

        GraphCommand::UpdateNode { id, updates } => {
            if let Some(existing) = state.tasks.get(id) {
                let mut node = existing.clone();
                let change = node.apply_updates(updates)?;
                if updates.contains_key("dependencies") {
                    for dep in &node.dependencies {
                        if !state.tasks.contains_key(dep) {
                            return Err((
                                RejectReason::UnknownId,
                                format!("dependency {} of {} does not exist", dep, id),
                            ));
                        }
                    }
                    let previous = state.tasks.insert(id.clone(), node.clone());
                    if let Some(path) = detect_cycle(&state.dependency_map()) {
                        if let Some(prev) = previous {
                            state.tasks.insert(id.clone(), prev);
                        }
                        return Err((
                            RejectReason::Cycle,
                            format!("rewiring {} closes a cycle: {}", id, path.join(" -> ")),
                        ));
                    }
                } else {
                    state.tasks.insert(id.clone(), node);
                }
                return Ok(change.map(|(from, to)| StatusChange {
                    id: id.clone(),
                    from,
                    to,
                }));
            }

            if let Some(existing) = state.causal_nodes.get(id) {
                let mut node = existing.clone();
                let promotion = node.apply_updates(updates)?;
                if let Some(target_kind) = promotion {
                    check_promotion(state, &node, target_kind)?;
                    node.kind = target_kind;
                }
                state.causal_nodes.insert(id.clone(), node);
                return Ok(None);
            }

            Err((
                RejectReason::UnknownId,
                format!("node {} does not exist", id),
            ))
        }

        GraphCommand::AddEdge { source, target, .. } => {
            if !state.tasks.contains_key(target) {
                return Err((
                    RejectReason::UnknownId,
                    format!("edge target {} does not exist", target),
                ));
            }
            let node = state.tasks.get(source).ok_or_else(|| {
                (
                    RejectReason::UnknownId,
                    format!("edge source {} does not exist", source),
                )
            })?;
            if node.status.is_terminal() {
                return Err((
                    RejectReason::TerminalViolation,
                    format!("cannot add dependency to terminal task {}", source),
                ));
            }
            if source == target {
                return Err((
                    RejectReason::Cycle,
                    format!("{} cannot depend on itself", source),
                ));
            }
            if node.dependencies.iter().any(|d| d == target) {
                return Ok(None); // idempotent
            }

            let mut node = node.clone();
            node.dependencies.push(target.clone());
            let previous = state.tasks.insert(source.clone(), node);
            if let Some(path) = detect_cycle(&state.dependency_map()) {
                if let Some(prev) = previous {
                    state.tasks.insert(source.clone(), prev);
                }
                return Err((
                    RejectReason::Cycle,
                    format!(
                        "edge {} -> {} closes a cycle: {}",
                        source,
                        target,
                        path.join(" -> ")
                    ),
                ));
            }
            Ok(None)
        }

        GraphCommand::DeprecateNode { id, reason } => {
            if let Some(node) = state.tasks.get_mut(id) {
                if node.status == NodeStatus::Deprecated {
                    return Ok(None); // idempotent
                }
                if node.status.is_terminal() {
                    return Err((
                        RejectReason::TerminalViolation,
                        format!("{} is terminal ({})", id, node.status),
                    ));
                }
                let from = node.status;
                node.transition(NodeStatus::Deprecated);
                node.artifacts.push(json!({ "deprecated_reason": reason }));
                return Ok(Some(StatusChange {
                    id: id.clone(),
                    from,
                    to: NodeStatus::Deprecated,
                }));
            }

            if let Some(node) = state.causal_nodes.get_mut(id) {
                if !node.deprecated {
                    node.deprecated = true;
                    node.deprecated_reason = Some(reason.clone());
                }
                return Ok(None);
            }

            Err((
                RejectReason::UnknownId,
                format!("node {} does not exist", id),
            ))
        }

        GraphCommand::AddCausalNode { variant, fields } => {
            let auto_id = fields.is_auto_id();
            let node = fields.clone().into_node(*variant);
            if let Some(existing) = state.causal_nodes.get(&node.id) {
                if auto_id && existing.kind == node.kind {
                    // Content-addressed duplicate: the same distilled fact
                    // staged twice collapses to one node.
                    return Ok(None);
                }
                return Err((
                    RejectReason::DuplicateId,
                    format!("causal node {} already exists", node.id),
                ));
            }
            state.causal_nodes.insert(node.id.clone(), node);
            Ok(None)
        }

        GraphCommand::AddCausalEdge {
            source,
            target,
            relation,
            confidence,
        } => {
            for endpoint in [source, target] {
                if !state.causal_nodes.contains_key(endpoint) {
                    return Err((
                        RejectReason::UnknownId,
                        format!("causal node {} does not exist", endpoint),
                    ));
                }
            }

            if let Some(existing) = state
                .causal_edges
                .iter_mut()
                .find(|e| &e.source == source && &e.target == target && e.relation == *relation)
            {
                // Edge confidence is monotone within a commit: re-assertion
                // can only strengthen it.
                existing.confidence = existing.confidence.max(*confidence);
            } else {
                state.causal_edges.push(CausalEdge {
                    source: source.clone(),
                    target: target.clone(),
                    relation: *relation,
                    confidence: *confidence,
                });
            }

            propagate_hypothesis_confidence(state, target, *relation, *confidence);
            Ok(None)
        }
    }
}

/// Nudge a hypothesis's confidence when evidence lands on it.
fn propagate_hypothesis_confidence(
    state: &mut GraphState,
    target: &str,
    relation: CausalRelation,
    edge_confidence: f64,
) {
    let Some(node) = state.causal_nodes.get_mut(target) else {
        return;
    };
    if node.kind != CausalKind::Hypothesis {
        return;
    }
    let current = node.confidence.unwrap_or(0.5);
    let adjusted = match relation {
        CausalRelation::Supports | CausalRelation::Validates => {
            (current + SUPPORT_WEIGHT * edge_confidence).min(CONFIDENCE_CEILING)
        }
        CausalRelation::Contradicts => {
            (current - CONTRADICT_WEIGHT * edge_confidence).max(CONFIDENCE_FLOOR)
        }
        _ => current,
    };
    node.confidence = Some(adjusted);
}

/// Promotion rules up the belief ladder.
///
/// A hypothesis needs grounding before it may become a vulnerability; a
/// vulnerability needs an action-backed `validates` edge before it counts
/// as confirmed.
fn check_promotion(
    state: &GraphState,
    node: &CausalNode,
    target_kind: CausalKind,
) -> std::result::Result<(), (RejectReason, String)> {
    match (node.kind, target_kind) {
        (CausalKind::Hypothesis, CausalKind::Vulnerability) => {
            let grounded = state.causal_edges.iter().any(|e| {
                e.target == node.id
                    && matches!(
                        e.relation,
                        CausalRelation::Supports | CausalRelation::Validates | CausalRelation::Reveals
                    )
                    && state
                        .causal_nodes
                        .get(&e.source)
                        .map(|s| s.kind.is_grounding())
                        .unwrap_or(false)
            });
            if grounded {
                Ok(())
            } else {
                Err((
                    RejectReason::InvariantViolation,
                    format!(
                        "{} has no supporting evidence; cannot promote to vulnerability",
                        node.id
                    ),
                ))
            }
        }
        (CausalKind::Vulnerability, CausalKind::ConfirmedVulnerability) => {
            let validated = state.causal_edges.iter().any(|e| {
                e.target == node.id
                    && e.relation == CausalRelation::Validates
                    && state
                        .causal_nodes
                        .get(&e.source)
                        .map(|s| s.source_action_id.is_some())
                        .unwrap_or(false)
            });
            if validated {
                Ok(())
            } else {
                Err((
                    RejectReason::InvariantViolation,
                    format!(
                        "{} lacks an action-backed validates edge; cannot confirm",
                        node.id
                    ),
                ))
            }
        }
        (from, to) => Err((
            RejectReason::InvariantViolation,
            format!("unsupported kind change {} -> {} on {}", from, to, node.id),
        )),
    }
}
