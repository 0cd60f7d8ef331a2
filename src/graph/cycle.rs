use std::collections::{HashMap, HashSet};

/// Detects cycles in a dependency graph using DFS.
///
/// Returns the offending path when one exists. Used by the command applier
/// to keep the task DAG acyclic: any batch that would close a cycle is
/// rejected wholesale.
pub fn detect_cycle<S: AsRef<str>>(dependencies: &HashMap<String, Vec<S>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node in dependencies.keys() {
        if dfs_cycle(node, dependencies, &mut visited, &mut rec_stack, &mut path) {
            return Some(path);
        }
    }

    None
}

fn dfs_cycle<S: AsRef<str>>(
    node: &str,
    graph: &HashMap<String, Vec<S>>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    let node_str = node.to_string();

    if rec_stack.contains(&node_str) {
        path.push(node_str);
        return true;
    }

    if visited.contains(&node_str) {
        return false;
    }

    visited.insert(node_str.clone());
    rec_stack.insert(node_str.clone());
    path.push(node_str.clone());

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if dfs_cycle(dep.as_ref(), graph, visited, rec_stack, path) {
                return true;
            }
        }
    }

    rec_stack.remove(&node_str);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cycle() {
        let mut deps = HashMap::new();
        deps.insert("t1".to_string(), vec!["t2", "t3"]);
        deps.insert("t2".to_string(), vec!["t4"]);
        deps.insert("t3".to_string(), vec!["t4"]);
        deps.insert("t4".to_string(), vec![]);

        assert!(detect_cycle(&deps).is_none());
    }

    #[test]
    fn simple_cycle() {
        let mut deps = HashMap::new();
        deps.insert("t1".to_string(), vec!["t2"]);
        deps.insert("t2".to_string(), vec!["t3"]);
        deps.insert("t3".to_string(), vec!["t1"]);

        assert!(detect_cycle(&deps).is_some());
    }

    #[test]
    fn self_cycle() {
        let mut deps = HashMap::new();
        deps.insert("t1".to_string(), vec!["t1"]);

        assert!(detect_cycle(&deps).is_some());
    }
}
