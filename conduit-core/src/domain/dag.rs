//! Pure `needs` graph functions.
//!
//! Shared by definition validation (cycle detection) and by retries, which
//! reset skipped jobs in dependency order.

use std::collections::HashMap;

/// Order nodes so every node comes after the nodes it needs
///
/// `nodes` are `(name, needs)` pairs. Needs naming unknown nodes are ignored.
/// Returns indices into `nodes`, or `None` when the graph has a cycle. Ties
/// keep the input order.
///
/// # Example
///
/// ```
/// use conduit_core::domain::dag::topological_order;
///
/// let nodes = [("test", vec!["build"]), ("build", vec![])];
/// assert_eq!(topological_order(&nodes), Some(vec![1, 0]));
///
/// let cycle = [("a", vec!["b"]), ("b", vec!["a"])];
/// assert_eq!(topological_order(&cycle), None);
/// ```
pub fn topological_order<S: AsRef<str>>(nodes: &[(S, Vec<S>)]) -> Option<Vec<usize>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_ref(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (i, (_, needs)) in nodes.iter().enumerate() {
        for need in needs {
            if let Some(&dep) = index.get(need.as_ref()) {
                in_degree[i] += 1;
                dependents[dep].push(i);
            }
        }
    }

    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while !ready.is_empty() {
        ready.sort_unstable();
        let node = ready.remove(0);
        order.push(node);

        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() == nodes.len() {
        Some(order)
    } else {
        None
    }
}

/// Names that (transitively) need any of `roots`
pub fn descendants<S: AsRef<str>>(nodes: &[(S, Vec<S>)], roots: &[&str]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut frontier: Vec<String> = roots.iter().map(|r| r.to_string()).collect();

    while let Some(current) = frontier.pop() {
        for (name, needs) in nodes {
            let name = name.as_ref();
            if needs.iter().any(|n| n.as_ref() == current)
                && !found.iter().any(|f| f == name)
                && !roots.contains(&name)
            {
                found.push(name.to_string());
                frontier.push(name.to_string());
            }
        }
    }

    found
}
