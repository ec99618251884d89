//! Install ordering
//!
//! Topological sort with cycle detection, inspired by pacman/libalpm.
//! Uses iterative DFS with state tracking to avoid stack overflow on deep graphs.

use crate::error::ResolveError;
use std::collections::BTreeMap;

/// Node state for DFS traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// Not yet visited
    Unprocessed,
    /// Currently being processed (on the stack)
    Processing,
    /// Fully processed (all dependencies resolved)
    Processed,
}

/// A dependency graph for topological sorting
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    /// Map from tool name to the tools it needs installed first
    edges: BTreeMap<String, Vec<String>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool and its dependencies to the graph
    pub fn add(&mut self, name: &str, deps: Vec<String>) {
        self.edges.insert(name.to_string(), deps);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Dependencies before dependents, starting from `targets`.
    pub fn topological_sort(&self, targets: &[String]) -> Result<Vec<String>, ResolveError> {
        let mut state: BTreeMap<&str, NodeState> = BTreeMap::new();
        let mut result: Vec<String> = Vec::new();

        for target in targets {
            self.dfs_visit(target, &mut state, &mut result)?;
        }

        Ok(result)
    }

    /// Iterative DFS with explicit stack to avoid recursion limits
    fn dfs_visit<'a>(
        &'a self,
        start: &'a str,
        state: &mut BTreeMap<&'a str, NodeState>,
        result: &mut Vec<String>,
    ) -> Result<(), ResolveError> {
        // Stack holds (node_name, index_of_next_child_to_visit)
        let mut stack: Vec<(&'a str, usize)> = vec![(start, 0)];

        while let Some((node, child_idx)) = stack.pop() {
            let deps: &'a [String] = self.edges.get(node).map(Vec::as_slice).unwrap_or(&[]);

            match state.get(node).copied().unwrap_or(NodeState::Unprocessed) {
                NodeState::Processed => continue,
                NodeState::Processing => {
                    if child_idx >= deps.len() {
                        state.insert(node, NodeState::Processed);
                        result.push(node.to_string());
                        continue;
                    }
                }
                NodeState::Unprocessed => {
                    state.insert(node, NodeState::Processing);
                }
            }

            let mut found_unprocessed = false;
            for (i, dep) in deps.iter().enumerate().skip(child_idx) {
                match state.get(dep.as_str()).copied().unwrap_or(NodeState::Unprocessed) {
                    NodeState::Unprocessed => {
                        stack.push((node, i + 1));
                        stack.push((dep.as_str(), 0));
                        found_unprocessed = true;
                        break;
                    }
                    NodeState::Processing => {
                        // The nodes still on the stack form the cycle.
                        let mut chain: Vec<String> = stack
                            .iter()
                            .map(|(n, _)| n.to_string())
                            .skip_while(|n| n != dep)
                            .collect();
                        chain.push(node.to_string());
                        chain.push(dep.clone());
                        return Err(ResolveError::CycleDetected { chain });
                    }
                    NodeState::Processed => {}
                }
            }

            if !found_unprocessed {
                stack.push((node, deps.len()));
            }
        }

        Ok(())
    }
}
