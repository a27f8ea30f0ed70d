//! Sub-problem dependency graph.
//!
//! Edges point from prerequisite to dependent. Validation rejects
//! out-of-range indices, self-references and cycles; a cycle is detected
//! with a topological sort attempt rather than assumed away.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::state::SubProblem;

/// Structural problems in a dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("no sub-problems")]
    Empty,

    #[error("{count} sub-problems exceeds the cap of {max}")]
    TooMany { count: usize, max: usize },

    #[error("sub-problem {index} depends on itself")]
    SelfReference { index: usize },

    #[error("sub-problem {index} depends on unknown sub-problem {dependency}")]
    OutOfRange { index: usize, dependency: usize },

    #[error("sub-problem {index} is stored at position {position}")]
    Misnumbered { index: usize, position: usize },

    #[error("dependency cycle through sub-problem {index}")]
    Cycle { index: usize },
}

/// Validated dependency graph over sub-problem indices.
#[derive(Debug, Clone)]
pub struct SubProblemGraph {
    nodes: Vec<NodeIndex>,
    order: Vec<usize>,
}

impl SubProblemGraph {
    /// Build and validate from dependency lists, where `deps[i]` holds the
    /// prerequisites of sub-problem `i`.
    pub fn from_dependencies(deps: &[Vec<usize>]) -> Result<Self, DagError> {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..deps.len()).map(|i| graph.add_node(i)).collect();

        for (index, prerequisites) in deps.iter().enumerate() {
            for &dependency in prerequisites {
                if dependency == index {
                    return Err(DagError::SelfReference { index });
                }
                if dependency >= deps.len() {
                    return Err(DagError::OutOfRange { index, dependency });
                }
                graph.update_edge(nodes[dependency], nodes[index], ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| DagError::Cycle {
                index: graph[cycle.node_id()],
            })?
            .into_iter()
            .map(|n| graph[n])
            .collect();

        Ok(Self {
            nodes,
            order,
        })
    }

    pub fn from_sub_problems(sub_problems: &[SubProblem]) -> Result<Self, DagError> {
        for (position, sp) in sub_problems.iter().enumerate() {
            if sp.index != position {
                return Err(DagError::Misnumbered {
                    index: sp.index,
                    position,
                });
            }
        }
        let deps: Vec<Vec<usize>> = sub_problems
            .iter()
            .map(|s| s.dependency_indices.clone())
            .collect();
        Self::from_dependencies(&deps)
    }

    /// A topological order of all sub-problem indices.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validate a decomposition against the sub-problem cap and DAG rules.
pub fn validate_decomposition(sub_problems: &[SubProblem], max: usize) -> Result<(), DagError> {
    if sub_problems.is_empty() {
        return Err(DagError::Empty);
    }
    if sub_problems.len() > max {
        return Err(DagError::TooMany {
            count: sub_problems.len(),
            max,
        });
    }
    SubProblemGraph::from_sub_problems(sub_problems).map(|_| ())
}
