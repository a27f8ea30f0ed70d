//! Dependency scheduler: which sub-problems may start now.
//!
//! Two modes, chosen by configuration:
//!
//! - `Sequential`: one sub-problem at a time, in topological order, once
//!   every prerequisite is complete.
//! - `Speculative`: every sub-problem whose prerequisites are complete, or
//!   still deliberating but past `early_start_round`, starts immediately.
//!   A dependent started this way is not rolled back if its prerequisite
//!   later changes course; it only sees the prerequisite's provisional state.
//!   It is failed with its prerequisite, though, and may not complete before
//!   every prerequisite has.

use crate::config::{SchedulerConfig, SchedulingMode};
use crate::planning::dag::{DagError, SubProblemGraph};
use crate::state::{SubProblem, SubProblemProgress, SubProblemStatus};

/// A sub-problem cleared to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub index: usize,
    /// Prerequisites that were not yet complete at launch.
    pub speculative_inputs: Vec<usize>,
}

impl Launch {
    pub fn is_speculative(&self) -> bool {
        !self.speculative_inputs.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DependencyScheduler {
    mode: SchedulingMode,
    early_start_round: u32,
    graph: SubProblemGraph,
}

impl DependencyScheduler {
    pub fn new(sub_problems: &[SubProblem], config: &SchedulerConfig) -> Result<Self, DagError> {
        Ok(Self {
            mode: config.mode,
            early_start_round: config.early_start_round.max(1),
            graph: SubProblemGraph::from_sub_problems(sub_problems)?,
        })
    }

    pub fn mode(&self) -> SchedulingMode {
        self.mode
    }

    /// Sub-problems that may start now. `running` holds indices already
    /// launched whose status may not have advanced yet.
    pub fn ready(
        &self,
        sub_problems: &[SubProblem],
        progress: &[SubProblemProgress],
        running: &[usize],
    ) -> Vec<Launch> {
        let unstarted = |i: usize| sub_problems[i].status.is_unstarted() && !running.contains(&i);

        match self.mode {
            SchedulingMode::Sequential => {
                let busy = !running.is_empty()
                    || sub_problems.iter().any(|s| s.status.is_active());
                if busy {
                    return Vec::new();
                }
                self.graph
                    .topological_order()
                    .iter()
                    .copied()
                    .find(|&i| {
                        unstarted(i)
                            && sub_problems[i]
                                .dependency_indices
                                .iter()
                                .all(|&d| sub_problems[d].status == SubProblemStatus::Complete)
                    })
                    .map(|index| {
                        vec![Launch {
                            index,
                            speculative_inputs: Vec::new(),
                        }]
                    })
                    .unwrap_or_default()
            }
            SchedulingMode::Speculative => self
                .graph
                .topological_order()
                .iter()
                .copied()
                .filter(|&i| unstarted(i))
                .filter_map(|i| {
                    let mut speculative_inputs = Vec::new();
                    for &d in &sub_problems[i].dependency_indices {
                        match sub_problems[d].status {
                            SubProblemStatus::Complete => {}
                            status
                                if status.is_active()
                                    && progress
                                        .get(d)
                                        .map(|p| p.rounds_completed >= self.early_start_round)
                                        .unwrap_or(false) =>
                            {
                                speculative_inputs.push(d)
                            }
                            _ => return None,
                        }
                    }
                    Some(Launch {
                        index: i,
                        speculative_inputs,
                    })
                })
                .collect(),
        }
    }

    /// Whether every direct prerequisite of `index` is complete.
    pub fn prerequisites_complete(&self, sub_problems: &[SubProblem], index: usize) -> bool {
        sub_problems.get(index).is_some_and(|s| {
            s.dependency_indices
                .iter()
                .all(|&d| sub_problems[d].status == SubProblemStatus::Complete)
        })
    }

    /// Unfinished sub-problems behind a failed prerequisite, directly or
    /// through another blocked sub-problem. Speculatively started ones are
    /// included. Returns `(blocked, failed_prerequisite)` pairs in
    /// topological order.
    pub fn blocked(&self, sub_problems: &[SubProblem]) -> Vec<(usize, usize)> {
        let mut failed: Vec<bool> = sub_problems
            .iter()
            .map(|s| s.status == SubProblemStatus::Failed)
            .collect();
        let mut out = Vec::new();
        for &i in self.graph.topological_order() {
            if sub_problems[i].status.is_terminal() {
                continue;
            }
            if let Some(&d) = sub_problems[i]
                .dependency_indices
                .iter()
                .find(|&&d| failed[d])
            {
                failed[i] = true;
                out.push((i, d));
            }
        }
        out
    }
}
