//! Planning: decomposition, clarification and dependency scheduling.

pub mod clarify;
pub mod dag;
pub mod decompose;
pub mod schedule;

pub use clarify::{ClarificationGate, GateOutcome};
pub use dag::{validate_decomposition, DagError, SubProblemGraph};
pub use decompose::{Decomposer, Decomposition, DecompositionError};
pub use schedule::{DependencyScheduler, Launch};
