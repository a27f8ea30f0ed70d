//! Deliberation engine.
//!
//! Turns a decision problem into a structured multi-expert debate:
//!
//! - decomposition into a dependency DAG of sub-problems
//! - a clarification gate that pauses for critical missing information
//! - per-sub-problem debate rounds scored by a convergence judge and
//!   stopped by a fixed four-rule policy
//! - panel voting, per-sub-problem synthesis and one final meta-synthesis
//! - a checkpoint after every transition, so any session can be resumed
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use deliberation::{
//!     checkpoint::MemoryCheckpointStore, config::EngineConfig,
//!     inference::{OpenAiCompatibleProvider, SharedInference}, DeliberationEngine,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let provider: SharedInference = Arc::new(OpenAiCompatibleProvider::new(&config.inference)?);
//! let engine = DeliberationEngine::new(config, vec![provider], Arc::new(MemoryCheckpointStore::new()));
//! let id = engine.start("Should we migrate billing to Postgres?", "", vec![]).await?;
//! let state = engine.wait(&id).await?;
//! println!("{}", state.status_line());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod checkpoint;
pub mod config;
pub mod debate;
pub mod error;
pub mod events;
pub mod inference;
pub mod orchestrator;
pub mod planning;
pub mod prompts;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, FailureClass, FailureReason, ReasonCode};
pub use events::{EventBus, EventFilter, ProgressEvent};
pub use orchestrator::DeliberationEngine;
pub use state::{Criticality, FinalReport, Problem, SessionId, SessionState, SessionStatus};
