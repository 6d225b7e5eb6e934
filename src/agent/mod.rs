//! Agent module - run lifecycle and multi-agent orchestration
//!
//! Threads per agent, the cross-agent content relay, the run state machine
//! and the orchestrator that drives runs end to end.

pub mod conversation;
pub mod orchestrator;
pub mod relay;
pub mod run;
pub mod threads;

pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use relay::{ContentRecord, ContentRelay};
pub use run::{Directive, Observation, RunDriver, RunMachine, RunReport};
pub use threads::ThreadRegistry;
