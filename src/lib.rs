//! agentrelay - run lifecycle and multi-agent orchestration
//!
//! Drives asynchronous "runs" of agents hosted on an Assistants-style
//! completion service: creates one thread per agent, polls runs to a terminal
//! state, executes the tool calls a run pauses for (sequentially or in
//! parallel) against a local function registry, and relays processed content
//! from one agent to another.
//!
//! # Architecture
//!
//! - **Core**: Shared types, configuration, error handling, persistence and logging
//! - **LLM**: Completion service abstraction with an HTTP client and a scripted in-memory service
//! - **Tools**: Function registry, registrars, built-ins and the action dispatcher
//! - **Agent**: Thread registry, content relay, run state machine and orchestrator
//!
//! # Usage
//!
//! ```rust,no_run
//! use agentrelay::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> agentrelay::Result<()> {
//!     let config = Config::load();
//!     agentrelay::core::logging::init(&config.logging);
//!
//!     let orchestrator = Orchestrator::from_config(config).await?;
//!     let outcome = orchestrator
//!         .continue_conversation_with_assistant("asst_123", "Summarize the report")
//!         .await;
//!     println!("{}: {}", outcome.message, outcome.content);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod core;
pub mod llm;
pub mod tools;

// Re-export commonly used items
pub use agent::{ContentRelay, Orchestrator, OrchestratorBuilder, ThreadRegistry};
pub use core::{Config, RelayError, Result};
pub use llm::{AssistantsClient, CompletionService, ScriptStep, ScriptedService};
pub use tools::{FunctionRegistry, Registrar, ToolContext};
