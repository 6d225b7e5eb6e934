//! LLM module - completion service integrations
//!
//! Provides the service abstraction the run engine drives, with an
//! Assistants-API HTTP client and an in-memory scripted implementation.

pub mod assistants;
pub mod scripted;
pub mod traits;

pub use assistants::AssistantsClient;
pub use scripted::{ScriptStep, ScriptedService};
pub use traits::{CompletionService, MessageQuery};
