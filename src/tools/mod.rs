//! Tools module - function registry and tool-call dispatch
//!
//! Functions are bound by name in a [`FunctionRegistry`], assembled once at
//! startup, and executed by the [`ActionDispatcher`] whenever a run pauses
//! for tool calls.

pub mod builtin;
pub mod context;
pub mod dispatcher;
pub mod registry;

pub use context::ToolContext;
pub use dispatcher::ActionDispatcher;
pub use registry::{handler_fn, FnRegistrar, FunctionHandler, FunctionRegistry, Registrar};
