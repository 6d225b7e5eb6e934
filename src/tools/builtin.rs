//! Built-in functions available to every agent
//!
//! Personal: `save_processed_content`, `load_processed_content`,
//! `initialize_agent`. Assistant-call: `communicate_with_assistant`,
//! `handoff_to_assistant`. All of them act through the orchestrator attached
//! to the call context.

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::core::{FunctionKind, Result};
use crate::tools::context::ToolContext;
use crate::tools::registry::{handler_fn, FunctionRegistry};

#[derive(Debug, Deserialize)]
struct SaveContentArgs {
    from_assistant_id: String,
    to_assistant_id: String,
    processed_content: String,
}

#[derive(Debug, Deserialize)]
struct LoadContentArgs {
    from_assistant_id: String,
    #[serde(default)]
    to_assistant_id: String,
    #[serde(default)]
    multiple_retrieval: bool,
}

#[derive(Debug, Deserialize)]
struct InitializeArgs {
    assistant_id: String,
}

#[derive(Debug, Deserialize)]
struct CommunicateArgs {
    assistant_id: String,
    user_content: String,
}

#[derive(Debug, Deserialize)]
struct HandoffArgs {
    assistant_id: String,
    next_assistant_id: String,
    user_content: String,
}

fn parse<T: DeserializeOwned>(function: &str, args: Value) -> anyhow::Result<T> {
    serde_json::from_value(args).with_context(|| format!("invalid arguments for {}", function))
}

/// Bind the built-in functions
pub fn register_builtins(registry: &mut FunctionRegistry) -> Result<()> {
    registry.register(
        "save_processed_content",
        handler_fn(save_processed_content),
        FunctionKind::Personal,
    )?;
    registry.register(
        "load_processed_content",
        handler_fn(load_processed_content),
        FunctionKind::Personal,
    )?;
    registry.register(
        "initialize_agent",
        handler_fn(initialize_agent),
        FunctionKind::Personal,
    )?;
    registry.register(
        "communicate_with_assistant",
        handler_fn(communicate_with_assistant),
        FunctionKind::AssistantCall,
    )?;
    registry.register(
        "handoff_to_assistant",
        handler_fn(handoff_to_assistant),
        FunctionKind::AssistantCall,
    )?;
    Ok(())
}

async fn save_processed_content(ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
    let args: SaveContentArgs = parse("save_processed_content", args)?;
    let saved = ctx
        .orchestrator()?
        .save_processed_content(
            &args.from_assistant_id,
            &args.to_assistant_id,
            &args.processed_content,
        )
        .await;
    Ok(json!({ "success": saved }))
}

async fn load_processed_content(ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
    let args: LoadContentArgs = parse("load_processed_content", args)?;
    let content = ctx.orchestrator()?.load_processed_content(
        &args.from_assistant_id,
        &args.to_assistant_id,
        args.multiple_retrieval,
    );
    Ok(json!(content))
}

async fn initialize_agent(ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
    let args: InitializeArgs = parse("initialize_agent", args)?;
    let message = ctx
        .orchestrator()?
        .initialize_agent(&args.assistant_id)
        .await?;
    Ok(Value::String(message))
}

async fn communicate_with_assistant(ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
    let args: CommunicateArgs = parse("communicate_with_assistant", args)?;
    let outcome = ctx
        .orchestrator()?
        .continue_conversation_with_assistant(&args.assistant_id, &args.user_content)
        .await;
    Ok(serde_json::to_value(outcome)?)
}

/// Run `assistant_id` on the content, then relay its answer to `next_assistant_id`
async fn handoff_to_assistant(ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
    let args: HandoffArgs = parse("handoff_to_assistant", args)?;
    let outcome = ctx
        .orchestrator()?
        .assistant_transformer(
            &args.assistant_id,
            &args.next_assistant_id,
            &args.user_content,
        )
        .await;
    Ok(serde_json::to_value(outcome)?)
}
