//! Completion service trait for abstracting different backends
//!
//! The engine only needs the thread/run/message contract below; the hosted
//! API, an Azure deployment and the in-memory scripted service all fit it.

use async_trait::async_trait;

use crate::core::{Message, MessageOrder, Result, RunHandle, RunSnapshot, ToolOutput};

/// Query for [`CompletionService::list_messages`]
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub order: MessageOrder,
    pub limit: usize,
    /// Cursor: only messages after this id in `order`
    pub after: Option<String>,
}

impl MessageQuery {
    pub fn new(order: MessageOrder, limit: usize) -> Self {
        Self {
            order,
            limit,
            after: None,
        }
    }

    pub fn after(mut self, message_id: impl Into<String>) -> Self {
        self.after = Some(message_id.into());
        self
    }
}

/// Trait for assistant-style completion services
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Create an empty conversation thread
    async fn create_thread(&self) -> Result<String>;

    /// Append a message to a thread, returning its id
    async fn append_message(&self, thread_id: &str, role: &str, content: &str) -> Result<String>;

    /// Start a run of `agent_id` against a thread
    async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<RunHandle>;

    /// Read the current state of a run
    async fn get_run(&self, run: &RunHandle) -> Result<RunSnapshot>;

    /// Resume a run paused in `requires_action`; `outputs` follow request order
    async fn submit_tool_outputs(&self, run: &RunHandle, outputs: &[ToolOutput]) -> Result<()>;

    /// Ask the service to stop a run
    async fn cancel_run(&self, run: &RunHandle) -> Result<()>;

    /// Page through thread messages
    async fn list_messages(&self, thread_id: &str, query: &MessageQuery) -> Result<Vec<Message>>;

    /// Get the service name
    fn name(&self) -> &str;
}
