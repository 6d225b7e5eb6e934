//! Shared types used across agentrelay modules
//!
//! Contains thread and run records, tool-call requests and results, and the
//! outcome values returned to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message in a conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier assigned by the service
    pub id: String,
    /// Role of the message sender (user, assistant)
    pub role: String,
    /// Text content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

/// Listing order for thread messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrder {
    Asc,
    #[default]
    Desc,
}

impl std::fmt::Display for MessageOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageOrder::Asc => write!(f, "asc"),
            MessageOrder::Desc => write!(f, "desc"),
        }
    }
}

/// Coarse lifecycle status of an agent's thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    #[default]
    Uninitialized,
    /// Thread exists, no run in flight
    Initialized,
    /// A run is being driven on the thread
    Active,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadStatus::Uninitialized => write!(f, "uninitialized"),
            ThreadStatus::Initialized => write!(f, "initialized"),
            ThreadStatus::Active => write!(f, "active"),
        }
    }
}

/// A durable conversation scoped to one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThread {
    pub agent_id: String,
    pub thread_id: String,
    pub status: ThreadStatus,
}

/// Remote state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
}

impl RunState {
    /// Terminal states are final; the run will never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::Failed
                | RunState::Cancelled
                | RunState::Expired
                | RunState::Incomplete
        )
    }

    /// States that only need re-polling
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            RunState::Queued | RunState::InProgress | RunState::Cancelling
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::InProgress => "in_progress",
            RunState::RequiresAction => "requires_action",
            RunState::Cancelling => "cancelling",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::Expired => "expired",
            RunState::Incomplete => "incomplete",
        };
        write!(f, "{}", s)
    }
}

/// Identifies one run on one thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub thread_id: String,
    pub agent_id: String,
}

/// What a single poll of the service reports about a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub state: RunState,
    /// Non-empty only while `state` is `RequiresAction`
    pub pending_tool_calls: Vec<ToolCallRequest>,
    pub last_error: Option<String>,
}

impl RunSnapshot {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            pending_tool_calls: Vec::new(),
            last_error: None,
        }
    }

    pub fn requires_action(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            state: RunState::RequiresAction,
            pending_tool_calls: calls,
            last_error: None,
        }
    }
}

/// One function the service wants executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub function_name: String,
    /// JSON object of arguments
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(
        call_id: impl Into<String>,
        function_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            function_name: function_name.into(),
            arguments,
        }
    }

    /// Get a string argument by key
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.arguments
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Get a boolean argument by key
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.arguments.get(key).and_then(|v| v.as_bool())
    }
}

/// Final state of one dispatched call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Why a call did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    UnknownFunction,
    HandlerFailed,
    Panicked,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
}

/// Outcome of executing a [`ToolCallRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub function_name: String,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
}

impl ToolCallResult {
    /// Create a successful result
    pub fn success(
        call_id: impl Into<String>,
        function_name: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            function_name: function_name.into(),
            status: CallStatus::Succeeded,
            output: Some(output),
            error: None,
        }
    }

    /// Create a failed result
    pub fn failure(
        call_id: impl Into<String>,
        function_name: impl Into<String>,
        kind: CallErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let status = if kind == CallErrorKind::TimedOut {
            CallStatus::TimedOut
        } else {
            CallStatus::Failed
        };
        Self {
            call_id: call_id.into(),
            function_name: function_name.into(),
            status,
            output: None,
            error: Some(CallError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Succeeded
    }

    pub fn error_kind(&self) -> Option<CallErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Render the payload submitted back to the service.
    ///
    /// String outputs are sent verbatim, other values as JSON text, and
    /// errors as `{"error": {"kind": .., "message": ..}}`.
    pub fn to_tool_output(&self) -> ToolOutput {
        let output = match (&self.output, &self.error) {
            (Some(Value::String(s)), _) => s.clone(),
            (Some(value), _) => value.to_string(),
            (None, Some(error)) => serde_json::json!({ "error": error }).to_string(),
            (None, None) => String::new(),
        };
        ToolOutput {
            tool_call_id: self.call_id.clone(),
            output,
        }
    }
}

/// Wire form of a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// How a batch of tool calls is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Sequential,
    #[default]
    Parallel,
}

/// Result of driving one run to its end
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub thread_id: String,
    /// True only for `completed`
    pub success: bool,
    pub final_status: RunState,
    /// Assistant text produced by this run
    pub output_text: String,
    /// How many `requires_action` rounds were served
    pub tool_rounds: u32,
    pub last_error: Option<String>,
}

/// What a conversational caller gets back; never an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOutcome {
    pub success: bool,
    pub message: String,
    pub content: String,
}

impl ConversationOutcome {
    pub fn succeeded(message: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            content: content.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            content: String::new(),
        }
    }
}

/// Partition of function names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Local or external-API effects
    Personal,
    /// Invokes another agent's conversation
    AssistantCall,
}

impl FunctionKind {
    pub const ASSISTANT_SUFFIX: &'static str = "_assistant";

    /// The kind a name must have under the naming convention
    pub fn for_name(name: &str) -> Self {
        if name.ends_with(Self::ASSISTANT_SUFFIX) {
            FunctionKind::AssistantCall
        } else {
            FunctionKind::Personal
        }
    }
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionKind::Personal => write!(f, "personal"),
            FunctionKind::AssistantCall => write!(f, "assistant-call"),
        }
    }
}
