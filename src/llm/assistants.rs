//! Assistants API client implementation
//!
//! Async HTTP client for an OpenAI-Assistants-compatible REST API (threads,
//! messages, runs, tool output submission). Works against api.openai.com and
//! Azure OpenAI deployments.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::{ServiceConfig, ServiceProvider};
use crate::core::{
    Message, RelayError, Result, RunHandle, RunSnapshot, RunState, ToolCallRequest, ToolOutput,
};
use crate::llm::traits::{CompletionService, MessageQuery};

/// Assistants API client
#[derive(Clone)]
pub struct AssistantsClient {
    client: Client,
    base_url: String,
    api_key: String,
    provider: ServiceProvider,
    api_version: Option<String>,
}

/// Any object the API returns with just an id
#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SubmitToolOutputsRequest<'a> {
    tool_outputs: &'a [ToolOutput],
}

/// Run object as returned by the API
#[derive(Debug, Deserialize)]
struct RunObject {
    status: RunState,
    #[serde(default)]
    required_action: Option<RequiredAction>,
    #[serde(default)]
    last_error: Option<LastError>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    #[serde(default)]
    submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputs {
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct LastError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<TextBlock>,
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    value: String,
}

impl AssistantsClient {
    /// Create a new client from service configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| RelayError::config("No API key configured"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            provider: config.provider,
            api_version: config.api_version.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Attach authentication for the configured provider
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.provider {
            ServiceProvider::OpenAi => request
                .bearer_auth(&self.api_key)
                .header("OpenAI-Beta", "assistants=v2"),
            ServiceProvider::Azure => {
                let request = request.header("api-key", &self.api_key);
                match &self.api_version {
                    Some(version) => request.query(&[("api-version", version.as_str())]),
                    None => request,
                }
            }
        }
    }

    /// Send a request and decode the JSON body, classifying failures
    async fn send<T>(&self, request: RequestBuilder) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                RelayError::Transient(format!("Cannot reach {}: {}", self.base_url, e))
            } else {
                RelayError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                warn!(status = status.as_u16(), "retryable service response");
                return Err(RelayError::Transient(format!(
                    "Service returned {}: {}",
                    status, error_text
                )));
            }
            return Err(RelayError::service(status.as_u16(), error_text));
        }

        let body = response.text().await?;
        debug!(bytes = body.len(), "service response");
        serde_json::from_str(&body).map_err(RelayError::from)
    }

    fn to_request(call: WireToolCall) -> ToolCallRequest {
        let arguments = if call.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments))
        };
        ToolCallRequest::new(call.id, call.function.name, arguments)
    }

    fn to_snapshot(run: RunObject) -> RunSnapshot {
        let pending_tool_calls = match (run.status, run.required_action) {
            (RunState::RequiresAction, Some(action)) => action
                .submit_tool_outputs
                .map(|s| s.tool_calls.into_iter().map(Self::to_request).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let last_error = run.last_error.map(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => "unknown error".to_string(),
        });

        RunSnapshot {
            state: run.status,
            pending_tool_calls,
            last_error,
        }
    }

    fn to_message(message: MessageObject) -> Message {
        let content = message
            .content
            .into_iter()
            .filter_map(|block| block.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join(" ");

        Message {
            id: message.id,
            role: message.role,
            content,
        }
    }
}

#[async_trait]
impl CompletionService for AssistantsClient {
    async fn create_thread(&self) -> Result<String> {
        let thread: IdObject = self
            .send(
                self.client
                    .post(self.url("threads"))
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(thread.id)
    }

    async fn append_message(&self, thread_id: &str, role: &str, content: &str) -> Result<String> {
        let message: IdObject = self
            .send(
                self.client
                    .post(self.url(&format!("threads/{}/messages", thread_id)))
                    .json(&CreateMessageRequest { role, content }),
            )
            .await?;
        Ok(message.id)
    }

    async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<RunHandle> {
        let run: IdObject = self
            .send(
                self.client
                    .post(self.url(&format!("threads/{}/runs", thread_id)))
                    .json(&CreateRunRequest {
                        assistant_id: agent_id,
                    }),
            )
            .await?;

        Ok(RunHandle {
            run_id: run.id,
            thread_id: thread_id.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    async fn get_run(&self, run: &RunHandle) -> Result<RunSnapshot> {
        let object: RunObject = self
            .send(self.client.get(self.url(&format!(
                "threads/{}/runs/{}",
                run.thread_id, run.run_id
            ))))
            .await?;
        Ok(Self::to_snapshot(object))
    }

    async fn submit_tool_outputs(&self, run: &RunHandle, outputs: &[ToolOutput]) -> Result<()> {
        let _: IdObject = self
            .send(
                self.client
                    .post(self.url(&format!(
                        "threads/{}/runs/{}/submit_tool_outputs",
                        run.thread_id, run.run_id
                    )))
                    .json(&SubmitToolOutputsRequest {
                        tool_outputs: outputs,
                    }),
            )
            .await?;
        Ok(())
    }

    async fn cancel_run(&self, run: &RunHandle) -> Result<()> {
        let _: IdObject = self
            .send(self.client.post(self.url(&format!(
                "threads/{}/runs/{}/cancel",
                run.thread_id, run.run_id
            ))))
            .await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str, query: &MessageQuery) -> Result<Vec<Message>> {
        let mut params = vec![
            ("order", query.order.to_string()),
            ("limit", query.limit.to_string()),
        ];
        if let Some(after) = &query.after {
            params.push(("after", after.clone()));
        }

        let list: ListResponse<MessageObject> = self
            .send(
                self.client
                    .get(self.url(&format!("threads/{}/messages", thread_id)))
                    .query(&params),
            )
            .await?;

        Ok(list.data.into_iter().map(Self::to_message).collect())
    }

    fn name(&self) -> &str {
        "assistants"
    }
}
