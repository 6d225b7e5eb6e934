//! Action dispatcher - executes the tool calls of a paused run
//!
//! Every request yields exactly one [`ToolCallResult`] at the same position
//! as its request, whatever the mode. Failures (unknown name, handler error,
//! panic, timeout) are captured per call and never abort the batch.

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::core::config::DispatchConfig;
use crate::core::{CallErrorKind, DispatchMode, ToolCallRequest, ToolCallResult};
use crate::tools::context::ToolContext;
use crate::tools::registry::FunctionRegistry;

/// Executes tool calls against a registry
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    registry: Arc<FunctionRegistry>,
    max_workers: usize,
    call_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<FunctionRegistry>, config: &DispatchConfig) -> Self {
        Self {
            registry,
            max_workers: config.max_workers.max(1),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Execute a batch; results follow request order
    pub async fn dispatch(
        &self,
        requests: &[ToolCallRequest],
        mode: DispatchMode,
        ctx: &ToolContext,
    ) -> Vec<ToolCallResult> {
        debug!(calls = requests.len(), ?mode, "dispatching tool calls");

        match mode {
            DispatchMode::Sequential => {
                let mut results = Vec::with_capacity(requests.len());
                for request in requests {
                    results.push(self.execute(request, ctx).await);
                }
                results
            }
            DispatchMode::Parallel => self.dispatch_parallel(requests, ctx).await,
        }
    }

    /// Spawn each call onto the runtime, at most `max_workers` running at once.
    ///
    /// The bound is per batch, not process-wide: concurrent batches each get
    /// `max_workers` permits, and a handler that starts another agent's run
    /// holds its permit while the nested batch acquires its own.
    async fn dispatch_parallel(
        &self,
        requests: &[ToolCallRequest],
        ctx: &ToolContext,
    ) -> Vec<ToolCallResult> {
        let workers = Arc::new(Semaphore::new(self.max_workers));

        let handles = requests.iter().cloned().map(|request| {
            let dispatcher = self.clone();
            let ctx = ctx.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                let _permit = workers.acquire_owned().await.ok();
                dispatcher.execute(&request, &ctx).await
            })
        });

        join_all(handles)
            .await
            .into_iter()
            .zip(requests)
            .map(|(joined, request)| match joined {
                Ok(result) => result,
                Err(e) => {
                    let kind = if e.is_panic() {
                        CallErrorKind::Panicked
                    } else {
                        CallErrorKind::Cancelled
                    };
                    ToolCallResult::failure(&request.call_id, &request.function_name, kind, e.to_string())
                }
            })
            .collect()
    }

    /// Run one call: pending -> running -> succeeded | failed | timed_out
    pub async fn execute(&self, request: &ToolCallRequest, ctx: &ToolContext) -> ToolCallResult {
        let handler = match self.registry.resolve(&request.function_name) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(call_id = %request.call_id, function = %request.function_name, "unknown function");
                return ToolCallResult::failure(
                    &request.call_id,
                    &request.function_name,
                    CallErrorKind::UnknownFunction,
                    e.to_string(),
                );
            }
        };

        debug!(call_id = %request.call_id, function = %request.function_name, "running");

        let call = AssertUnwindSafe(handler.call(ctx.clone(), request.arguments.clone())).catch_unwind();
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Err(_) => ToolCallResult::failure(
                &request.call_id,
                &request.function_name,
                CallErrorKind::TimedOut,
                format!("no result within {:?}", self.call_timeout),
            ),
            Ok(Err(panic)) => ToolCallResult::failure(
                &request.call_id,
                &request.function_name,
                CallErrorKind::Panicked,
                panic_message(panic.as_ref()),
            ),
            Ok(Ok(Err(e))) => ToolCallResult::failure(
                &request.call_id,
                &request.function_name,
                CallErrorKind::HandlerFailed,
                format!("{e:#}"),
            ),
            Ok(Ok(Ok(output))) => {
                ToolCallResult::success(&request.call_id, &request.function_name, output)
            }
        };

        debug!(call_id = %request.call_id, status = ?result.status, "call finished");
        result
    }

    /// Run a single function outside any run
    pub async fn execute_task(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolCallResult {
        let request = ToolCallRequest::new(format!("task_{}", name), name, args);
        self.execute(&request, ctx).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
