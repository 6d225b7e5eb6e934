//! Run lifecycle and multi-agent orchestration engine
//!
//! The [`Orchestrator`] owns the service client, the function registry, the
//! per-agent thread registry and the content relay. It starts runs, drives
//! them to completion while serving tool calls, and lets agents hand work to
//! each other.
//!
//! At most one run is in flight per thread. A second request for a busy
//! thread either fails with `ThreadBusy` before anything reaches the service
//! or waits its turn, depending on [`BusyPolicy`].

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use crate::agent::conversation;
use crate::agent::relay::ContentRelay;
use crate::agent::run::RunDriver;
use crate::agent::threads::ThreadRegistry;
use crate::core::config::BusyPolicy;
use crate::core::store::JsonStore;
use crate::core::{
    Config, ConversationOutcome, DispatchMode, Message, MessageOrder, RelayError, Result,
    RunOutcome, RunState, ThreadStatus, ToolCallRequest, ToolCallResult,
};
use crate::llm::{AssistantsClient, CompletionService, MessageQuery};
use crate::tools::{ActionDispatcher, FunctionRegistry, Registrar, ToolContext};

struct Inner {
    config: Config,
    service: Arc<dyn CompletionService>,
    dispatcher: ActionDispatcher,
    threads: ThreadRegistry,
    relay: ContentRelay,
    /// One lock per thread id; held for the whole life of a run
    run_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive hold on a thread's run slot.
///
/// Dropping it releases the slot and removes the map entry when nobody else
/// holds or waits on it.
struct RunLock {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    thread_id: String,
    inner: Arc<Inner>,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.guard.take();
        // Two references left: the map entry and ours
        self.inner
            .run_locks
            .remove_if(self.thread_id.as_str(), |_, lock| {
                Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
            });
    }
}

/// Multi-agent orchestration engine
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: Config,
    service: Option<Arc<dyn CompletionService>>,
    registrars: Vec<Arc<dyn Registrar>>,
    registry: Option<FunctionRegistry>,
}

impl OrchestratorBuilder {
    /// Use this service instead of an [`AssistantsClient`] built from config
    pub fn service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Make a registrar available to `functions.registrars`
    pub fn registrar(mut self, registrar: impl Registrar + 'static) -> Self {
        self.registrars.push(Arc::new(registrar));
        self
    }

    /// Use a ready-made registry and skip registrar loading
    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate config, assemble functions and restore persisted state
    pub async fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let service = match self.service {
            Some(service) => service,
            None => Arc::new(AssistantsClient::from_config(&self.config.service)?),
        };

        let registry = match self.registry {
            Some(registry) => registry,
            None => FunctionRegistry::assemble(&self.config.functions, &self.registrars)?,
        };
        let dispatcher = ActionDispatcher::new(Arc::new(registry), &self.config.dispatch);

        let threads =
            ThreadRegistry::open(JsonStore::from_option(self.config.storage.threads_path()))
                .await?;
        let relay =
            ContentRelay::open(JsonStore::from_option(self.config.storage.relay_path())).await?;

        info!(
            service = service.name(),
            functions = dispatcher.registry().len(),
            mode = ?self.config.dispatch.mode,
            "orchestrator ready"
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                service,
                dispatcher,
                threads,
                relay,
                run_locks: DashMap::new(),
            }),
        })
    }
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            service: None,
            registrars: Vec::new(),
            registry: None,
        }
    }

    /// Engine talking to the configured Assistants endpoint
    pub async fn from_config(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn service(&self) -> &Arc<dyn CompletionService> {
        &self.inner.service
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        self.inner.dispatcher.registry()
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.inner.threads
    }

    pub fn relay(&self) -> &ContentRelay {
        &self.inner.relay
    }

    /// The agent's thread id, creating the thread on first use
    pub async fn thread_initialization(&self, agent_id: &str) -> Result<String> {
        let (thread, _) = self
            .inner
            .threads
            .get_or_create(agent_id, self.inner.service.as_ref())
            .await?;
        Ok(thread.thread_id)
    }

    /// Thread id and status of an agent, without creating anything
    pub fn check_for_thread_and_status(
        &self,
        agent_id: &str,
    ) -> (Option<String>, Option<ThreadStatus>) {
        match self.inner.threads.get(agent_id) {
            Some(thread) => (Some(thread.thread_id), Some(thread.status)),
            None => (None, None),
        }
    }

    /// Ensure the agent has a thread and describe what happened
    pub async fn initialize_agent(&self, agent_id: &str) -> Result<String> {
        let (thread, created) = self
            .inner
            .threads
            .get_or_create(agent_id, self.inner.service.as_ref())
            .await?;
        Ok(if created {
            format!(
                "Agent {} initialized with new thread {}",
                agent_id, thread.thread_id
            )
        } else {
            format!(
                "Agent {} already initialized on thread {} ({})",
                agent_id, thread.thread_id, thread.status
            )
        })
    }

    /// Take the run lock of a thread according to the busy policy
    async fn acquire_run_lock(&self, thread_id: &str) -> Result<RunLock> {
        let lock = self
            .inner
            .run_locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let mut held = RunLock {
            guard: None,
            lock: lock.clone(),
            thread_id: thread_id.to_string(),
            inner: self.inner.clone(),
        };
        let busy = || RelayError::ThreadBusy {
            thread_id: thread_id.to_string(),
        };

        let guard = match self.inner.config.run.busy_policy {
            BusyPolicy::Reject => lock.try_lock_owned().map_err(|_| busy())?,
            BusyPolicy::Wait => {
                tokio::time::timeout(self.inner.config.run.run_timeout(), lock.lock_owned())
                    .await
                    .map_err(|_| busy())?
            }
        };
        held.guard = Some(guard);
        Ok(held)
    }

    /// Update the status only if `thread_id` is the agent's registered thread
    async fn mark_thread(&self, agent_id: &str, thread_id: &str, status: ThreadStatus) {
        let registered = self
            .inner
            .threads
            .get(agent_id)
            .is_some_and(|t| t.thread_id == thread_id);
        if !registered {
            return;
        }
        if let Err(e) = self.inner.threads.set_status(agent_id, status).await {
            warn!(agent_id = %agent_id, error = %e, "failed to record thread status");
        }
    }

    /// Append `message` (if any), start a run of `agent_id` and drive it to
    /// a terminal state, serving every tool-call round on the way.
    ///
    /// Remote failure, cancellation and expiry come back as an unsuccessful
    /// [`RunOutcome`]. Errors are reserved for a busy thread, a service that
    /// refuses to start the run, and polling that cannot continue.
    #[instrument(skip(self, message), fields(run_id = tracing::field::Empty))]
    pub async fn create_and_monitor_run(
        &self,
        agent_id: &str,
        thread_id: &str,
        message: Option<&str>,
    ) -> Result<RunOutcome> {
        let _run_lock = self.acquire_run_lock(thread_id).await?;
        let service = self.inner.service.as_ref();
        let run_config = &self.inner.config.run;

        if let Some(content) = message {
            service.append_message(thread_id, "user", content).await?;
        }
        let cursor = conversation::latest_message_id(service, thread_id).await?;

        let run = service.create_run(thread_id, agent_id).await?;
        tracing::Span::current().record("run_id", run.run_id.as_str());
        info!("run created");

        self.mark_thread(agent_id, thread_id, ThreadStatus::Active)
            .await;

        let ctx = ToolContext::for_run(&run, self.clone());
        let driven = RunDriver::new(
            service,
            &self.inner.dispatcher,
            run_config,
            self.inner.config.dispatch.mode,
        )
        .drive(&run, &ctx)
        .await;

        self.mark_thread(agent_id, thread_id, ThreadStatus::Initialized)
            .await;
        let report = driven?;

        let output_text = if report.final_state == RunState::Completed {
            let produced = conversation::messages_after(
                service,
                thread_id,
                cursor.as_deref(),
                run_config.message_page_size,
            )
            .await?;
            conversation::assistant_text(&produced)
        } else {
            String::new()
        };

        info!(
            state = %report.final_state,
            tool_rounds = report.tool_rounds,
            expired_locally = report.expired_locally,
            "run finished"
        );

        Ok(RunOutcome {
            run_id: run.run_id,
            thread_id: thread_id.to_string(),
            success: report.final_state == RunState::Completed,
            final_status: report.final_state,
            output_text,
            tool_rounds: report.tool_rounds,
            last_error: report.last_error,
        })
    }

    /// Send `content` to an agent on its own thread and wait for the answer
    pub async fn continue_conversation_with_assistant(
        &self,
        agent_id: &str,
        content: &str,
    ) -> ConversationOutcome {
        let thread_id = match self.thread_initialization(agent_id).await {
            Ok(thread_id) => thread_id,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "could not initialize agent thread");
                return ConversationOutcome::failed(format!(
                    "Could not initialize agent {}: {}",
                    agent_id, e
                ));
            }
        };

        match self
            .create_and_monitor_run(agent_id, &thread_id, Some(content))
            .await
        {
            Ok(outcome) if outcome.success => ConversationOutcome::succeeded(
                format!("Agent {} completed run {}", agent_id, outcome.run_id),
                outcome.output_text,
            ),
            Ok(outcome) => ConversationOutcome::failed(match outcome.last_error {
                Some(error) => format!(
                    "Run {} of agent {} ended {}: {}",
                    outcome.run_id, agent_id, outcome.final_status, error
                ),
                None => format!(
                    "Run {} of agent {} ended {}",
                    outcome.run_id, agent_id, outcome.final_status
                ),
            }),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "conversation failed");
                ConversationOutcome::failed(format!("Agent {} failed: {}", agent_id, e))
            }
        }
    }

    /// Run `agent_id` on `content`, then hand its answer to `next_agent_id`
    /// through the relay
    pub async fn assistant_transformer(
        &self,
        agent_id: &str,
        next_agent_id: &str,
        content: &str,
    ) -> ConversationOutcome {
        let outcome = self
            .continue_conversation_with_assistant(agent_id, content)
            .await;
        if !outcome.success {
            return outcome;
        }

        match self
            .inner
            .relay
            .save(agent_id, next_agent_id, &outcome.content)
            .await
        {
            Ok(()) => ConversationOutcome::succeeded(
                format!("{}; output relayed to {}", outcome.message, next_agent_id),
                outcome.content,
            ),
            Err(e) => ConversationOutcome::failed(format!(
                "Agent {} answered but relaying to {} failed: {}",
                agent_id, next_agent_id, e
            )),
        }
    }

    /// Store content for a downstream agent; false when it could not be saved
    pub async fn save_processed_content(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        content: &str,
    ) -> bool {
        match self
            .inner
            .relay
            .save(from_agent_id, to_agent_id, content)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(from = %from_agent_id, to = %to_agent_id, error = %e, "save failed");
                false
            }
        }
    }

    /// Content handed from one agent to another (or to anyone, with `multi`)
    pub fn load_processed_content(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        multi: bool,
    ) -> Vec<String> {
        self.inner.relay.load(from_agent_id, to_agent_id, multi)
    }

    /// Execute calls concurrently outside any run
    pub async fn parallel_tool_calls(&self, requests: &[ToolCallRequest]) -> Vec<ToolCallResult> {
        self.dispatch(requests, DispatchMode::Parallel).await
    }

    /// Execute calls in the given mode outside any run
    pub async fn dispatch(
        &self,
        requests: &[ToolCallRequest],
        mode: DispatchMode,
    ) -> Vec<ToolCallResult> {
        let ctx = ToolContext::new().with_orchestrator(self.clone());
        self.inner.dispatcher.dispatch(requests, mode, &ctx).await
    }

    /// Execute a single function outside any run
    pub async fn execute_task(&self, name: &str, args: Value) -> ToolCallResult {
        let ctx = ToolContext::new().with_orchestrator(self.clone());
        self.inner.dispatcher.execute_task(name, args, &ctx).await
    }

    /// One page of thread messages
    pub async fn retrieve_messages(
        &self,
        thread_id: &str,
        order: MessageOrder,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.inner
            .service
            .list_messages(thread_id, &MessageQuery::new(order, limit))
            .await
    }

    /// Every message after `after_id` (or all of them), oldest first
    pub async fn retrieve_messages_dynamically(
        &self,
        thread_id: &str,
        after_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        conversation::messages_after(
            self.inner.service.as_ref(),
            thread_id,
            after_id,
            self.inner.config.run.message_page_size,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptStep, ScriptedService};

    async fn orchestrator(service: Arc<ScriptedService>) -> Orchestrator {
        Orchestrator::builder(Config::default())
            .service(service)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_agent_messages() {
        let orch = orchestrator(Arc::new(ScriptedService::new())).await;

        let first = orch.initialize_agent("a1").await.unwrap();
        assert!(first.contains("new thread"));
        let second = orch.initialize_agent("a1").await.unwrap();
        assert!(second.contains("already initialized"));
    }

    #[tokio::test]
    async fn test_check_for_thread_and_status() {
        let orch = orchestrator(Arc::new(ScriptedService::new())).await;
        assert_eq!(orch.check_for_thread_and_status("a1"), (None, None));

        let thread_id = orch.thread_initialization("a1").await.unwrap();
        assert_eq!(
            orch.check_for_thread_and_status("a1"),
            (Some(thread_id), Some(ThreadStatus::Initialized))
        );
    }

    #[tokio::test]
    async fn test_failed_run_is_an_outcome() {
        let service = Arc::new(
            ScriptedService::new().with_script("a1", [ScriptStep::Fail("server_error".into())]),
        );
        let orch = orchestrator(service).await;
        let thread_id = orch.thread_initialization("a1").await.unwrap();

        let outcome = orch
            .create_and_monitor_run("a1", &thread_id, Some("hello"))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.final_status, RunState::Failed);
        assert_eq!(outcome.last_error.as_deref(), Some("server_error"));
        assert!(outcome.output_text.is_empty());

        let (_, status) = orch.check_for_thread_and_status("a1");
        assert_eq!(status, Some(ThreadStatus::Initialized));
    }

    #[tokio::test]
    async fn test_output_text_only_from_this_run() {
        let service = Arc::new(
            ScriptedService::new()
                .with_script("a1", [ScriptStep::Reply("first answer".into())])
                .with_script("a1", [ScriptStep::Reply("second answer".into())]),
        );
        let orch = orchestrator(service).await;
        let thread_id = orch.thread_initialization("a1").await.unwrap();

        let first = orch
            .create_and_monitor_run("a1", &thread_id, Some("one"))
            .await
            .unwrap();
        assert_eq!(first.output_text, "first answer");

        let second = orch
            .create_and_monitor_run("a1", &thread_id, None)
            .await
            .unwrap();
        assert_eq!(second.output_text, "second answer");
    }

    #[tokio::test]
    async fn test_run_lock_entry_removed_after_run() {
        let service = Arc::new(
            ScriptedService::new().with_script("a1", [ScriptStep::Reply("done".into())]),
        );
        let orch = orchestrator(service).await;
        let thread_id = orch.thread_initialization("a1").await.unwrap();

        orch.create_and_monitor_run("a1", &thread_id, Some("hi"))
            .await
            .unwrap();
        assert!(orch.inner.run_locks.is_empty());

        assert!(orch
            .create_and_monitor_run("a1", "thread_missing", Some("hi"))
            .await
            .is_err());
        assert!(orch.inner.run_locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_lock_entry_outlives_waiters() {
        let service = Arc::new(
            ScriptedService::new()
                .with_script(
                    "a1",
                    [
                        ScriptStep::Queued,
                        ScriptStep::InProgress,
                        ScriptStep::Reply("one".into()),
                    ],
                )
                .with_script("a1", [ScriptStep::Reply("two".into())]),
        );
        let mut config = Config::default();
        config.run.busy_policy = BusyPolicy::Wait;
        let orch = Orchestrator::builder(config)
            .service(service)
            .build()
            .await
            .unwrap();
        let thread_id = orch.thread_initialization("a1").await.unwrap();

        let first = orch.acquire_run_lock(&thread_id).await.unwrap();
        let waiter = {
            let orch = orch.clone();
            let thread_id = thread_id.clone();
            tokio::spawn(async move { orch.acquire_run_lock(&thread_id).await.map(|_| ()) })
        };
        // Holder (map, lock, guard) plus the waiter's two references
        while orch
            .inner
            .run_locks
            .get(&thread_id)
            .map_or(0, |lock| Arc::strong_count(lock.value()))
            < 5
        {
            tokio::task::yield_now().await;
        }

        drop(first);
        assert_eq!(orch.inner.run_locks.len(), 1);
        waiter.await.unwrap().unwrap();
        assert!(orch.inner.run_locks.is_empty());

        let (one, two) = tokio::join!(
            orch.create_and_monitor_run("a1", &thread_id, Some("first")),
            orch.create_and_monitor_run("a1", &thread_id, None),
        );
        assert_eq!(one.unwrap().output_text, "one");
        assert_eq!(two.unwrap().output_text, "two");
        assert!(orch.inner.run_locks.is_empty());
    }
}
