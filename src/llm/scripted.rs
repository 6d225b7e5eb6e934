//! In-memory scripted completion service
//!
//! Plays back a per-agent script of run states instead of calling a model.
//! Each `create_run` for an agent takes that agent's next queued script; each
//! `get_run` advances it by one step. Used by the test suites and handy for
//! wiring up an engine offline.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::core::{
    Message, MessageOrder, RelayError, Result, RunHandle, RunSnapshot, RunState, ToolCallRequest,
    ToolOutput,
};
use crate::llm::traits::{CompletionService, MessageQuery};

/// One step of a scripted run, consumed by a single poll
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Queued,
    InProgress,
    /// Pause until outputs for exactly these calls are submitted
    RequiresAction(Vec<ToolCallRequest>),
    /// Post an assistant message and complete
    Reply(String),
    /// Complete, replying with the most recent submitted outputs joined by newlines
    ReplyWithOutputs,
    Fail(String),
    Cancelled,
    Expired,
    /// The poll itself fails with a retryable error
    TransientError,
    /// The poll itself fails with a permanent error
    ServiceError(u16),
    /// The poll never answers
    Hang,
}

struct RunRecord {
    handle: RunHandle,
    script: VecDeque<ScriptStep>,
    state: RunState,
    pending: Vec<ToolCallRequest>,
    submissions: Vec<Vec<ToolOutput>>,
    last_error: Option<String>,
    cancel_requested: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    threads: HashMap<String, Vec<Message>>,
    scripts: HashMap<String, VecDeque<Vec<ScriptStep>>>,
    runs: HashMap<String, RunRecord>,
    run_order: Vec<String>,
    polls: usize,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    fn post_message(&mut self, thread_id: &str, role: &str, content: String) -> Result<String> {
        let id = self.next_id("msg");
        let thread = self
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| RelayError::service(404, format!("No thread {}", thread_id)))?;
        thread.push(Message {
            id: id.clone(),
            role: role.to_string(),
            content,
        });
        Ok(id)
    }
}

enum PollAction {
    Report(RunSnapshot),
    Fail(RelayError),
    Hang,
}

/// Scriptable in-memory service
#[derive(Default)]
pub struct ScriptedService {
    inner: Mutex<Inner>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next run of `agent_id`
    pub fn script(&self, agent_id: &str, steps: impl IntoIterator<Item = ScriptStep>) {
        self.lock()
            .scripts
            .entry(agent_id.to_string())
            .or_default()
            .push_back(steps.into_iter().collect());
    }

    /// Builder form of [`script`](Self::script)
    pub fn with_script(self, agent_id: &str, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.script(agent_id, steps);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not poison every later assertion
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn threads_created(&self) -> usize {
        self.lock().threads.len()
    }

    pub fn runs_created(&self) -> usize {
        self.lock().run_order.len()
    }

    /// Run handles in creation order
    pub fn runs(&self) -> Vec<RunHandle> {
        let inner = self.lock();
        inner
            .run_order
            .iter()
            .filter_map(|id| inner.runs.get(id).map(|r| r.handle.clone()))
            .collect()
    }

    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        self.lock().runs.get(run_id).map(|r| r.state)
    }

    /// Every batch of outputs submitted for a run, in order
    pub fn submissions(&self, run_id: &str) -> Vec<Vec<ToolOutput>> {
        self.lock()
            .runs
            .get(run_id)
            .map(|r| r.submissions.clone())
            .unwrap_or_default()
    }

    pub fn cancel_requested(&self, run_id: &str) -> bool {
        self.lock()
            .runs
            .get(run_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    /// All messages of a thread, oldest first
    pub fn messages(&self, thread_id: &str) -> Vec<Message> {
        self.lock()
            .threads
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total `get_run` calls served
    pub fn polls(&self) -> usize {
        self.lock().polls
    }

    fn advance(inner: &mut Inner, run_id: &str) -> PollAction {
        inner.polls += 1;

        let Some(run) = inner.runs.get_mut(run_id) else {
            return PollAction::Fail(RelayError::service(404, format!("No run {}", run_id)));
        };

        if run.state.is_terminal() || run.state == RunState::RequiresAction {
            return PollAction::Report(Self::snapshot(run));
        }

        let Some(step) = run.script.pop_front() else {
            return PollAction::Report(Self::snapshot(run));
        };

        let reply = match step {
            ScriptStep::Queued => {
                run.state = RunState::Queued;
                None
            }
            ScriptStep::InProgress => {
                run.state = RunState::InProgress;
                None
            }
            ScriptStep::RequiresAction(calls) => {
                run.state = RunState::RequiresAction;
                run.pending = calls;
                None
            }
            ScriptStep::Reply(text) => Some(text),
            ScriptStep::ReplyWithOutputs => Some(
                run.submissions
                    .last()
                    .map(|batch| {
                        batch
                            .iter()
                            .map(|o| o.output.as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default(),
            ),
            ScriptStep::Fail(message) => {
                run.state = RunState::Failed;
                run.last_error = Some(message);
                None
            }
            ScriptStep::Cancelled => {
                run.state = RunState::Cancelled;
                None
            }
            ScriptStep::Expired => {
                run.state = RunState::Expired;
                None
            }
            ScriptStep::TransientError => {
                return PollAction::Fail(RelayError::Transient("scripted blip".into()));
            }
            ScriptStep::ServiceError(status) => {
                return PollAction::Fail(RelayError::service(status, "scripted failure"));
            }
            ScriptStep::Hang => return PollAction::Hang,
        };

        if let Some(text) = reply {
            run.state = RunState::Completed;
            let thread_id = run.handle.thread_id.clone();
            let snapshot = Self::snapshot(run);
            if let Err(e) = inner.post_message(&thread_id, "assistant", text) {
                return PollAction::Fail(e);
            }
            return PollAction::Report(snapshot);
        }

        PollAction::Report(Self::snapshot(run))
    }

    fn snapshot(run: &RunRecord) -> RunSnapshot {
        RunSnapshot {
            state: run.state,
            pending_tool_calls: if run.state == RunState::RequiresAction {
                run.pending.clone()
            } else {
                Vec::new()
            },
            last_error: run.last_error.clone(),
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedService {
    async fn create_thread(&self) -> Result<String> {
        let mut inner = self.lock();
        let id = inner.next_id("thread");
        inner.threads.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn append_message(&self, thread_id: &str, role: &str, content: &str) -> Result<String> {
        let mut inner = self.lock();
        let busy = inner
            .runs
            .values()
            .any(|r| r.handle.thread_id == thread_id && !r.state.is_terminal());
        if busy {
            return Err(RelayError::service(
                400,
                format!("Thread {} has an active run", thread_id),
            ));
        }
        inner.post_message(thread_id, role, content.to_string())
    }

    async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<RunHandle> {
        let mut inner = self.lock();
        if !inner.threads.contains_key(thread_id) {
            return Err(RelayError::service(404, format!("No thread {}", thread_id)));
        }
        let busy = inner
            .runs
            .values()
            .any(|r| r.handle.thread_id == thread_id && !r.state.is_terminal());
        if busy {
            return Err(RelayError::service(
                400,
                format!("Thread {} already has an active run", thread_id),
            ));
        }

        let script = inner
            .scripts
            .get_mut(agent_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| vec![ScriptStep::Reply(String::new())]);

        let run_id = inner.next_id("run");
        let handle = RunHandle {
            run_id: run_id.clone(),
            thread_id: thread_id.to_string(),
            agent_id: agent_id.to_string(),
        };
        inner.runs.insert(
            run_id.clone(),
            RunRecord {
                handle: handle.clone(),
                script: script.into(),
                state: RunState::Queued,
                pending: Vec::new(),
                submissions: Vec::new(),
                last_error: None,
                cancel_requested: false,
            },
        );
        inner.run_order.push(run_id);
        Ok(handle)
    }

    async fn get_run(&self, run: &RunHandle) -> Result<RunSnapshot> {
        let action = {
            let mut inner = self.lock();
            Self::advance(&mut inner, &run.run_id)
        };

        match action {
            PollAction::Report(snapshot) => Ok(snapshot),
            PollAction::Fail(e) => Err(e),
            PollAction::Hang => std::future::pending().await,
        }
    }

    async fn submit_tool_outputs(&self, run: &RunHandle, outputs: &[ToolOutput]) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| RelayError::service(404, format!("No run {}", run.run_id)))?;

        if record.state != RunState::RequiresAction {
            return Err(RelayError::service(
                400,
                format!("Run {} is {}, not requires_action", run.run_id, record.state),
            ));
        }

        let expected: Vec<&str> = record.pending.iter().map(|c| c.call_id.as_str()).collect();
        let received: Vec<&str> = outputs.iter().map(|o| o.tool_call_id.as_str()).collect();
        if expected != received {
            return Err(RelayError::service(
                400,
                format!(
                    "Tool outputs {:?} do not match pending calls {:?}",
                    received, expected
                ),
            ));
        }

        record.submissions.push(outputs.to_vec());
        record.pending.clear();
        record.state = RunState::InProgress;
        Ok(())
    }

    async fn cancel_run(&self, run: &RunHandle) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| RelayError::service(404, format!("No run {}", run.run_id)))?;
        record.cancel_requested = true;
        if !record.state.is_terminal() {
            record.state = RunState::Cancelled;
        }
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str, query: &MessageQuery) -> Result<Vec<Message>> {
        let inner = self.lock();
        let thread = inner
            .threads
            .get(thread_id)
            .ok_or_else(|| RelayError::service(404, format!("No thread {}", thread_id)))?;

        let ordered: Vec<&Message> = match query.order {
            MessageOrder::Asc => thread.iter().collect(),
            MessageOrder::Desc => thread.iter().rev().collect(),
        };

        let start = match &query.after {
            Some(after) => ordered
                .iter()
                .position(|m| &m.id == after)
                .map(|i| i + 1)
                .unwrap_or(ordered.len()),
            None => 0,
        };

        Ok(ordered
            .into_iter()
            .skip(start)
            .take(query.limit)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
