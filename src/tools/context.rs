//! Call context handed to every function handler
//!
//! Carries the run a call belongs to and, when the call was dispatched by an
//! engine, a handle back to that engine so assistant-call functions can start
//! other agents' conversations.

use crate::agent::Orchestrator;
use crate::core::RunHandle;

/// Context for one tool call
#[derive(Clone, Default)]
pub struct ToolContext {
    pub agent_id: Option<String>,
    pub thread_id: Option<String>,
    pub run_id: Option<String>,
    orchestrator: Option<Orchestrator>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("agent_id", &self.agent_id)
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("has_orchestrator", &self.orchestrator.is_some())
            .finish()
    }
}

impl ToolContext {
    /// Context with no run and no engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for calls requested by `run`
    pub fn for_run(run: &RunHandle, orchestrator: Orchestrator) -> Self {
        Self {
            agent_id: Some(run.agent_id.clone()),
            thread_id: Some(run.thread_id.clone()),
            run_id: Some(run.run_id.clone()),
            orchestrator: Some(orchestrator),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// The dispatching engine; built-ins that touch threads or the relay need it
    pub fn orchestrator(&self) -> anyhow::Result<&Orchestrator> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no orchestrator attached to this call"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_context() {
        let ctx = ToolContext::new();
        assert!(ctx.run_id.is_none());
        assert!(ctx.orchestrator().is_err());
        assert!(format!("{:?}", ctx).contains("has_orchestrator: false"));
    }
}
