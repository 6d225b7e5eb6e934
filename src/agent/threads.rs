//! Per-agent conversation threads
//!
//! Each agent owns at most one thread. Creation is serialized per agent so
//! two concurrent initializations never create two threads; different agents
//! never wait on each other. Reads go through a committed snapshot and do not
//! take the per-agent lock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::store::JsonStore;
use crate::core::{AgentThread, RelayError, Result, ThreadStatus};
use crate::llm::CompletionService;

type Slot = Arc<Mutex<Option<AgentThread>>>;

/// Registry of agent threads
pub struct ThreadRegistry {
    /// Per-agent write sections
    slots: DashMap<String, Slot>,
    /// Last committed state, for lock-free reads and persistence
    committed: DashMap<String, AgentThread>,
    /// Orders persist-then-commit across agents
    write_lock: Mutex<()>,
    store: JsonStore,
}

impl ThreadRegistry {
    /// Registry that keeps state in memory only
    pub fn in_memory() -> Self {
        Self {
            slots: DashMap::new(),
            committed: DashMap::new(),
            write_lock: Mutex::new(()),
            store: JsonStore::in_memory(),
        }
    }

    /// Open a registry backed by `store`, restoring saved threads.
    ///
    /// A thread saved as `active` belonged to a run of a previous process and
    /// comes back as `initialized`.
    pub async fn open(store: JsonStore) -> Result<Self> {
        let saved: Vec<AgentThread> = store.load().await?.unwrap_or_default();
        let registry = Self {
            slots: DashMap::new(),
            committed: DashMap::new(),
            write_lock: Mutex::new(()),
            store,
        };

        for mut thread in saved {
            if thread.status == ThreadStatus::Active {
                thread.status = ThreadStatus::Initialized;
            }
            registry
                .slots
                .insert(thread.agent_id.clone(), Arc::new(Mutex::new(Some(thread.clone()))));
            registry.committed.insert(thread.agent_id.clone(), thread);
        }

        debug!(threads = registry.committed.len(), "thread registry opened");
        Ok(registry)
    }

    fn slot(&self, agent_id: &str) -> Slot {
        self.slots
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Current thread of an agent, if any
    pub fn get(&self, agent_id: &str) -> Option<AgentThread> {
        self.committed.get(agent_id).map(|t| t.clone())
    }

    /// All known threads, ordered by agent id
    pub fn all(&self) -> Vec<AgentThread> {
        let mut threads: Vec<AgentThread> = self.committed.iter().map(|t| t.clone()).collect();
        threads.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        threads
    }

    /// Return the agent's thread, creating it on the service if missing.
    ///
    /// The flag is true when this call created the thread.
    pub async fn get_or_create(
        &self,
        agent_id: &str,
        service: &dyn CompletionService,
    ) -> Result<(AgentThread, bool)> {
        if agent_id.trim().is_empty() {
            return Err(RelayError::Other("agent id must not be empty".into()));
        }

        let slot = self.slot(agent_id);
        let mut guard = slot.lock().await;

        if let Some(thread) = guard.as_ref() {
            return Ok((thread.clone(), false));
        }

        let thread_id = service.create_thread().await?;
        let thread = AgentThread {
            agent_id: agent_id.to_string(),
            thread_id,
            status: ThreadStatus::Initialized,
        };
        self.commit(&thread).await?;
        *guard = Some(thread.clone());
        drop(guard);

        info!(agent_id = %agent_id, thread_id = %thread.thread_id, "thread created");
        Ok((thread, true))
    }

    /// Move an agent's thread to `status`
    pub async fn set_status(&self, agent_id: &str, status: ThreadStatus) -> Result<()> {
        let slot = self
            .slots
            .get(agent_id)
            .map(|s| s.clone())
            .ok_or_else(|| RelayError::UnknownAgent(agent_id.to_string()))?;

        let mut guard = slot.lock().await;
        let thread = guard
            .as_mut()
            .ok_or_else(|| RelayError::UnknownAgent(agent_id.to_string()))?;
        if thread.status == status {
            return Ok(());
        }

        debug!(agent_id = %agent_id, from = %thread.status, to = %status, "thread status");
        let updated = AgentThread {
            status,
            ..thread.clone()
        };
        self.commit(&updated).await?;
        *thread = updated;
        Ok(())
    }

    /// Persist the registry with `thread` applied, then publish it to readers.
    ///
    /// Nothing changes in memory when the write fails.
    async fn commit(&self, thread: &AgentThread) -> Result<()> {
        let _write = self.write_lock.lock().await;

        let mut snapshot: Vec<AgentThread> = self
            .all()
            .into_iter()
            .filter(|t| t.agent_id != thread.agent_id)
            .collect();
        snapshot.push(thread.clone());
        snapshot.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        self.store.save(&snapshot).await?;

        self.committed.insert(thread.agent_id.clone(), thread.clone());
        Ok(())
    }
}
