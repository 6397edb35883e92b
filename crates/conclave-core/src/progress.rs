use serde::Serialize;

use crate::traits::Delegation;
use crate::types::{AgentStatus, StreamEvent, WorkflowRun};

/// Incremental updates for live consumers (UIs, run logs).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Progress {
    AgentStatus {
        agent_id: String,
        status: AgentStatus,
    },
    AgentOutput {
        agent_id: String,
        run_id: Option<String>,
        step_id: Option<String>,
        event: StreamEvent,
    },
    /// A full snapshot after every persisted change to a run.
    RunUpdated { run: WorkflowRun },
    Delegated {
        team_id: String,
        from: String,
        delegation: Delegation,
    },
}

/// Progress side-channel over a tokio broadcast channel.
/// Publishing never blocks and never fails; slow subscribers lag.
pub struct ProgressBus {
    tx: tokio::sync::broadcast::Sender<Progress>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, progress: Progress) {
        // No receivers is fine
        let _ = self.tx.send(progress);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Progress> {
        self.tx.subscribe()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
