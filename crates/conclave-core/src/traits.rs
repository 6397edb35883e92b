use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{BackendEvent, BackendRequest};

/// Execution backend: runs one agent turn and streams its events.
///
/// The returned stream should end with `BackendEvent::Done`; the launcher
/// tolerates streams that simply stop. Cancelling `cancel` must make the
/// backend release whatever it is driving (e.g. kill a child process).
pub trait AgentBackend: Send + Sync + 'static {
    /// Runtime name this backend is registered under.
    fn name(&self) -> &str;

    fn run(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<BackendEvent>>>>;
}

/// A task handed from one agent to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delegation {
    pub agent_id: String,
    pub task: String,
}

/// Pulls delegation intents out of free-form agent text.
///
/// Text that does not express a delegation yields nothing; it is never an error.
pub trait IntentExtractor: Send + Sync + 'static {
    fn extract(&self, text: &str) -> Vec<Delegation>;
}

/// A cancellation handle for one in-flight launch.
#[derive(Debug, Clone)]
pub struct LiveHandle {
    /// Unique per launch, so a finished launch never releases its successor's handle.
    pub launch_id: String,
    pub cancel: CancellationToken,
}

impl LiveHandle {
    pub fn new() -> Self {
        Self {
            launch_id: crate::types::new_id(),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for LiveHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Table of live backend handles keyed by agent id.
pub trait HandleTable: Send + Sync + 'static {
    /// Track a handle, returning the one it replaced.
    fn insert(&self, agent_id: &str, handle: LiveHandle) -> Option<LiveHandle>;

    fn get(&self, agent_id: &str) -> Option<LiveHandle>;

    fn remove(&self, agent_id: &str) -> Option<LiveHandle>;

    /// Remove the handle only if it still belongs to `launch_id`.
    fn release(&self, agent_id: &str, launch_id: &str) -> bool;
}

/// Per-agent captured output lines.
pub trait LogBuffer: Send + Sync + 'static {
    fn append(&self, agent_id: &str, line: String);

    /// Buffered lines, oldest first.
    fn lines(&self, agent_id: &str) -> Vec<String>;

    fn clear(&self, agent_id: &str);
}
