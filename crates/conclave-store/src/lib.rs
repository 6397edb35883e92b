pub mod agents;
pub mod blackboard;
pub mod db;
pub mod events;
pub mod leases;
pub mod teams;
pub mod traces;
pub mod workflows;

use std::path::Path;
use std::sync::Arc;

use conclave_core::error::Result;

pub use agents::{AgentStore, PROCESS_LOST};
pub use blackboard::Blackboard;
pub use db::Database;
pub use events::EventBus;
pub use leases::{LeaseStore, EXECUTION_LEASE};
pub use teams::TeamStore;
pub use traces::{TraceOrigin, TraceStore};
pub use workflows::WorkflowStore;

/// Every store, sharing one database.
#[derive(Clone)]
pub struct Stores {
    pub agents: AgentStore,
    pub events: EventBus,
    pub blackboard: Blackboard,
    pub teams: TeamStore,
    pub workflows: WorkflowStore,
    pub traces: TraceStore,
    pub leases: LeaseStore,
}

impl Stores {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            agents: AgentStore::new(db.clone()),
            events: EventBus::new(db.clone()),
            blackboard: Blackboard::new(db.clone()),
            teams: TeamStore::new(db.clone()),
            workflows: WorkflowStore::new(db.clone()),
            traces: TraceStore::new(db.clone()),
            leases: LeaseStore::new(db),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open(path)?)))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::in_memory()?)))
    }
}
