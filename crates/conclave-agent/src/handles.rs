use std::collections::HashMap;
use std::sync::Mutex;

use conclave_core::traits::{HandleTable, LiveHandle};

/// Live backend handles guarded by a mutex. One handle per agent id; a new
/// launch takes the slot without cancelling whatever was tracked before.
#[derive(Default)]
pub struct InMemoryHandles {
    handles: Mutex<HashMap<String, LiveHandle>>,
}

impl InMemoryHandles {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandleTable for InMemoryHandles {
    fn insert(&self, agent_id: &str, handle: LiveHandle) -> Option<LiveHandle> {
        match self.handles.lock() {
            Ok(mut map) => map.insert(agent_id.to_string(), handle),
            Err(poisoned) => poisoned.into_inner().insert(agent_id.to_string(), handle),
        }
    }

    fn get(&self, agent_id: &str) -> Option<LiveHandle> {
        match self.handles.lock() {
            Ok(map) => map.get(agent_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(agent_id).cloned(),
        }
    }

    fn remove(&self, agent_id: &str) -> Option<LiveHandle> {
        match self.handles.lock() {
            Ok(mut map) => map.remove(agent_id),
            Err(poisoned) => poisoned.into_inner().remove(agent_id),
        }
    }

    fn release(&self, agent_id: &str, launch_id: &str) -> bool {
        let mut map = match self.handles.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if map.get(agent_id).is_some_and(|h| h.launch_id == launch_id) {
            map.remove(agent_id);
            true
        } else {
            false
        }
    }
}
