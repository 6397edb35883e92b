use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use conclave_core::traits::LogBuffer;

/// Bounded per-agent ring of output lines.
pub struct InMemoryLogBuffer {
    capacity: usize,
    lines: Mutex<HashMap<String, VecDeque<String>>>,
}

impl InMemoryLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(HashMap::new()),
        }
    }
}

impl LogBuffer for InMemoryLogBuffer {
    fn append(&self, agent_id: &str, line: String) {
        let mut map = match self.lines.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let buf = map.entry(agent_id.to_string()).or_default();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    fn lines(&self, agent_id: &str) -> Vec<String> {
        let map = match self.lines.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(agent_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn clear(&self, agent_id: &str) {
        let mut map = match self.lines.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(agent_id);
    }
}
