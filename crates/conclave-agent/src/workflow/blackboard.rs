use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-run scratch map passed between workflow steps.
///
/// Seeded from the run input; a step with an `output_key` writes its text
/// here for later layers. Lookups accept dotted paths into nested objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunBlackboard {
    data: Map<String, Value>,
}

impl RunBlackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from run input. An object is used as-is; any other value lands
    /// under `input`.
    pub fn from_input(input: Option<Value>) -> Self {
        match input {
            Some(Value::Object(data)) => Self { data },
            Some(Value::Null) | None => Self::new(),
            Some(other) => {
                let mut board = Self::new();
                board.set("input", other);
                board
            }
        }
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Resolve `a.b.c`: the full key is tried first, then nested objects.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.data.get(path) {
            return Some(value);
        }
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }
}
