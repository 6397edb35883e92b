pub mod config;
pub mod error;
pub mod progress;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ConclaveError, Result};
pub use progress::{Progress, ProgressBus};
pub use traits::{AgentBackend, Delegation, HandleTable, IntentExtractor, LiveHandle, LogBuffer};
pub use types::*;
