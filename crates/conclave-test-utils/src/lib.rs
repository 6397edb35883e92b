//! Deterministic backends and fixtures for Conclave tests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::AgentBackend;
use conclave_core::types::{BackendEvent, BackendRequest, Usage};

/// What one backend invocation does.
#[derive(Debug, Clone, Default)]
pub struct Script {
    events: Vec<BackendEvent>,
    delay: Duration,
    hang: bool,
    fail: Option<String>,
}

impl Script {
    /// Emit the given events, then end.
    pub fn events(events: Vec<BackendEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// One text chunk followed by `Done`.
    pub fn reply(text: impl Into<String>) -> Self {
        Self::events(vec![
            BackendEvent::Text(text.into()),
            BackendEvent::Done {
                usage: Some(Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                    cost_usd: None,
                }),
            },
        ])
    }

    /// Issue a session id, reply with text, finish.
    pub fn session_reply(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut script = Self::reply(text);
        script.events.insert(
            0,
            BackendEvent::SessionStarted {
                session_id: session_id.into(),
            },
        );
        script
    }

    /// Never emit anything and never finish until cancelled.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// The backend refuses to start.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }

    /// Keep the stream open after the scripted events.
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Sleep before every event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Playback {
    events: VecDeque<BackendEvent>,
    delay: Duration,
    hang: bool,
    cancel: CancellationToken,
}

/// Backend replaying scripted event sequences, one script per call.
///
/// Scripts queued for an agent id are used first, in order; otherwise the
/// default script runs.
pub struct ScriptedBackend {
    name: String,
    queued: Mutex<HashMap<String, VecDeque<Script>>>,
    default: Mutex<Script>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queued: Mutex::new(HashMap::new()),
            default: Mutex::new(Script::reply("ok")),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn with_default(self, script: Script) -> Self {
        *self.default.lock().unwrap() = script;
        self
    }

    /// Queue a script for the next call made for `agent_id`.
    pub fn push(&self, agent_id: &str, script: Script) {
        self.queued
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, agent_id: &str) -> Vec<BackendRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.agent_id == agent_id)
            .collect()
    }

    fn next_script(&self, agent_id: &str) -> Script {
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(agent_id)
            .and_then(|q| q.pop_front());
        queued.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<BackendEvent>>>> {
        Box::pin(async move {
            let script = self.next_script(&request.agent_id);
            self.requests.lock().unwrap().push(request);
            if let Some(message) = script.fail {
                return Err(ConclaveError::Backend(message));
            }
            let playback = Playback {
                events: script.events.into(),
                delay: script.delay,
                hang: script.hang,
                cancel,
            };
            let stream = stream::unfold(playback, |mut p| async move {
                if !p.delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(p.delay) => {}
                        _ = p.cancel.cancelled() => return None,
                    }
                }
                if let Some(event) = p.events.pop_front() {
                    return Some((Ok(event), p));
                }
                if p.hang {
                    p.cancel.cancelled().await;
                }
                None
            });
            Ok(stream.boxed())
        })
    }
}

/// Write TOML to a temp file usable as `--config`.
pub fn config_file(toml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", toml).unwrap();
    file.flush().unwrap();
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::types::AgentConfig;

    fn request(agent_id: &str) -> BackendRequest {
        BackendRequest {
            agent_id: agent_id.into(),
            prompt: "hi".into(),
            resume_session: None,
            config: AgentConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_queued_then_default() {
        let backend = ScriptedBackend::new("scripted");
        backend.push("a", Script::reply("first"));

        let events: Vec<_> = backend
            .run(request("a"), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events[0].as_ref().unwrap(), &BackendEvent::Text("first".into()));

        let events: Vec<_> = backend
            .run(request("a"), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events[0].as_ref().unwrap(), &BackendEvent::Text("ok".into()));
        assert_eq!(backend.requests_for("a").len(), 2);
    }

    #[tokio::test]
    async fn test_hang_ends_on_cancel() {
        let backend = ScriptedBackend::new("scripted").with_default(Script::hang());
        let cancel = CancellationToken::new();
        let mut stream = backend.run(request("a"), cancel.clone()).await.unwrap();
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fail() {
        let backend = ScriptedBackend::new("scripted").with_default(Script::fail("nope"));
        assert!(backend.run(request("a"), CancellationToken::new()).await.is_err());
    }
}
