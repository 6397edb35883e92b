use std::process::Stdio;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conclave_core::config::{OutputFormat, PromptVia, RuntimeConfig};
use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::AgentBackend;
use conclave_core::types::{BackendEvent, BackendRequest};

use super::stream_json;

const STDERR_TAIL_CHARS: usize = 500;

/// Drives an external agent CLI as a child process, one process per turn.
pub struct CommandBackend {
    name: String,
    runtime: RuntimeConfig,
}

impl CommandBackend {
    pub fn new(name: impl Into<String>, runtime: RuntimeConfig) -> Self {
        Self {
            name: name.into(),
            runtime,
        }
    }

    /// Full argument list for a request, prompt excluded unless passed as an arg.
    pub fn build_args(&self, request: &BackendRequest) -> Vec<String> {
        let rt = &self.runtime;
        let mut args: Vec<String> = rt
            .args
            .iter()
            .map(|a| a.replace("{agent_id}", &request.agent_id))
            .collect();

        if let Some(session) = &request.resume_session {
            args.extend(
                rt.resume_args
                    .iter()
                    .map(|a| a.replace("{session_id}", session)),
            );
        }

        let cfg = &request.config;
        let settings = [
            (&rt.flags.model, cfg.model.clone()),
            (&rt.flags.system_prompt, cfg.system_prompt.clone()),
            (&rt.flags.max_turns, cfg.max_turns.map(|n| n.to_string())),
            (&rt.flags.permission_mode, cfg.permission_mode.clone()),
        ];
        for (flag, value) in settings {
            if let (Some(flag), Some(value)) = (flag, value) {
                args.push(flag.clone());
                args.push(value);
            }
        }

        if rt.prompt_via == PromptVia::Arg {
            args.push(request.prompt.clone());
        }
        args
    }

    fn command(&self, request: &BackendRequest) -> Command {
        let mut cmd = Command::new(&self.runtime.command);
        cmd.args(self.build_args(request))
            .envs(&self.runtime.env)
            .env("CONCLAVE_AGENT_ID", &request.agent_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cfg = &request.config;
        if let Some(model) = &cfg.model {
            cmd.env("CONCLAVE_MODEL", model);
        }
        if let Some(prompt) = &cfg.system_prompt {
            cmd.env("CONCLAVE_SYSTEM_PROMPT", prompt);
        }
        if let Some(turns) = cfg.max_turns {
            cmd.env("CONCLAVE_MAX_TURNS", turns.to_string());
        }
        if let Some(mode) = &cfg.permission_mode {
            cmd.env("CONCLAVE_PERMISSION_MODE", mode);
        }
        if let Some(dir) = &cfg.working_dir {
            cmd.current_dir(dir);
        }
        match self.runtime.prompt_via {
            PromptVia::Stdin => cmd.stdin(Stdio::piped()),
            PromptVia::Arg => cmd.stdin(Stdio::null()),
        };
        cmd
    }
}

fn parse(format: OutputFormat, line: &str) -> Vec<BackendEvent> {
    match format {
        OutputFormat::StreamJson => stream_json::parse_line(line),
        OutputFormat::Text if line.trim().is_empty() => vec![],
        OutputFormat::Text => vec![BackendEvent::Text(format!("{}\n", line))],
    }
}

impl AgentBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<BackendEvent>>>> {
        Box::pin(async move {
            let mut child = self.command(&request).spawn().map_err(|e| {
                ConclaveError::Backend(format!(
                    "failed to spawn '{}': {}",
                    self.runtime.command, e
                ))
            })?;
            debug!(
                agent_id = %request.agent_id,
                runtime = %self.name,
                pid = ?child.id(),
                "Backend process started"
            );

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(request.prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| ConclaveError::Backend("child stdout not captured".into()))?;
            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut buf = String::new();
                    let _ = stderr.read_to_string(&mut buf).await;
                    buf
                })
            });

            let format = self.runtime.format;
            let command = self.runtime.command.clone();
            let (tx, rx) = mpsc::channel::<Result<BackendEvent>>(64);

            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut saw_done = false;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = child.kill().await;
                            debug!(command = %command, "Backend process killed");
                            return;
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                for event in parse(format, &line) {
                                    saw_done |= matches!(event, BackendEvent::Done { .. });
                                    if tx.send(Ok(event)).await.is_err() {
                                        let _ = child.kill().await;
                                        return;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = tx.send(Err(e.into())).await;
                                break;
                            }
                        }
                    }
                }

                let status = child.wait().await;
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                match status {
                    Ok(status) if !status.success() => {
                        let tail: String = stderr
                            .trim()
                            .chars()
                            .rev()
                            .take(STDERR_TAIL_CHARS)
                            .collect::<Vec<_>>()
                            .into_iter()
                            .rev()
                            .collect();
                        warn!(command = %command, %status, "Backend process exited with failure");
                        let message = if tail.is_empty() {
                            format!("{} exited with {}", command, status)
                        } else {
                            format!("{} exited with {}: {}", command, status, tail)
                        };
                        let _ = tx.send(Ok(BackendEvent::Error(message))).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                    }
                    Ok(_) => {}
                }
                if !saw_done {
                    let _ = tx.send(Ok(BackendEvent::Done { usage: None })).await;
                }
            });

            let events = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(events.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::config::RuntimeFlags;
    use conclave_core::types::AgentConfig;
    use std::collections::HashMap;

    fn runtime(command: &str, args: &[&str], format: OutputFormat) -> RuntimeConfig {
        RuntimeConfig {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            resume_args: vec!["--resume".into(), "{session_id}".into()],
            format,
            prompt_via: PromptVia::Arg,
            flags: RuntimeFlags {
                model: Some("--model".into()),
                ..Default::default()
            },
            env: HashMap::new(),
        }
    }

    fn request(prompt: &str, resume: Option<&str>) -> BackendRequest {
        BackendRequest {
            agent_id: "a1".into(),
            prompt: prompt.into(),
            resume_session: resume.map(str::to_string),
            config: AgentConfig {
                model: Some("big".into()),
                system_prompt: Some("be brief".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_build_args() {
        let backend = CommandBackend::new("x", runtime("agent", &["-p", "--id={agent_id}"], OutputFormat::Text));
        let args = backend.build_args(&request("do it", Some("s9")));
        assert_eq!(
            args,
            vec!["-p", "--id=a1", "--resume", "s9", "--model", "big", "do it"]
        );

        let fresh = backend.build_args(&request("do it", None));
        assert!(!fresh.contains(&"--resume".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_text_process_output() {
        let backend = CommandBackend::new("echo", runtime("echo", &[], OutputFormat::Text));
        let events: Vec<_> = backend
            .run(request("hello world", None), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        let events: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();
        assert!(events.contains(&BackendEvent::Text("--model big hello world\n".into())));
        assert!(matches!(events.last(), Some(BackendEvent::Done { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_process_reports_error() {
        let backend = CommandBackend::new("false", runtime("false", &[], OutputFormat::Text));
        let events: Vec<_> = backend
            .run(request("x", None), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(events
            .iter()
            .any(|e| matches!(e, Ok(BackendEvent::Error(m)) if m.contains("exited"))));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let backend = CommandBackend::new(
            "ghost",
            runtime("/nonexistent/conclave-agent-cli", &[], OutputFormat::Text),
        );
        let err = backend
            .run(request("x", None), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConclaveError::Backend(_)));
    }
}
