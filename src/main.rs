mod doctor;

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use conclave_agent::normalize::render_line;
use conclave_agent::{BackendRegistry, Conclave};
use conclave_core::config::AppConfig;
use conclave_core::types::{
    EventQuery, NewAgent, NewTeam, NewWorkflow, StreamEvent, TeamMember, WorkflowStatus,
};
use conclave_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "conclave", version, about = "Coordination core for teams of AI agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "CONCLAVE_CONFIG", default_value = "conclave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage and drive agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Manage and run workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Manage and run teams
    Team {
        #[command(subcommand)]
        action: TeamAction,
    },
    /// Read or publish bus events
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
    /// Answer coordination tool calls as JSON lines on stdin/stdout
    ServeTools {
        /// Agent the calls are made on behalf of
        #[arg(long, env = "CONCLAVE_AGENT_ID")]
        agent: String,
    },
    /// Start the HTTP gateway, trigger scheduler, and run logger
    Serve,
    /// Check configuration, storage, and runtimes
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List registered agents
    List,
    /// Register an agent
    Create {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// Backend runtime (default: launcher.default_runtime)
        #[arg(long)]
        runtime: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        /// Comma-separated capabilities
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    /// Show one agent
    Show { id: String },
    /// Start a fresh session with a prompt and stream the reply
    Launch {
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Continue the stored session, or start one
    Prompt {
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Mark an agent terminated
    Stop { id: String },
    /// Delete an agent
    Delete { id: String },
    /// Recent traces of an agent
    Traces {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List workflows
    List,
    /// Create a workflow from a TOML or JSON file
    Create { file: PathBuf },
    /// Replace a workflow's definition from a file
    Update { id: String, file: PathBuf },
    /// Show a workflow definition
    Show { id: String },
    /// Run a workflow and wait for it
    Run {
        id: String,
        /// JSON input placed on the run blackboard
        #[arg(long)]
        input: Option<String>,
    },
    /// Show one run with its step results
    ShowRun { run_id: String },
    /// Recent runs of a workflow
    Runs {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Re-enable triggers
    Enable { id: String },
    /// Disable triggers
    Disable { id: String },
    /// Delete a workflow and its runs
    Delete { id: String },
}

#[derive(Subcommand)]
enum TeamAction {
    /// List teams
    List,
    /// Create a team from a TOML or JSON file
    Create { file: PathBuf },
    /// Add or replace a member
    AddMember {
        team: String,
        agent: String,
        #[arg(long, default_value = "member")]
        role: String,
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    /// Remove a member
    RemoveMember { team: String, agent: String },
    /// Members, recent events, and blackboard
    Status { id: String },
    /// Give the supervisor a task and stream its output
    Start {
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Stop the supervisor and all members
    Stop { id: String },
    /// Message one member, resuming its session
    Message {
        team: String,
        agent: String,
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Events newest first
    List {
        /// Only this event type
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Only events from this source agent
        #[arg(long)]
        source: Option<String>,
        /// Include consumed events
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Append an event to the bus
    Publish {
        event_type: String,
        #[arg(long, default_value = "cli")]
        source: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays clean for tool responses and JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conclave=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "conclave", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Commands::Doctor = &cli.command {
        let failures = doctor::run_doctor(&config);
        if failures > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    std::fs::create_dir_all(config.workspace_dir()).ok();
    let backends = BackendRegistry::from_config(&config);
    if backends.names().is_empty() {
        warn!("No [runtimes] configured; agents cannot be launched");
    }
    let app = Conclave::open(config, backends)?;
    // Held until exit; read-only commands and serve-tools never take it
    let _lease = if executes(&cli.command) {
        let lease = app.claim_execution()?;
        if lease.is_none() {
            warn!("Another conclave process owns execution; stale state is left to it");
        }
        lease
    } else {
        None
    };

    match cli.command {
        Commands::Agent { action } => handle_agent(&app, action).await,
        Commands::Workflow { action } => handle_workflow(&app, action).await,
        Commands::Team { action } => handle_team(&app, action).await,
        Commands::Events { action } => handle_events(&app, action),
        Commands::ServeTools { agent } => {
            info!(agent_id = %agent, "Serving coordination tools on stdio");
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            app.tools.serve(&agent, stdin, tokio::io::stdout()).await?;
            Ok(())
        }
        Commands::Serve => serve(app).await,
        Commands::Doctor | Commands::Completions { .. } => Ok(()),
    }
}

/// Commands that drive agents in this process.
fn executes(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Serve
            | Commands::Agent {
                action: AgentAction::Launch { .. } | AgentAction::Prompt { .. }
            }
            | Commands::Workflow {
                action: WorkflowAction::Run { .. }
            }
            | Commands::Team {
                action: TeamAction::Start { .. } | TeamAction::Message { .. }
            }
    )
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|h| h.join(".conclave").join("config.toml"));
    match home_config {
        Some(home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(AppConfig::load(&home)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

/// Parse a definition file as TOML, or JSON when the extension says so.
fn read_definition<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    Ok(if is_json {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a launch stream as it arrives. Returns the last error, if any.
async fn stream_to_stdout(
    mut events: futures::stream::BoxStream<'static, StreamEvent>,
) -> Option<String> {
    let mut stdout = std::io::stdout();
    let mut last_error = None;
    while let Some(event) = events.next().await {
        match &event {
            StreamEvent::Done => break,
            StreamEvent::Error { message } => {
                eprintln!("{}", render_line(&event));
                last_error = Some(message.clone());
            }
            StreamEvent::Status { .. } => {}
            other => match other.text() {
                Some(text) => {
                    print!("{}", text);
                    stdout.flush().ok();
                }
                None => eprintln!("{}", render_line(other)),
            },
        }
    }
    println!();
    last_error
}

fn handle_events(app: &Conclave, action: EventsAction) -> anyhow::Result<()> {
    match action {
        EventsAction::List {
            event_type,
            source,
            all,
            limit,
        } => {
            let mut query = EventQuery::default().with_limit(limit);
            query.event_type = event_type;
            query.source = source;
            if all {
                query = query.including_consumed();
            }
            print_json(&app.stores.events.query(&query)?)
        }
        EventsAction::Publish {
            event_type,
            source,
            payload,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            print_json(&app.stores.events.publish(&event_type, &source, payload)?)
        }
    }
}

async fn handle_agent(app: &Conclave, action: AgentAction) -> anyhow::Result<()> {
    let launcher = &app.launcher;
    match action {
        AgentAction::List => {
            for agent in launcher.list_agents()? {
                println!(
                    "{:<24} {:<12} {:<10} {}",
                    agent.id,
                    agent.status.as_str(),
                    agent.config.runtime.as_deref().unwrap_or("-"),
                    agent.name
                );
            }
        }
        AgentAction::Create {
            id,
            name,
            runtime,
            model,
            system_prompt,
            capabilities,
        } => {
            let mut new = NewAgent::new(id.clone(), name.unwrap_or(id));
            new.config.runtime = runtime;
            new.config.model = model;
            new.config.system_prompt = system_prompt;
            new.config.capabilities = capabilities;
            print_json(&launcher.create_agent(new)?)?;
        }
        AgentAction::Show { id } => print_json(&launcher.get_agent(&id)?)?,
        AgentAction::Launch { id, prompt } => {
            let launched = launcher.launch(&id, &prompt.join(" ")).await?;
            if let Some(message) = stream_to_stdout(launched.events).await {
                anyhow::bail!("agent {} failed: {}", id, message);
            }
        }
        AgentAction::Prompt { id, message } => {
            let launched = launcher.prompt(&id, &message.join(" ")).await?;
            if let Some(message) = stream_to_stdout(launched.events).await {
                anyhow::bail!("agent {} failed: {}", id, message);
            }
        }
        AgentAction::Stop { id } => {
            let interrupted = launcher.stop(&id).await?;
            println!("Stopped {} (interrupted: {})", id, interrupted);
        }
        AgentAction::Delete { id } => {
            if !launcher.delete_agent(&id).await? {
                anyhow::bail!("agent not found: {}", id);
            }
            println!("Deleted {}", id);
        }
        AgentAction::Traces { id, limit } => {
            print_json(&app.stores.traces.list_traces(Some(&id), limit)?)?;
        }
    }
    Ok(())
}

async fn handle_workflow(app: &Conclave, action: WorkflowAction) -> anyhow::Result<()> {
    let engine = &app.engine;
    match action {
        WorkflowAction::List => {
            for wf in engine.list_workflows()? {
                println!(
                    "{:<24} {:<9} {:<10} {}",
                    wf.id,
                    wf.status.as_str(),
                    wf.last_run_status.map(|s| s.as_str()).unwrap_or("-"),
                    wf.name
                );
            }
        }
        WorkflowAction::Create { file } => {
            let spec: NewWorkflow = read_definition(&file)?;
            print_json(&engine.create_workflow(spec)?)?;
        }
        WorkflowAction::Update { id, file } => {
            let spec: NewWorkflow = read_definition(&file)?;
            print_json(&engine.update_workflow(&id, spec)?)?;
        }
        WorkflowAction::Show { id } => print_json(&engine.get_workflow(&id)?)?,
        WorkflowAction::Run { id, input } => {
            let input = input.map(|s| serde_json::from_str(&s)).transpose()?;
            let logger_cancel = CancellationToken::new();
            let logger = app.spawn_run_logger(logger_cancel.clone());
            let run = engine.run_workflow(&id, input).await;
            logger_cancel.cancel();
            if let Some(handle) = logger {
                handle.await.ok();
            }
            print_json(&run?)?;
        }
        WorkflowAction::ShowRun { run_id } => print_json(&engine.get_run(&run_id)?)?,
        WorkflowAction::Runs { id, limit } => print_json(&engine.list_runs(&id, limit)?)?,
        WorkflowAction::Enable { id } => {
            engine.set_workflow_status(&id, WorkflowStatus::Active)?;
            println!("Enabled {}", id);
        }
        WorkflowAction::Disable { id } => {
            engine.set_workflow_status(&id, WorkflowStatus::Disabled)?;
            println!("Disabled {}", id);
        }
        WorkflowAction::Delete { id } => {
            if !engine.delete_workflow(&id)? {
                anyhow::bail!("workflow not found: {}", id);
            }
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

async fn handle_team(app: &Conclave, action: TeamAction) -> anyhow::Result<()> {
    let teams = &app.teams;
    match action {
        TeamAction::List => {
            for team in teams.list_teams()? {
                println!(
                    "{:<24} {:<7} {:>3} members  {}",
                    team.id,
                    team.status.as_str(),
                    team.members.len(),
                    team.name
                );
            }
        }
        TeamAction::Create { file } => {
            let spec: NewTeam = read_definition(&file)?;
            print_json(&teams.create_team(spec)?)?;
        }
        TeamAction::AddMember {
            team,
            agent,
            role,
            capabilities,
        } => {
            let member = TeamMember::new(agent, role).with_capabilities(capabilities);
            print_json(&teams.add_member(&team, member)?)?;
        }
        TeamAction::RemoveMember { team, agent } => {
            if !teams.remove_member(&team, &agent)? {
                anyhow::bail!("{} is not a member of {}", agent, team);
            }
            println!("Removed {} from {}", agent, team);
        }
        TeamAction::Status { id } => print_json(&teams.team_status(&id)?)?,
        TeamAction::Start { id, prompt } => {
            let events = teams.start_team(&id, &prompt.join(" ")).await?;
            if let Some(message) = stream_to_stdout(events).await {
                error!(team_id = %id, error = %message, "Supervisor failed");
            }
        }
        TeamAction::Stop { id } => print_json(&teams.stop_team(&id).await?)?,
        TeamAction::Message {
            team,
            agent,
            message,
        } => {
            let launched = teams
                .message_team_member(&team, &agent, &message.join(" "))
                .await?;
            if let Some(message) = stream_to_stdout(launched.events).await {
                anyhow::bail!("agent {} failed: {}", agent, message);
            }
        }
    }
    Ok(())
}

/// Gateway, trigger scheduler, and run logger until Ctrl-C.
async fn serve(app: Conclave) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let logger = app.spawn_run_logger(shutdown.clone());

    let scheduler = app.scheduler(shutdown.clone());
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let gateway = GatewayServer::new(app.config.gateway.clone(), app.clone());
    let gateway_shutdown = shutdown.clone();
    let gateway_task = tokio::spawn(async move { gateway.run(gateway_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    scheduler_task.await.ok();
    match gateway_task.await {
        Ok(Err(e)) => error!(error = %e, "Gateway exited with error"),
        Err(e) => error!(error = %e, "Gateway task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = logger {
        handle.await.ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Commands {
        let mut argv = vec!["conclave"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn test_only_executing_commands_claim_execution() {
        assert!(executes(&parse(&["serve"])));
        assert!(executes(&parse(&["agent", "launch", "a1", "do", "it"])));
        assert!(executes(&parse(&["workflow", "run", "nightly"])));
        assert!(executes(&parse(&["team", "message", "docs", "editor", "hi"])));

        assert!(!executes(&parse(&["serve-tools", "--agent", "a1"])));
        assert!(!executes(&parse(&["agent", "list"])));
        assert!(!executes(&parse(&["workflow", "show-run", "run-1"])));
        assert!(!executes(&parse(&["events", "list", "--all"])));
    }
}
