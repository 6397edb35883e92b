use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::progress::{Progress, ProgressBus};
use conclave_core::traits::IntentExtractor;
use conclave_core::types::{
    new_id, AgentStatus, BlackboardEntry, BusEvent, EventQuery, NewTeam, StreamEvent, Team,
    TeamMember, TeamStatus, TASK_DELEGATED,
};
use conclave_store::{Blackboard, EventBus, TeamStore};

use super::delegation::DelegationScanner;
use crate::launcher::{AgentLauncher, LaunchedRun};

pub const TEAM_STARTED: &str = "team.started";
pub const TEAM_STOPPED: &str = "team.stopped";

const RECENT_EVENTS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub agent_id: String,
    pub role: String,
    /// `None` when the member is not registered as an agent.
    pub status: Option<AgentStatus>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Snapshot returned by `team_status`.
#[derive(Debug, Clone, Serialize)]
pub struct TeamStatusReport {
    pub team: Team,
    pub supervisor: Option<MemberStatus>,
    pub members: Vec<MemberStatus>,
    pub recent_events: Vec<BusEvent>,
    pub blackboard: Vec<BlackboardEntry>,
}

/// Runs a team's supervisor agent and turns its delegation markers into
/// `task.delegated` events.
#[derive(Clone)]
pub struct TeamSupervisor {
    teams: TeamStore,
    events: EventBus,
    blackboard: Blackboard,
    launcher: AgentLauncher,
    extractor: Arc<dyn IntentExtractor>,
    progress: Arc<ProgressBus>,
}

impl TeamSupervisor {
    pub fn new(
        teams: TeamStore,
        events: EventBus,
        blackboard: Blackboard,
        launcher: AgentLauncher,
        extractor: Arc<dyn IntentExtractor>,
        progress: Arc<ProgressBus>,
    ) -> Self {
        Self {
            teams,
            events,
            blackboard,
            launcher,
            extractor,
            progress,
        }
    }

    // ── Teams ───────────────────────────────────────────────────

    pub fn create_team(&self, new: NewTeam) -> Result<Team> {
        let id = new.id.unwrap_or_else(new_id);
        match self.teams.get(&id) {
            Ok(_) => return Err(ConclaveError::AlreadyExists(format!("team {}", id))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let team = Team {
            id,
            name: new.name,
            description: new.description,
            supervisor_id: new.supervisor_id,
            members: new.members,
            status: TeamStatus::Idle,
            created_at: Utc::now(),
        };
        self.teams.save(&team)?;
        info!(team_id = %team.id, members = team.members.len(), "Team created");
        Ok(team)
    }

    pub fn get_team(&self, id: &str) -> Result<Team> {
        self.teams.get(id)
    }

    pub fn list_teams(&self) -> Result<Vec<Team>> {
        self.teams.list()
    }

    pub fn delete_team(&self, id: &str) -> Result<bool> {
        self.teams.delete(id)
    }

    /// Add a member, replacing an existing entry for the same agent in place.
    pub fn add_member(&self, team_id: &str, member: TeamMember) -> Result<Team> {
        let mut team = self.teams.get(team_id)?;
        match team.members.iter_mut().find(|m| m.agent_id == member.agent_id) {
            Some(existing) => *existing = member,
            None => team.members.push(member),
        }
        self.teams.save(&team)?;
        Ok(team)
    }

    pub fn remove_member(&self, team_id: &str, agent_id: &str) -> Result<bool> {
        let mut team = self.teams.get(team_id)?;
        let before = team.members.len();
        team.members.retain(|m| m.agent_id != agent_id);
        if team.members.len() == before {
            return Ok(false);
        }
        self.teams.save(&team)?;
        Ok(true)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Activate the team and launch its supervisor with a coordination
    /// prompt. The returned stream relays the supervisor's output; every
    /// delegation marker in it is published as a `task.delegated` event,
    /// whether or not the stream is consumed.
    pub async fn start_team(
        &self,
        team_id: &str,
        prompt: &str,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        let mut team = self.teams.get(team_id)?;
        let supervisor_id = match &team.supervisor_id {
            Some(id) => id.clone(),
            None => {
                let id = format!("{}-supervisor", team.id);
                team.supervisor_id = Some(id.clone());
                self.teams.save(&team)?;
                id
            }
        };
        self.launcher.ensure_agent(&supervisor_id, None)?;

        self.teams.set_status(&team.id, TeamStatus::Active)?;
        self.events.publish(
            TEAM_STARTED,
            &supervisor_id,
            json!({ "team_id": team.id, "prompt": prompt }),
        )?;
        info!(team_id = %team.id, supervisor = %supervisor_id, "Team started");

        let full_prompt = format!("{}\n\n## Task\n{}", self.coordination_prompt(&team)?, prompt);
        let launched = self.launcher.launch(&supervisor_id, &full_prompt).await?;

        let (tx, rx) = mpsc::channel(256);
        let relay = Relay {
            supervisor: self.clone(),
            team_id: team.id.clone(),
            supervisor_id,
        };
        tokio::spawn(relay.run(launched, tx));

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }

    /// Stop the supervisor and every member, then mark the team idle.
    pub async fn stop_team(&self, team_id: &str) -> Result<Team> {
        let team = self.teams.get(team_id)?;
        let agents = team
            .supervisor_id
            .iter()
            .chain(team.members.iter().map(|m| &m.agent_id));
        for agent_id in agents {
            match self.launcher.stop(agent_id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.teams.set_status(&team.id, TeamStatus::Idle)?;
        self.events.publish(
            TEAM_STOPPED,
            team.supervisor_id.as_deref().unwrap_or(&team.id),
            json!({ "team_id": team.id }),
        )?;
        info!(team_id = %team.id, "Team stopped");
        self.teams.get(team_id)
    }

    /// Send a message to one member, resuming its session when it has one.
    pub async fn message_team_member(
        &self,
        team_id: &str,
        agent_id: &str,
        message: &str,
    ) -> Result<LaunchedRun> {
        let team = self.teams.get(team_id)?;
        if !team.includes(agent_id) {
            return Err(ConclaveError::AgentNotFound(format!(
                "{} is not in team {}",
                agent_id, team_id
            )));
        }
        self.launcher.ensure_agent(agent_id, None)?;
        debug!(team_id = %team_id, agent_id = %agent_id, "Messaging team member");
        self.launcher.prompt(agent_id, message).await
    }

    pub fn team_status(&self, team_id: &str) -> Result<TeamStatusReport> {
        let team = self.teams.get(team_id)?;
        let supervisor = match &team.supervisor_id {
            Some(id) => Some(self.member_status(id, "supervisor")?),
            None => None,
        };
        let members = team
            .members
            .iter()
            .map(|m| self.member_status(&m.agent_id, &m.role))
            .collect::<Result<Vec<_>>>()?;

        let recent_events = self
            .events
            .query(&EventQuery::default().including_consumed().with_limit(200))?
            .into_iter()
            .filter(|e| {
                team.includes(&e.source)
                    || e.payload.get("team_id").and_then(Value::as_str) == Some(team.id.as_str())
            })
            .take(RECENT_EVENTS)
            .collect();
        let blackboard = self.blackboard.read_all(&team.id)?;

        Ok(TeamStatusReport {
            team,
            supervisor,
            members,
            recent_events,
            blackboard,
        })
    }

    fn member_status(&self, agent_id: &str, role: &str) -> Result<MemberStatus> {
        let agent = self.launcher.get_agent(agent_id).map(Some).or_else(|e| {
            if e.is_not_found() {
                Ok(None)
            } else {
                Err(e)
            }
        })?;
        Ok(MemberStatus {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            status: agent.as_ref().map(|a| a.status),
            last_activity: agent.and_then(|a| a.last_activity),
        })
    }

    /// System prompt telling the supervisor who its teammates are and how
    /// to hand work to them.
    fn coordination_prompt(&self, team: &Team) -> Result<String> {
        let mut prompt = format!("You are the supervisor of team \"{}\".", team.name);
        if !team.description.is_empty() {
            let _ = write!(prompt, " {}", team.description);
        }
        prompt.push_str("\n\nYour teammates:\n");
        if team.members.is_empty() {
            prompt.push_str("- (none yet)\n");
        }
        for member in &team.members {
            let name = self
                .launcher
                .get_agent(&member.agent_id)
                .map(|a| a.name)
                .unwrap_or_else(|_| member.agent_id.clone());
            let _ = write!(prompt, "- {} (id: {}), role: {}", name, member.agent_id, member.role);
            if !member.capabilities.is_empty() {
                let _ = write!(prompt, ", capabilities: {}", member.capabilities.join(", "));
            }
            prompt.push('\n');
        }
        prompt.push_str(
            "\nTo hand a task to a teammate, write a line of the form:\n\
             [DELEGATE: <agent id> | <task description>]\n\
             Teammates pick delegated tasks up with claim_task and report back with complete_task.",
        );
        Ok(prompt)
    }
}

/// Background task relaying the supervisor stream.
struct Relay {
    supervisor: TeamSupervisor,
    team_id: String,
    supervisor_id: String,
}

impl Relay {
    async fn run(self, mut launched: LaunchedRun, tx: mpsc::Sender<StreamEvent>) {
        let extractor = self.supervisor.extractor.clone();
        let mut scanner = DelegationScanner::new(extractor.as_ref());
        while let Some(event) = launched.events.next().await {
            if let Some(text) = event.text() {
                for delegation in scanner.push(text) {
                    info!(
                        team_id = %self.team_id,
                        from = %self.supervisor_id,
                        to = %delegation.agent_id,
                        "Delegation parsed"
                    );
                    let payload = json!({
                        "agent_id": delegation.agent_id,
                        "task": delegation.task,
                        "from": self.supervisor_id,
                        "team_id": self.team_id,
                    });
                    if let Err(e) = self
                        .supervisor
                        .events
                        .publish(TASK_DELEGATED, &self.supervisor_id, payload)
                    {
                        warn!(team_id = %self.team_id, error = %e, "Failed to publish delegation");
                    }
                    self.supervisor.progress.publish(Progress::Delegated {
                        team_id: self.team_id.clone(),
                        from: self.supervisor_id.clone(),
                        delegation,
                    });
                }
            }
            let done = event.is_done();
            let _ = tx.send(event).await;
            if done {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conclave_store::Stores;
    use conclave_test_utils::{Script, ScriptedBackend};
    use conclave_core::types::{BackendEvent, NewAgent};

    use crate::backends::BackendRegistry;
    use crate::handles::InMemoryHandles;
    use crate::logs::InMemoryLogBuffer;
    use crate::team::delegation::MarkerExtractor;

    fn supervisor(backend: Arc<ScriptedBackend>) -> (TeamSupervisor, Stores) {
        let stores = Stores::in_memory().unwrap();
        let mut registry = BackendRegistry::new("scripted");
        registry.register(backend);
        let progress = Arc::new(ProgressBus::default());
        let launcher = AgentLauncher::new(
            stores.agents.clone(),
            stores.traces.clone(),
            Arc::new(registry),
            Arc::new(InMemoryHandles::new()),
            Arc::new(InMemoryLogBuffer::new(100)),
            progress.clone(),
        );
        let supervisor = TeamSupervisor::new(
            stores.teams.clone(),
            stores.events.clone(),
            stores.blackboard.clone(),
            launcher,
            Arc::new(MarkerExtractor),
            progress,
        );
        (supervisor, stores)
    }

    fn new_team() -> NewTeam {
        NewTeam {
            id: Some("core".into()),
            name: "Core".into(),
            description: "Ships the parser.".into(),
            supervisor_id: None,
            members: vec![
                TeamMember::new("dev", "developer").with_capabilities(vec!["rust".into()]),
                TeamMember::new("qa", "tester"),
            ],
        }
    }

    #[tokio::test]
    async fn test_start_team_publishes_delegations() {
        let backend = Arc::new(ScriptedBackend::new("scripted"));
        backend.push(
            "core-supervisor",
            Script::events(vec![
                BackendEvent::Text("Plan ready. [DELEGATE: dev | write the ".into()),
                BackendEvent::Text("lexer]\n[DELEGATE: broken]\n[DELEGATE: qa | test it]".into()),
                BackendEvent::Done { usage: None },
            ]),
        );
        let (supervisor, stores) = supervisor(backend.clone());
        supervisor.create_team(new_team()).unwrap();
        supervisor
            .launcher
            .create_agent(NewAgent::new("dev", "Dev"))
            .unwrap();

        let events: Vec<StreamEvent> = supervisor
            .start_team("core", "Build a parser")
            .await
            .unwrap()
            .collect()
            .await;
        assert!(events.last().unwrap().is_done());

        let delegated = stores
            .events
            .query(&EventQuery::of_type(TASK_DELEGATED))
            .unwrap();
        assert_eq!(delegated.len(), 2);
        // Newest first
        assert_eq!(delegated[0].payload["agent_id"], "qa");
        assert_eq!(delegated[1].payload["task"], "write the lexer");
        assert_eq!(delegated[1].source, "core-supervisor");

        let team = supervisor.get_team("core").unwrap();
        assert_eq!(team.status, TeamStatus::Active);
        assert_eq!(team.supervisor_id.as_deref(), Some("core-supervisor"));
        assert_eq!(stores.events.query(&EventQuery::of_type(TEAM_STARTED)).unwrap().len(), 1);

        let prompt = &backend.requests_for("core-supervisor")[0].prompt;
        assert!(prompt.contains("Dev (id: dev), role: developer, capabilities: rust"));
        assert!(prompt.contains("qa (id: qa), role: tester"));
        assert!(prompt.ends_with("## Task\nBuild a parser"));
    }

    #[tokio::test]
    async fn test_stop_team() {
        let backend = Arc::new(ScriptedBackend::new("scripted").with_default(Script::hang()));
        let (supervisor, stores) = supervisor(backend);
        supervisor.create_team(new_team()).unwrap();

        let stream = supervisor.start_team("core", "go").await.unwrap();
        let team = supervisor.stop_team("core").await.unwrap();
        assert_eq!(team.status, TeamStatus::Idle);

        let events: Vec<StreamEvent> = stream.collect().await;
        assert!(events.last().unwrap().is_done());
        assert_eq!(
            supervisor.launcher.get_agent("core-supervisor").unwrap().status,
            AgentStatus::Terminated
        );
        assert_eq!(stores.events.query(&EventQuery::of_type(TEAM_STOPPED)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_message_member_resumes_session() {
        let backend = Arc::new(ScriptedBackend::new("scripted"));
        backend.push("dev", Script::session_reply("s-dev", "on it"));
        let (supervisor, _) = supervisor(backend.clone());
        supervisor.create_team(new_team()).unwrap();

        let first = supervisor
            .message_team_member("core", "dev", "start")
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(first.text, "on it");
        supervisor
            .message_team_member("core", "dev", "status?")
            .await
            .unwrap()
            .collect()
            .await;

        let requests = backend.requests_for("dev");
        assert_eq!(requests[0].resume_session, None);
        assert_eq!(requests[1].resume_session.as_deref(), Some("s-dev"));

        assert!(supervisor
            .message_team_member("core", "stranger", "hi")
            .await
            .err()
            .unwrap()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_team_status_and_membership() {
        let (supervisor, stores) = supervisor(Arc::new(ScriptedBackend::new("scripted")));
        supervisor.create_team(new_team()).unwrap();
        supervisor
            .launcher
            .create_agent(NewAgent::new("dev", "Dev"))
            .unwrap();
        stores.events.publish("build.done", "dev", json!({})).unwrap();
        stores.events.publish("noise", "outsider", json!({})).unwrap();
        stores
            .blackboard
            .write("plan", &json!("v1"), "dev", "core")
            .unwrap();

        let report = supervisor.team_status("core").unwrap();
        assert_eq!(report.members.len(), 2);
        assert_eq!(report.members[0].status, Some(AgentStatus::Idle));
        assert_eq!(report.members[1].status, None);
        assert_eq!(report.recent_events.len(), 1);
        assert_eq!(report.blackboard.len(), 1);

        supervisor
            .add_member("core", TeamMember::new("qa", "lead tester"))
            .unwrap();
        let team = supervisor.get_team("core").unwrap();
        assert_eq!(team.members.len(), 2);
        assert_eq!(team.members[1].role, "lead tester");
        assert!(supervisor.remove_member("core", "qa").unwrap());
        assert!(!supervisor.remove_member("core", "qa").unwrap());

        assert!(matches!(
            supervisor.create_team(new_team()),
            Err(ConclaveError::AlreadyExists(_))
        ));
        assert!(supervisor.team_status("ghost").unwrap_err().is_not_found());
    }
}
