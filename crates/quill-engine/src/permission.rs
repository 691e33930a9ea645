use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use quill_core::bus::Bus;
use quill_core::error::SessionError;
use quill_core::event::BusEvent;
use quill_core::ids::{PermissionId, SessionId};
use quill_core::permission::{
    evaluate, PermissionAction, PermissionReply, PermissionRequest, PermissionRule,
};
use quill_core::tools::{AskRequest, PermissionAsk};
use quill_store::permissions::PermissionRepo;
use quill_store::sessions::SessionRepo;
use quill_store::Database;

/// Policy evaluation plus interactive approval. Rule layering is
/// session override → agent → project; the default disposition is `ask`.
pub struct PermissionGate {
    sessions: SessionRepo,
    project_rules: PermissionRepo,
    project_id: String,
    bus: Bus,
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionReply>>>,
}

impl PermissionGate {
    pub fn new(db: Database, bus: Bus, project_id: impl Into<String>) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            project_rules: PermissionRepo::new(db),
            project_id: project_id.into(),
            bus,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// First-match evaluation of one key across the rule layers.
    pub fn evaluate(
        &self,
        session_id: &SessionId,
        agent_rules: &[PermissionRule],
        key: &str,
    ) -> PermissionAction {
        let session_rules = self
            .sessions
            .get(session_id)
            .map(|s| s.permissions)
            .unwrap_or_default();
        let project_rules = self.project_rules.get(&self.project_id).unwrap_or_default();
        evaluate(key, &[&session_rules, agent_rules, &project_rules])
    }

    /// Resolve an ask: `deny` rules win outright, an all-`allow` evaluation
    /// returns immediately, anything else parks on user approval. A pending
    /// ask resolves as rejected when the turn's cancellation signal fires.
    #[instrument(skip(self, agent_rules, request), fields(session_id = %request.session_id, tool = %request.tool))]
    pub async fn ask(
        &self,
        agent_rules: &[PermissionRule],
        request: AskRequest,
    ) -> Result<(), SessionError> {
        let mut needs_ask = false;
        for key in &request.patterns {
            match self.evaluate(&request.session_id, agent_rules, key) {
                PermissionAction::Deny => {
                    return Err(SessionError::PermissionDenied {
                        message: format!("{} denied by rule for {key}", request.tool),
                    })
                }
                PermissionAction::Ask => needs_ask = true,
                PermissionAction::Allow => {}
            }
        }
        if !needs_ask {
            return Ok(());
        }

        let id = PermissionId::new();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id.as_str().to_string(), tx);

        self.bus.publish(BusEvent::PermissionUpdated {
            request: PermissionRequest {
                id: id.clone(),
                session_id: request.session_id.clone(),
                call_id: request.call_id.clone(),
                tool: request.tool.clone(),
                patterns: request.patterns.clone(),
                metadata: request.metadata.clone(),
            },
        });

        let reply = tokio::select! {
            reply = rx => reply.unwrap_or(PermissionReply::Reject),
            _ = request.abort.cancelled() => {
                self.pending.lock().remove(id.as_str());
                debug!(permission_id = %id, "pending ask resolved as reject on abort");
                PermissionReply::Reject
            }
        };

        match reply {
            PermissionReply::Once => Ok(()),
            PermissionReply::Always => {
                self.remember_always(&request);
                Ok(())
            }
            PermissionReply::Reject => Err(SessionError::PermissionDenied {
                message: format!("{} rejected by user", request.tool),
            }),
        }
    }

    /// Deliver a user's reply to a pending ask. Returns false for unknown or
    /// already-resolved ids.
    pub fn reply(
        &self,
        session_id: &SessionId,
        permission_id: &str,
        response: PermissionReply,
    ) -> bool {
        let Some(tx) = self.pending.lock().remove(permission_id) else {
            return false;
        };
        if tx.send(response).is_err() {
            // The asking turn unwound before the user answered.
            return false;
        }
        self.bus.publish(BusEvent::PermissionReplied {
            session_id: session_id.clone(),
            permission_id: permission_id.to_string(),
            response,
        });
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Append allow rules for the chosen patterns to the session override
    /// ruleset.
    fn remember_always(&self, request: &AskRequest) {
        let patterns = if request.always.is_empty() {
            &request.patterns
        } else {
            &request.always
        };
        match self.sessions.get(&request.session_id) {
            Ok(mut session) => {
                for pattern in patterns {
                    if !session.permissions.iter().any(|r| &r.pattern == pattern) {
                        session
                            .permissions
                            .push(PermissionRule::new(pattern, PermissionAction::Allow));
                    }
                }
                session.touch();
                if let Err(e) = self.sessions.put(&session) {
                    warn!(error = %e, "failed to persist always-allow rules");
                    return;
                }
                self.bus.publish(BusEvent::SessionUpdated { session });
            }
            Err(e) => warn!(error = %e, "failed to load session for always-allow rules"),
        }
    }
}

/// Per-turn view of the gate carrying the active agent's rules; this is what
/// tool contexts hold.
pub struct GateHandle {
    gate: Arc<PermissionGate>,
    agent_rules: Vec<PermissionRule>,
}

impl GateHandle {
    pub fn new(gate: Arc<PermissionGate>, agent_rules: Vec<PermissionRule>) -> Self {
        Self { gate, agent_rules }
    }
}

#[async_trait]
impl PermissionAsk for GateHandle {
    async fn ask(&self, request: AskRequest) -> Result<(), SessionError> {
        self.gate.ask(&self.agent_rules, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::project::Project;
    use quill_core::session::Session;
    use quill_store::projects::ProjectRepo;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Database, Bus, SessionId, String) {
        let db = Database::in_memory().unwrap();
        let project = Project::global("/test");
        ProjectRepo::new(db.clone()).put(&project).unwrap();
        let session = Session::new(&project.id, "/test", None, None, "0.1.0");
        SessionRepo::new(db.clone()).put(&session).unwrap();
        (db, Bus::new(), session.id, project.id)
    }

    fn ask_request(sid: &SessionId, patterns: Vec<String>) -> AskRequest {
        AskRequest {
            session_id: sid.clone(),
            call_id: "call_1".into(),
            tool: "bash".into(),
            always: patterns.clone(),
            patterns,
            metadata: Value::Null,
            abort: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn allow_rule_passes_without_ask() {
        let (db, bus, sid, pid) = setup();
        PermissionRepo::new(db.clone())
            .set(&pid, &[PermissionRule::new("git *", PermissionAction::Allow)])
            .unwrap();
        let gate = PermissionGate::new(db, bus, &pid);

        let result = gate.ask(&[], ask_request(&sid, vec!["git status".into()])).await;
        assert!(result.is_ok());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_rule_short_circuits() {
        let (db, bus, sid, pid) = setup();
        PermissionRepo::new(db.clone())
            .set(&pid, &[PermissionRule::new("rm *", PermissionAction::Deny)])
            .unwrap();
        let gate = PermissionGate::new(db, bus, &pid);

        let err = gate
            .ask(&[], ask_request(&sid, vec!["rm -rf /".into()]))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "PermissionDenied");
    }

    #[tokio::test]
    async fn default_ask_publishes_and_waits_for_reply() {
        let (db, bus, sid, pid) = setup();
        let gate = Arc::new(PermissionGate::new(db, bus.clone(), &pid));
        let mut events = bus.subscribe_filtered("permission.");

        let ask_gate = gate.clone();
        let request = ask_request(&sid, vec!["cargo build".into()]);
        let ask = tokio::spawn(async move { ask_gate.ask(&[], request).await });

        // The ask surfaces as a permission.updated event with a fresh id.
        let event = events.next().await.unwrap();
        let BusEvent::PermissionUpdated { request } = event else {
            panic!("expected permission.updated, got {event:?}");
        };
        assert!(!request.id.as_str().is_empty());

        assert!(gate.reply(&sid, request.id.as_str(), PermissionReply::Once));
        assert!(ask.await.unwrap().is_ok());

        // The reply is observable on the bus.
        let event = events.next().await.unwrap();
        assert_eq!(event.event_type(), "permission.replied");
    }

    #[tokio::test]
    async fn reject_reply_denies() {
        let (db, bus, sid, pid) = setup();
        let gate = Arc::new(PermissionGate::new(db, bus.clone(), &pid));
        let mut events = bus.subscribe_filtered("permission.updated");

        let ask_gate = gate.clone();
        let request = ask_request(&sid, vec!["cargo run".into()]);
        let ask = tokio::spawn(async move { ask_gate.ask(&[], request).await });

        let BusEvent::PermissionUpdated { request } = events.next().await.unwrap() else {
            panic!("expected permission.updated");
        };
        gate.reply(&sid, request.id.as_str(), PermissionReply::Reject);

        let err = ask.await.unwrap().err().unwrap();
        assert_eq!(err.kind(), "PermissionDenied");
    }

    #[tokio::test]
    async fn always_reply_persists_session_rule() {
        let (db, bus, sid, pid) = setup();
        let gate = Arc::new(PermissionGate::new(db.clone(), bus.clone(), &pid));
        let mut events = bus.subscribe_filtered("permission.updated");

        let ask_gate = gate.clone();
        let request = ask_request(&sid, vec!["npm test".into()]);
        let ask = tokio::spawn(async move { ask_gate.ask(&[], request).await });

        let BusEvent::PermissionUpdated { request } = events.next().await.unwrap() else {
            panic!("expected permission.updated");
        };
        gate.reply(&sid, request.id.as_str(), PermissionReply::Always);
        assert!(ask.await.unwrap().is_ok());

        let session = SessionRepo::new(db).get(&sid).unwrap();
        assert!(session
            .permissions
            .iter()
            .any(|r| r.pattern == "npm test" && r.action == PermissionAction::Allow));

        // The remembered rule resolves the next ask without interaction.
        let result = gate.ask(&[], ask_request(&sid, vec!["npm test".into()])).await;
        assert!(result.is_ok());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn abort_resolves_pending_ask_as_reject() {
        let (db, bus, sid, pid) = setup();
        let gate = Arc::new(PermissionGate::new(db, bus, &pid));

        let mut request = ask_request(&sid, vec!["cargo build".into()]);
        let abort = CancellationToken::new();
        request.abort = abort.clone();

        let ask_gate = gate.clone();
        let ask = tokio::spawn(async move { ask_gate.ask(&[], request).await });

        // Give the ask a beat to park, then fire the turn's signal.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        abort.cancel();

        let err = ask.await.unwrap().err().unwrap();
        assert_eq!(err.kind(), "PermissionDenied");
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_to_unknown_id_is_false() {
        let (db, bus, sid, pid) = setup();
        let gate = PermissionGate::new(db, bus, &pid);
        assert!(!gate.reply(&sid, "perm_ghost", PermissionReply::Once));
    }

    #[tokio::test]
    async fn agent_rules_sit_between_session_and_project() {
        let (db, bus, sid, pid) = setup();
        PermissionRepo::new(db.clone())
            .set(&pid, &[PermissionRule::new("*", PermissionAction::Deny)])
            .unwrap();
        let gate = PermissionGate::new(db, bus, &pid);

        let agent_rules = vec![PermissionRule::new("git *", PermissionAction::Allow)];
        assert_eq!(
            gate.evaluate(&sid, &agent_rules, "git status"),
            PermissionAction::Allow
        );
        assert_eq!(
            gate.evaluate(&sid, &agent_rules, "rm -rf"),
            PermissionAction::Deny
        );
    }
}
