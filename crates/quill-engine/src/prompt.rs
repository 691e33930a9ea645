use quill_core::ids::SessionId;
use quill_core::part::{PartBody, ToolState};
use quill_core::provider::{ModelSpec, ModelTurn, StreamRequest};
use quill_core::tools::ToolDefinition;
use quill_store::messages::MessageRepo;
use quill_store::parts::PartRepo;
use quill_store::{Database, StoreError};

use crate::config::{AgentConfig, EngineConfig};

const BASE_PROMPT: &str = "You are a coding agent operating inside the user's repository. \
Work through the user's request step by step, using the available tools to read, \
search and modify files. Prefer small verifiable changes, keep explanations short, \
and report what you actually did.";

/// Placeholder replayed in place of tool outputs elided by compaction.
pub const ELIDED_OUTPUT: &str = "[old tool output elided to save context]";

/// System prompt blocks for one turn: base style, environment snapshot, then
/// the configured custom rules.
pub fn compose_system(config: &EngineConfig, agent: &AgentConfig, spec: &ModelSpec) -> Vec<String> {
    let mut blocks = Vec::new();
    blocks.push(
        agent
            .prompt
            .clone()
            .unwrap_or_else(|| BASE_PROMPT.to_string()),
    );
    blocks.push(format!(
        "<environment>\nworking directory: {}\nplatform: {}\nmodel: {}/{}\ndate: {}\n</environment>",
        config.directory.display(),
        std::env::consts::OS,
        spec.provider_id,
        spec.model_id,
        chrono::Utc::now().format("%Y-%m-%d"),
    ));
    blocks.extend(config.instructions.iter().cloned());
    blocks
}

/// Reconstruct the provider request from persisted history.
///
/// Replay starts at the latest compaction summary when one exists; completed
/// tool outputs marked `compacted` are replaced by a short placeholder while
/// the stored part keeps the full text for UI retrieval.
pub fn build_request(
    db: &Database,
    session_id: &SessionId,
    system: Vec<String>,
    tools: Vec<ToolDefinition>,
) -> Result<StreamRequest, StoreError> {
    let messages = MessageRepo::new(db.clone()).list(session_id)?;
    let parts_repo = PartRepo::new(db.clone());

    let start = messages
        .iter()
        .rposition(|m| m.is_summary())
        .unwrap_or(0);

    let mut turns = Vec::with_capacity(messages.len() - start);
    for message in &messages[start..] {
        let mut parts = parts_repo.list_for_message(message.id())?;
        for part in &mut parts {
            if let PartBody::Tool { state, .. } = &mut part.body {
                if let ToolState::Completed { output, time, .. } = state {
                    if time.compacted.is_some() {
                        *output = ELIDED_OUTPUT.to_string();
                    }
                }
            }
        }
        turns.push(ModelTurn {
            message: message.clone(),
            parts,
        });
    }

    Ok(StreamRequest {
        system,
        turns,
        tools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ids::MessageId;
    use quill_core::message::{AssistantMessage, Message, MessagePath, UserMessage};
    use quill_core::part::{Part, ToolTime};
    use quill_core::project::Project;
    use quill_core::provider::ModelRef;
    use quill_core::session::Session;
    use quill_store::projects::ProjectRepo;
    use quill_store::sessions::SessionRepo;
    use serde_json::json;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let project = Project::global("/test");
        ProjectRepo::new(db.clone()).put(&project).unwrap();
        let session = Session::new(&project.id, "/test", None, None, "0.1.0");
        SessionRepo::new(db.clone()).put(&session).unwrap();
        (db, session.id)
    }

    fn model() -> ModelRef {
        ModelRef::new("mock", "mock-model")
    }

    fn push_user(db: &Database, sid: &SessionId, text: &str) -> MessageId {
        let msg = Message::User(UserMessage::new(sid.clone(), "build", model()));
        let part = Part::text(msg.id().clone(), sid.clone(), text);
        MessageRepo::new(db.clone())
            .put_with_parts(&msg, &[part])
            .unwrap();
        msg.id().clone()
    }

    fn push_assistant(db: &Database, sid: &SessionId, parent: &MessageId, summary: bool) -> MessageId {
        let mut msg = AssistantMessage::new(
            sid.clone(),
            parent.clone(),
            &model(),
            "build",
            vec![],
            MessagePath::default(),
        );
        msg.summary = summary;
        msg.finish();
        let wrapped = Message::Assistant(msg);
        MessageRepo::new(db.clone()).put(&wrapped).unwrap();
        wrapped.id().clone()
    }

    #[test]
    fn system_composition_order() {
        let mut config = EngineConfig::new("/data", "/work", "proj");
        config.instructions.push("Always answer in haiku.".into());
        let agent = config.agent("build");
        let spec = ModelSpec {
            provider_id: "mock".into(),
            model_id: "mock-model".into(),
            context_limit: 1000,
            output_limit: 100,
            cost: Default::default(),
        };

        let blocks = compose_system(&config, &agent, &spec);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].contains("coding agent"));
        assert!(blocks[1].contains("working directory: /work"));
        assert_eq!(blocks[2], "Always answer in haiku.");
    }

    #[test]
    fn agent_prompt_replaces_base() {
        let config = EngineConfig::new("/data", "/work", "proj");
        let mut agent = config.agent("plan");
        agent.prompt = Some("You only plan, never execute.".into());
        let spec = ModelSpec {
            provider_id: "mock".into(),
            model_id: "m".into(),
            context_limit: 0,
            output_limit: 0,
            cost: Default::default(),
        };
        let blocks = compose_system(&config, &agent, &spec);
        assert_eq!(blocks[0], "You only plan, never execute.");
    }

    #[test]
    fn request_covers_full_history() {
        let (db, sid) = setup();
        let u1 = push_user(&db, &sid, "first");
        push_assistant(&db, &sid, &u1, false);
        push_user(&db, &sid, "second");

        let request = build_request(&db, &sid, vec!["sys".into()], vec![]).unwrap();
        assert_eq!(request.turns.len(), 3);
        assert_eq!(request.system, vec!["sys".to_string()]);
    }

    #[test]
    fn replay_starts_at_latest_summary() {
        let (db, sid) = setup();
        let u1 = push_user(&db, &sid, "old question");
        push_assistant(&db, &sid, &u1, false);
        let u2 = push_user(&db, &sid, "summarise");
        let summary = push_assistant(&db, &sid, &u2, true);
        push_user(&db, &sid, "new question");

        let request = build_request(&db, &sid, vec![], vec![]).unwrap();
        assert_eq!(request.turns.len(), 2);
        assert_eq!(request.turns[0].message.id(), &summary);
    }

    #[test]
    fn compacted_tool_outputs_are_elided_from_replay() {
        let (db, sid) = setup();
        let uid = push_user(&db, &sid, "run the tool");
        let aid = push_assistant(&db, &sid, &uid, false);

        let part = Part::new(
            aid.clone(),
            sid.clone(),
            PartBody::Tool {
                call_id: "call_1".into(),
                tool: "read".into(),
                state: ToolState::Completed {
                    input: json!({}),
                    output: "the enormous original output".into(),
                    title: "read".into(),
                    metadata: json!({}),
                    attachments: vec![],
                    time: ToolTime {
                        start: 1,
                        end: 2,
                        compacted: Some(3),
                    },
                },
            },
        );
        PartRepo::new(db.clone()).put(&part).unwrap();

        let request = build_request(&db, &sid, vec![], vec![]).unwrap();
        let replayed = request
            .turns
            .iter()
            .flat_map(|t| &t.parts)
            .find_map(|p| match &p.body {
                PartBody::Tool { state: ToolState::Completed { output, .. }, .. } => Some(output.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(replayed, ELIDED_OUTPUT);

        // The stored part is untouched — UI retrieval still has the text.
        let stored = PartRepo::new(db).get(&part.id).unwrap();
        match stored.tool_state().unwrap() {
            ToolState::Completed { output, .. } => {
                assert_eq!(output, "the enormous original output")
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
}
