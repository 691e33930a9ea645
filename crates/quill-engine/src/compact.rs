use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use quill_core::bus::Bus;
use quill_core::error::SessionError;
use quill_core::event::BusEvent;
use quill_core::ids::{now_millis, PartId, SessionId};
use quill_core::message::{AssistantMessage, Message, MessagePath, UserMessage};
use quill_core::part::{Part, PartBody, Timespan, ToolState};
use quill_core::provider::{LlmProvider, ModelSpec, ProviderEvent, StreamOptions, TokenUsage};
use quill_core::session::Session;
use quill_store::messages::MessageRepo;
use quill_store::parts::PartRepo;
use quill_store::sessions::SessionRepo;
use quill_store::{Database, StoreError};

use crate::prompt;

/// Estimated tool-output tokens kept out of pruning, newest first.
pub const PRUNE_PROTECT: u64 = 40_000;
/// Pruning only happens when it would reclaim more than this.
pub const PRUNE_MINIMUM: u64 = 20_000;
/// Hard cap on the output headroom reserved below the context limit.
pub const OUTPUT_RESERVE: u64 = 32_000;

const COMPACT_INSTRUCTION: &str = "Summarize this conversation so far into a handoff \
for a fresh context window. Cover: what was asked, what was done (files touched, \
commands run, decisions made), the current state, and what remains. Be specific \
enough that work can continue without re-reading the elided history.";

/// The usable context budget for a model: its window minus reserved output
/// headroom.
pub fn effective_limit(spec: &ModelSpec) -> u64 {
    spec.context_limit
        .saturating_sub(spec.output_limit.min(OUTPUT_RESERVE))
}

/// Overflow detection; the turn engine calls this after each finished step.
/// Reaching the boundary exactly already counts. An unknown context limit
/// never overflows.
pub fn is_overflow(usage: &TokenUsage, spec: &ModelSpec) -> bool {
    if spec.context_limit == 0 {
        return false;
    }
    usage.context_tokens() >= effective_limit(spec)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub pruned: usize,
    pub estimated_tokens: u64,
}

/// Context-window management: metadata-only pruning of old tool outputs and
/// summarising compaction.
pub struct Compactor {
    db: Database,
    bus: Bus,
}

impl Compactor {
    pub fn new(db: Database, bus: Bus) -> Self {
        Self { db, bus }
    }

    /// Walk parts newest to oldest, never touching the last two user turns.
    /// Completed tool outputs beyond the first [`PRUNE_PROTECT`] estimated
    /// tokens become candidates; they are marked `compacted` only when the
    /// reclaimable total exceeds [`PRUNE_MINIMUM`]. Pure metadata change and
    /// idempotent: already-marked outputs neither count nor re-mark.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn prune(&self, session_id: &SessionId) -> Result<PruneReport, StoreError> {
        let messages = MessageRepo::new(self.db.clone()).list(session_id)?;
        let parts_repo = PartRepo::new(self.db.clone());

        let mut user_seen = 0usize;
        let mut protected = 0u64;
        let mut candidates: Vec<PartId> = Vec::new();
        let mut candidate_tokens = 0u64;

        for message in messages.iter().rev() {
            if user_seen < 2 {
                if message.is_user() {
                    user_seen += 1;
                }
                continue;
            }
            for part in parts_repo.list_for_message(message.id())?.iter().rev() {
                let PartBody::Tool { state, .. } = &part.body else {
                    continue;
                };
                let ToolState::Completed { output, time, .. } = state else {
                    continue;
                };
                if time.compacted.is_some() {
                    continue;
                }
                let estimate = (output.len() / 4) as u64;
                if protected <= PRUNE_PROTECT {
                    protected += estimate;
                    continue;
                }
                candidates.push(part.id.clone());
                candidate_tokens += estimate;
            }
        }

        if candidate_tokens <= PRUNE_MINIMUM {
            return Ok(PruneReport::default());
        }

        let mut pruned = 0usize;
        for id in &candidates {
            if let Some(part) = parts_repo.mark_compacted(id)? {
                pruned += 1;
                self.bus.publish(BusEvent::MessagePartUpdated { part });
            }
        }
        info!(pruned, estimated_tokens = candidate_tokens, "tool outputs pruned");
        Ok(PruneReport {
            pruned,
            estimated_tokens: candidate_tokens,
        })
    }

    /// Produce a compaction summary: a synthetic user instruction followed by
    /// a streamed assistant message flagged `summary` on success. Future
    /// prompt reconstruction restarts from that summary. A failure other than
    /// abort is recorded on the summary message; the session stays
    /// recoverable either way.
    #[instrument(skip_all, fields(session_id = %session.id))]
    pub async fn compact(
        &self,
        session: &Session,
        agent: &str,
        provider: Arc<dyn LlmProvider>,
        system: Vec<String>,
        path: MessagePath,
        cancel: &CancellationToken,
    ) -> Result<AssistantMessage, SessionError> {
        let sessions = SessionRepo::new(self.db.clone());
        let messages = MessageRepo::new(self.db.clone());
        let parts = PartRepo::new(self.db.clone());
        let spec = provider.spec().clone();

        self.set_compacting(&sessions, &session.id, Some(now_millis()));

        let user = UserMessage::new(session.id.clone(), agent, spec.model_ref());
        let instruction = Part::new(
            user.id.clone(),
            session.id.clone(),
            PartBody::Text {
                text: COMPACT_INSTRUCTION.to_string(),
                synthetic: true,
                time: Some(Timespan::started(now_millis())),
            },
        );
        let user = Message::User(user);
        messages
            .put_with_parts(&user, &[instruction.clone()])
            .map_err(SessionError::from)?;
        self.bus.publish(BusEvent::MessageUpdated {
            message: user.clone(),
        });
        self.bus.publish(BusEvent::MessagePartUpdated { part: instruction });

        let mut summary = AssistantMessage::new(
            session.id.clone(),
            user.id().clone(),
            &spec.model_ref(),
            agent,
            system.clone(),
            path,
        );
        messages
            .put(&Message::Assistant(summary.clone()))
            .map_err(SessionError::from)?;
        self.bus.publish(BusEvent::MessageUpdated {
            message: Message::Assistant(summary.clone()),
        });

        let result = self
            .stream_summary(&session.id, &mut summary, provider, system, &parts, &messages, cancel)
            .await;

        match result {
            Ok(()) => {
                summary.summary = true;
                summary.finish();
                messages
                    .put(&Message::Assistant(summary.clone()))
                    .map_err(SessionError::from)?;
                self.bus.publish(BusEvent::MessageUpdated {
                    message: Message::Assistant(summary.clone()),
                });
                self.set_compacting(&sessions, &session.id, None);
                self.bus.publish(BusEvent::SessionCompacted {
                    session_id: session.id.clone(),
                    message_id: summary.id.clone(),
                });
                info!(message_id = %summary.id, "session compacted");
                Ok(summary)
            }
            Err(err) => {
                self.set_compacting(&sessions, &session.id, None);
                if err != SessionError::Aborted {
                    summary.error = Some(err.clone());
                    summary.finish();
                    if let Err(e) = messages.put(&Message::Assistant(summary.clone())) {
                        warn!(error = %e, "failed to record compaction error");
                    }
                    self.bus.publish(BusEvent::MessageUpdated {
                        message: Message::Assistant(summary),
                    });
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_summary(
        &self,
        session_id: &SessionId,
        summary: &mut AssistantMessage,
        provider: Arc<dyn LlmProvider>,
        system: Vec<String>,
        parts: &PartRepo,
        messages: &MessageRepo,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let request = prompt::build_request(&self.db, session_id, system, Vec::new())
            .map_err(SessionError::from)?;

        let stream_options = StreamOptions::default();
        let mut stream = tokio::select! {
            r = provider.stream(&request, &stream_options) => {
                r.map_err(|e| e.to_session_error())?
            }
            _ = cancel.cancelled() => return Err(SessionError::Aborted),
        };

        let mut text_part: Option<Part> = None;
        loop {
            let event = tokio::select! {
                e = stream.next() => e,
                _ = cancel.cancelled() => return Err(SessionError::Aborted),
            };
            let Some(event) = event else { break };
            match event {
                ProviderEvent::TextDelta { text } => {
                    let part = text_part.get_or_insert_with(|| {
                        Part::new(
                            summary.id.clone(),
                            session_id.clone(),
                            PartBody::Text {
                                text: String::new(),
                                synthetic: false,
                                time: Some(Timespan::started(now_millis())),
                            },
                        )
                    });
                    if let PartBody::Text { text: buffer, .. } = &mut part.body {
                        buffer.push_str(&text);
                    }
                    parts.put(part).map_err(SessionError::from)?;
                    self.bus.publish(BusEvent::MessagePartUpdated { part: part.clone() });
                }
                ProviderEvent::TextEnd => {
                    if let Some(part) = &mut text_part {
                        if let PartBody::Text { time: Some(time), .. } = &mut part.body {
                            time.finish();
                        }
                        parts.put(part).map_err(SessionError::from)?;
                        self.bus.publish(BusEvent::MessagePartUpdated { part: part.clone() });
                    }
                }
                ProviderEvent::StepFinish { usage, .. } => {
                    summary.tokens.add(&usage);
                    summary.cost += provider.spec().cost.cost_of(&usage);
                    messages
                        .put(&Message::Assistant(summary.clone()))
                        .map_err(SessionError::from)?;
                }
                ProviderEvent::Error { error } => return Err(error.to_session_error()),
                // Summaries carry no reasoning or tool traffic.
                _ => {}
            }
        }
        Ok(())
    }

    fn set_compacting(&self, sessions: &SessionRepo, session_id: &SessionId, at: Option<u64>) {
        match sessions.get(session_id) {
            Ok(mut session) => {
                session.time.compacting = at;
                session.touch();
                if let Err(e) = sessions.put(&session) {
                    warn!(error = %e, "failed to update compacting flag");
                    return;
                }
                self.bus.publish(BusEvent::SessionUpdated { session });
            }
            Err(e) => warn!(error = %e, "failed to load session for compacting flag"),
        }
    }
}
