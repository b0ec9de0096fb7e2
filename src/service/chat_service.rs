use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use super::title::TitleService;
use super::turns::{TurnPhase, TurnSlots, TurnTicket};
use super::typing::TypingScheduler;
use super::usage::UsageReconciler;
use crate::agent::{ChunkSink, GenerationClient, GenerationRequest, GenerationResult, StreamChunk};
use crate::db::ConversationStore;
use crate::errors::AppError;
use crate::events::{ConversationEvent, EventBus};
use crate::models::{
    ChatRequest, Conversation, GenerationParams, Message, MessageRole, NewMessage, TokenUsage,
};

const MAX_MESSAGE_LENGTH: usize = 8000;
const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// How a send ended. Only `Failed` carries an error for the caller; an
/// aborted turn is a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { turn_id: String, usage: Option<TokenUsage> },
    Aborted { turn_id: String },
    Failed { turn_id: String, message: String },
    /// Another turn was streaming; nothing happened.
    Busy,
}

impl TurnOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            TurnOutcome::Completed { .. } => "completed",
            TurnOutcome::Aborted { .. } => "aborted",
            TurnOutcome::Failed { .. } => "failed",
            TurnOutcome::Busy => "busy",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TurnOutcome::Failed { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn turn_id(&self) -> Option<&str> {
        match self {
            TurnOutcome::Completed { turn_id, .. }
            | TurnOutcome::Aborted { turn_id }
            | TurnOutcome::Failed { turn_id, .. } => Some(turn_id),
            TurnOutcome::Busy => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatSettings {
    pub system_instruction: Option<String>,
    pub default_params: GenerationParams,
}

struct PreparedTurn {
    thinking_message_id: Option<String>,
    model_message_id: String,
    history: Vec<Message>,
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn GenerationClient>,
    turns: TurnSlots,
    events: EventBus,
    usage: UsageReconciler,
    titles: Arc<TitleService>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn GenerationClient>,
        settings: ChatSettings,
    ) -> Self {
        let events = EventBus::new();
        Self {
            turns: TurnSlots::new(events.clone()),
            usage: UsageReconciler::new(store.clone(), client.clone(), events.clone()),
            titles: Arc::new(TitleService::new(store.clone(), client.clone(), events.clone())),
            store,
            client,
            events,
            settings,
        }
    }

    pub async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, AppError> {
        let title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self.store.create_conversation(self.client.model(), title).await
    }

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.store.list_conversations().await
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, AppError> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.get_conversation(conversation_id).await.map(|c| c.messages)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.turns.is_active(conversation_id)
    }

    pub fn phase(&self, conversation_id: &str) -> Option<watch::Receiver<TurnPhase>> {
        self.turns.phase(conversation_id)
    }

    /// Resolves once the conversation has no turn in flight.
    pub async fn wait_until_idle(&self, conversation_id: &str) {
        if let Some(mut phase) = self.turns.phase(conversation_id) {
            let _ = phase.wait_for(|p| *p == TurnPhase::Idle).await;
        }
    }

    /// Stops the in-flight turn, if any. Content already revealed stays.
    pub fn abort(&self, conversation_id: &str) -> bool {
        self.turns.cancel(conversation_id)
    }

    /// Runs one turn to the end: network, paced reveal, usage. Precondition
    /// failures are returned as errors before anything is written.
    pub async fn send(
        &self,
        conversation_id: Option<&str>,
        request: ChatRequest,
    ) -> Result<TurnOutcome, AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        let conversation_id = conversation_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(AppError::NoActiveConversation)?;
        if !self.client.has_credentials() {
            return Err(AppError::MissingCredentials { backend: self.client.backend().to_string() });
        }
        if request.message.trim().is_empty() && request.files.is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if request.message.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: request.message.len(),
            });
        }
        self.get_conversation(conversation_id).await?;

        let Some(ticket) = self.turns.try_acquire(conversation_id) else {
            info!(conversation_id, "send ignored: a turn is already streaming");
            return Ok(TurnOutcome::Busy);
        };
        let turn_id = ticket.turn_id.clone();
        info!(conversation_id, turn_id = %turn_id, "turn started");

        // The turn runs detached so it still releases its slot, reconciles and
        // reports when the caller stops waiting.
        let service = self.clone();
        let owned_id = conversation_id.to_string();
        let turn = tokio::spawn(async move { service.drive_turn(&owned_id, ticket, request).await });
        match turn.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.turns.release(conversation_id, &turn_id);
                Err(AppError::Unexpected(format!("turn task failed: {e}")))
            }
        }
    }

    async fn drive_turn(
        &self,
        conversation_id: &str,
        ticket: TurnTicket,
        request: ChatRequest,
    ) -> TurnOutcome {
        let turn_id = ticket.turn_id.clone();
        let outcome = self.run_turn(conversation_id, &ticket, request).await;
        self.turns.release(conversation_id, &turn_id);

        let outcome = outcome.unwrap_or_else(|e| {
            error!("Turn {turn_id} in conversation {conversation_id} failed: {e}");
            TurnOutcome::Failed { turn_id: turn_id.clone(), message: e.to_string() }
        });
        self.events.publish(ConversationEvent::TurnFinished {
            conversation_id: conversation_id.to_string(),
            turn_id,
            status: outcome.status(),
            error: outcome.error().map(str::to_string),
        });
        outcome
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        ticket: &TurnTicket,
        request: ChatRequest,
    ) -> Result<TurnOutcome, AppError> {
        let turn_id = ticket.turn_id.clone();
        let params = request
            .params
            .clone()
            .unwrap_or_else(|| self.settings.default_params.clone())
            .normalized();

        let prepared = self.prepare(conversation_id, &turn_id, &request, &params).await?;

        // ── Producer/consumer wiring ──────────────────────────────────────────
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let sink = ChunkSink::new(tx);
        let scheduler = TypingScheduler {
            store: self.store.clone(),
            events: self.events.clone(),
            phase: ticket.phase.clone(),
            conversation_id: conversation_id.to_string(),
            thinking_message_id: prepared.thinking_message_id.clone(),
            model_message_id: prepared.model_message_id.clone(),
            period: params.tick_period(),
        }
        .spawn(rx, ticket.cancel.clone());

        let generation = self
            .client
            .generate(
                GenerationRequest {
                    history: prepared.history.clone(),
                    system_instruction: self.settings.system_instruction.clone(),
                    params,
                    files: request.files,
                },
                Some(sink.clone()),
                ticket.cancel.child_token(),
            )
            .await;

        // A backend that answered in one piece still goes through the buffer.
        if let Ok(result) = &generation {
            match Self::feed_unstreamed(&sink, result).await {
                Err(e) if !e.is_cancelled() => warn!("Could not buffer final result: {e}"),
                _ => {}
            }
        }
        drop(sink);

        let report = scheduler
            .await
            .map_err(|e| AppError::Unexpected(format!("typing scheduler panicked: {e}")))?;

        if let Some(message) = report.error {
            error!("Reveal failed for conversation {conversation_id}: {message}");
            return Ok(TurnOutcome::Failed { turn_id, message });
        }

        let aborted = report.cancelled
            || ticket.cancel.is_cancelled()
            || matches!(&generation, Err(e) if e.is_cancelled());
        if aborted {
            info!(conversation_id, turn_id = %turn_id, "turn aborted");
            return Ok(TurnOutcome::Aborted { turn_id });
        }

        let result = match generation {
            Ok(result) => result,
            Err(e) => {
                error!("Generation failed for conversation {conversation_id}: {e}");
                return Ok(TurnOutcome::Failed { turn_id, message: e.to_string() });
            }
        };

        // ── Reconciliation ────────────────────────────────────────────────────
        ticket.phase.set(TurnPhase::Reconciling);
        if let Some(grounding) = result.grounding.clone() {
            if let Err(e) = self
                .store
                .update_message(conversation_id, &prepared.model_message_id, "", true, Some(grounding))
                .await
            {
                warn!("Failed to attach grounding metadata: {e}");
            }
        }

        let mut counted = prepared.history;
        counted.push(Message::new(
            conversation_id.to_string(),
            NewMessage {
                role: MessageRole::Model,
                content: result.text.clone(),
                turn_id: turn_id.clone(),
                files: Vec::new(),
            },
        ));
        let usage = self.usage.reconcile(conversation_id, &result, &counted).await;

        // User + model message; thinking messages do not count toward titles.
        self.titles.spawn(conversation_id.to_string(), 2);

        info!(conversation_id, turn_id = %turn_id, "turn completed");
        Ok(TurnOutcome::Completed { turn_id, usage })
    }

    async fn prepare(
        &self,
        conversation_id: &str,
        turn_id: &str,
        request: &ChatRequest,
        params: &GenerationParams,
    ) -> Result<PreparedTurn, AppError> {
        self.add_message(
            conversation_id,
            NewMessage {
                role: MessageRole::User,
                content: request.message.clone(),
                turn_id: turn_id.to_string(),
                files: request.files.clone(),
            },
        )
        .await?;

        let history: Vec<Message> = self
            .store
            .messages(conversation_id)
            .await?
            .into_iter()
            .filter(|m| m.role != MessageRole::Thinking)
            .collect();

        // Without summaries no reasoning text is sent, so there is nothing to hold.
        let thinking_message_id = if params.thinking_enabled && params.include_summaries {
            Some(
                self.add_message(conversation_id, NewMessage::empty(MessageRole::Thinking, turn_id))
                    .await?,
            )
        } else {
            None
        };
        let model_message_id = self
            .add_message(conversation_id, NewMessage::empty(MessageRole::Model, turn_id))
            .await?;

        Ok(PreparedTurn { thinking_message_id, model_message_id, history })
    }

    async fn add_message(&self, conversation_id: &str, message: NewMessage) -> Result<String, AppError> {
        let role = message.role;
        let turn_id = message.turn_id.clone();
        let content = message.content.clone();
        let message_id = self.store.add_message(conversation_id, message).await?;
        self.events.publish(ConversationEvent::MessageAdded {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
            turn_id,
            role,
            content,
        });
        Ok(message_id)
    }

    async fn feed_unstreamed(sink: &ChunkSink, result: &GenerationResult) -> Result<(), AppError> {
        if !sink.delivered_thinking() {
            if let Some(thinking) = result.thinking.as_ref().filter(|t| !t.is_empty()) {
                sink.send(StreamChunk::Thinking(thinking.clone())).await?;
            }
        }
        if !sink.delivered_answer() && !result.text.is_empty() {
            sink.send(StreamChunk::Answer(result.text.clone())).await?;
        }
        Ok(())
    }
}
