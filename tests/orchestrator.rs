use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use chat_stream::agent::{ChunkSink, GenerationClient, GenerationRequest, GenerationResult, StreamChunk};
use chat_stream::db::{ConversationStore, InMemoryConversationStore};
use chat_stream::errors::AppError;
use chat_stream::events::ConversationEvent;
use chat_stream::models::{
    ChatRequest, Conversation, GenerationParams, GroundingMetadata, Message, MessageRole,
    NewMessage, TokenUsage,
};
use chat_stream::service::{ChatService, ChatSettings, TurnOutcome, TurnPhase};

const TITLE: &str = "Friendly greetings";

/// How the fake backend behaves on a streaming call.
#[derive(Clone, Default)]
struct Script {
    thinking: Vec<&'static str>,
    answer: Vec<&'static str>,
    usage: Option<TokenUsage>,
    /// Fail with this message after streaming the chunks above.
    fail: Option<&'static str>,
    /// Stream the chunks, then wait for cancellation.
    hang: bool,
    /// Keep reasoning out of the sink; it only comes back in the result.
    hold_thinking: bool,
    /// Keep the answer out of the sink; it only comes back in the result.
    hold_answer: bool,
}

struct ScriptedClient {
    script: Script,
    count: Option<u32>,
    credentials: bool,
    count_calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(script: Script) -> Self {
        Self { script, count: None, credentials: true, count_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    fn backend(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    fn has_credentials(&self) -> bool {
        self.credentials
    }

    async fn generate(
        &self,
        _request: GenerationRequest,
        on_chunk: Option<ChunkSink>,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, AppError> {
        let Some(sink) = on_chunk else {
            return Ok(GenerationResult { text: TITLE.to_string(), ..Default::default() });
        };

        if !self.script.hold_thinking {
            for t in &self.script.thinking {
                sink.send(StreamChunk::Thinking(t.to_string())).await?;
            }
        }
        if !self.script.hold_answer {
            for a in &self.script.answer {
                sink.send(StreamChunk::Answer(a.to_string())).await?;
            }
        }
        if self.script.hang {
            cancel.cancelled().await;
            return Err(AppError::Cancelled);
        }
        if let Some(message) = self.script.fail {
            return Err(AppError::generation(message));
        }

        let thinking = self.script.thinking.concat();
        Ok(GenerationResult {
            text: self.script.answer.concat(),
            thinking: (!thinking.is_empty()).then_some(thinking),
            usage: self.script.usage,
            grounding: None,
        })
    }

    async fn count_tokens(&self, _history: &[Message]) -> Result<u32, AppError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.count.ok_or_else(|| AppError::generation("countTokens unavailable"))
    }
}

/// In-memory store whose streamed appends start failing after a quota.
struct FlakyStore {
    inner: InMemoryConversationStore,
    appends_left: AtomicUsize,
}

impl FlakyStore {
    fn new(appends: usize) -> Self {
        Self { inner: InMemoryConversationStore::new(), appends_left: AtomicUsize::new(appends) }
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn create_conversation(&self, model: &str, title: Option<String>) -> Result<Conversation, AppError> {
        self.inner.create_conversation(model, title).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.inner.list_conversations().await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.inner.get_conversation(id).await
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.inner.messages(conversation_id).await
    }

    async fn add_message(&self, conversation_id: &str, message: NewMessage) -> Result<String, AppError> {
        self.inner.add_message(conversation_id, message).await
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
        append: bool,
        grounding: Option<GroundingMetadata>,
    ) -> Result<(), AppError> {
        if append && !delta.is_empty() {
            let left = self.appends_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(AppError::Unexpected("disk full".to_string()));
            }
            self.appends_left.store(left - 1, Ordering::SeqCst);
        }
        self.inner.update_message(conversation_id, message_id, delta, append, grounding).await
    }

    async fn set_token_count(&self, conversation_id: &str, usage: TokenUsage) -> Result<(), AppError> {
        self.inner.set_token_count(conversation_id, usage).await
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), AppError> {
        self.inner.set_title(conversation_id, title).await
    }

    async fn try_begin_title_generation(&self, conversation_id: &str) -> Result<bool, AppError> {
        self.inner.try_begin_title_generation(conversation_id).await
    }

    async fn end_title_generation(&self, conversation_id: &str) -> Result<(), AppError> {
        self.inner.end_title_generation(conversation_id).await
    }
}

struct Harness {
    service: ChatService,
    store: Arc<dyn ConversationStore>,
    client: Arc<ScriptedClient>,
    conversation_id: String,
}

async fn harness(client: ScriptedClient) -> Harness {
    harness_with(Arc::new(InMemoryConversationStore::new()), client).await
}

async fn harness_with(store: Arc<dyn ConversationStore>, client: ScriptedClient) -> Harness {
    let client = Arc::new(client);
    let service = ChatService::new(store.clone(), client.clone(), ChatSettings::default());
    let conversation = service.create_conversation(None).await.unwrap();
    Harness { service, store, client, conversation_id: conversation.id }
}

fn request(message: &str, speed_ms: u64, thinking: bool) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        files: Vec::new(),
        params: Some(GenerationParams {
            streaming_speed_ms: Some(speed_ms),
            thinking_enabled: thinking,
            ..GenerationParams::default()
        }),
    }
}

fn usage(total: u32) -> TokenUsage {
    TokenUsage { total, prompt: total / 2, completion: total - total / 2, thinking: None }
}

async fn messages(h: &Harness) -> Vec<Message> {
    h.store.messages(&h.conversation_id).await.unwrap()
}

fn content_of(messages: &[Message], role: MessageRole) -> Option<String> {
    messages.iter().rev().find(|m| m.role == role).map(|m| m.content.clone())
}

fn drain_events(rx: &mut broadcast::Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn answer_only_turn_reveals_full_text() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["Hi", " there"],
        usage: Some(usage(12)),
        ..Script::default()
    }))
    .await;

    let outcome = h.service.send(Some(&h.conversation_id), request("Hello", 10, false)).await.unwrap();

    assert!(matches!(&outcome, TurnOutcome::Completed { usage: Some(u), .. } if u.total == 12));
    assert!(outcome.error().is_none());
    let messages = messages(&h).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(content_of(&messages, MessageRole::Model).as_deref(), Some("Hi there"));
    assert!(content_of(&messages, MessageRole::Thinking).is_none());

    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.token_usage.map(|u| u.total), Some(12));
    assert!(!h.service.is_streaming(&h.conversation_id));
    assert_eq!(h.client.count_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn thinking_is_fully_revealed_before_answer() {
    let h = harness(ScriptedClient::new(Script {
        thinking: vec!["Let me ", "think"],
        answer: vec!["Answer."],
        usage: Some(usage(30)),
        ..Script::default()
    }))
    .await;
    let mut rx = h.service.subscribe();

    let outcome = h.service.send(Some(&h.conversation_id), request("Q?", 5, true)).await.unwrap();
    assert_eq!(outcome.status(), "completed");

    let events = drain_events(&mut rx);
    let thinking_id = events
        .iter()
        .find_map(|e| match e {
            ConversationEvent::MessageAdded { message_id, role: MessageRole::Thinking, .. } => {
                Some(message_id.clone())
            }
            _ => None,
        })
        .expect("thinking message announced");

    let deltas: Vec<(bool, &str)> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::MessageDelta { message_id, delta, .. } => {
                Some((*message_id == thinking_id, delta.as_str()))
            }
            _ => None,
        })
        .collect();
    let first_answer = deltas.iter().position(|(thinking, _)| !thinking).expect("answer deltas");
    assert!(deltas[..first_answer].iter().all(|(thinking, _)| *thinking));
    assert!(deltas[first_answer..].iter().all(|(thinking, _)| !thinking));
    assert_eq!(first_answer, "Let me think".len());

    let phases: Vec<TurnPhase> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::PhaseChanged { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            TurnPhase::StreamingThinking,
            TurnPhase::StreamingAnswer,
            TurnPhase::Reconciling,
            TurnPhase::Idle
        ]
    );

    let messages = messages(&h).await;
    assert_eq!(content_of(&messages, MessageRole::Thinking).as_deref(), Some("Let me think"));
    assert_eq!(content_of(&messages, MessageRole::Model).as_deref(), Some("Answer."));
}

#[tokio::test(start_paused = true)]
async fn abort_keeps_revealed_prefix_only() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["abcdefghij"],
        usage: Some(usage(5)),
        ..Script::default()
    }))
    .await;

    let service = h.service.clone();
    let conversation_id = h.conversation_id.clone();
    let turn = tokio::spawn(async move {
        service.send(Some(&conversation_id), request("go", 10, false)).await
    });

    // Ticks land at 0, 10 and 20 ms.
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(h.service.is_streaming(&h.conversation_id));
    assert!(h.service.abort(&h.conversation_id));
    assert!(!h.service.is_streaming(&h.conversation_id));

    let outcome = turn.await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::Aborted { .. }));
    assert!(outcome.error().is_none());

    let stored = messages(&h).await;
    assert_eq!(content_of(&stored, MessageRole::Model).as_deref(), Some("abc"));
    // Reconciliation is skipped for aborted turns.
    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert!(conversation.token_usage.is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(content_of(&messages(&h).await, MessageRole::Model).as_deref(), Some("abc"));
}

#[tokio::test(start_paused = true)]
async fn abort_is_idempotent() {
    let h = harness(ScriptedClient::new(Script { hang: true, ..Script::default() })).await;
    assert!(!h.service.abort(&h.conversation_id));

    let service = h.service.clone();
    let conversation_id = h.conversation_id.clone();
    let turn = tokio::spawn(async move {
        service.send(Some(&conversation_id), request("wait", 10, false)).await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(h.service.abort(&h.conversation_id));
    assert!(!h.service.abort(&h.conversation_id));
    assert!(matches!(turn.await.unwrap().unwrap(), TurnOutcome::Aborted { .. }));
    assert!(!h.service.abort(&h.conversation_id));
}

#[tokio::test(start_paused = true)]
async fn missing_usage_with_failed_count_still_completes() {
    let h = harness(ScriptedClient::new(Script { answer: vec!["ok"], ..Script::default() })).await;

    let outcome = h.service.send(Some(&h.conversation_id), request("one", 5, false)).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { usage: None, .. }));
    assert_eq!(h.client.count_calls.load(Ordering::SeqCst), 1);
    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert!(conversation.token_usage.is_none());
    assert!(!h.service.is_streaming(&h.conversation_id));

    let next = h.service.send(Some(&h.conversation_id), request("two", 5, false)).await.unwrap();
    assert_eq!(next.status(), "completed");
}

#[tokio::test(start_paused = true)]
async fn missing_usage_falls_back_to_token_count() {
    let mut client = ScriptedClient::new(Script { answer: vec!["ok"], ..Script::default() });
    client.count = Some(42);
    let h = harness(client).await;

    let outcome = h.service.send(Some(&h.conversation_id), request("one", 5, false)).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { usage: Some(u), .. } if u == TokenUsage::total_only(42)));
    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.token_usage, Some(TokenUsage::total_only(42)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_send_is_refused_while_streaming() {
    let h = harness(ScriptedClient::new(Script { answer: vec!["partial"], hang: true, ..Script::default() })).await;

    let service = h.service.clone();
    let conversation_id = h.conversation_id.clone();
    let turn = tokio::spawn(async move {
        service.send(Some(&conversation_id), request("first", 10, false)).await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(h.service.is_streaming(&h.conversation_id));

    let before = messages(&h).await.len();
    let second = h.service.send(Some(&h.conversation_id), request("second", 10, false)).await.unwrap();
    assert_eq!(second, TurnOutcome::Busy);
    assert_eq!(messages(&h).await.len(), before);

    h.service.abort(&h.conversation_id);
    assert!(matches!(turn.await.unwrap().unwrap(), TurnOutcome::Aborted { .. }));
}

#[tokio::test(start_paused = true)]
async fn reveal_takes_at_least_one_period_per_character() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["Hi there"],
        usage: Some(usage(3)),
        ..Script::default()
    }))
    .await;

    let started = Instant::now();
    h.service.send(Some(&h.conversation_id), request("time me", 10, false)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test(start_paused = true)]
async fn every_streamed_character_is_revealed_exactly_once() {
    let h = harness(ScriptedClient::new(Script {
        thinking: vec!["a", "bc", "", "d"],
        answer: vec!["Hel", "lo ", "wör", "ld"],
        usage: Some(usage(9)),
        ..Script::default()
    }))
    .await;
    let mut rx = h.service.subscribe();

    h.service.send(Some(&h.conversation_id), request("stream", 5, true)).await.unwrap();

    let revealed: String = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ConversationEvent::MessageDelta { delta, .. } => Some(delta),
            _ => None,
        })
        .collect();
    assert_eq!(revealed, "abcdHello wörld");

    let messages = messages(&h).await;
    assert_eq!(content_of(&messages, MessageRole::Thinking).as_deref(), Some("abcd"));
    assert_eq!(content_of(&messages, MessageRole::Model).as_deref(), Some("Hello wörld"));
}

#[tokio::test(start_paused = true)]
async fn preconditions_reject_without_touching_state() {
    let h = harness(ScriptedClient::new(Script { answer: vec!["x"], ..Script::default() })).await;

    let err = h.service.send(None, request("hi", 5, false)).await.unwrap_err();
    assert!(matches!(err, AppError::NoActiveConversation));
    let err = h.service.send(Some(&h.conversation_id), request("   ", 5, false)).await.unwrap_err();
    assert!(err.is_validation());
    let err = h.service.send(Some("missing"), request("hi", 5, false)).await.unwrap_err();
    assert!(matches!(err, AppError::ConversationNotFound { .. }));
    assert!(messages(&h).await.is_empty());

    let mut client = ScriptedClient::new(Script::default());
    client.credentials = false;
    let h = harness(client).await;
    let err = h.service.send(Some(&h.conversation_id), request("hi", 5, false)).await.unwrap_err();
    assert!(matches!(err, AppError::MissingCredentials { .. }));
    assert!(err.is_precondition());
    assert!(messages(&h).await.is_empty());
    assert!(!h.service.is_streaming(&h.conversation_id));
}

#[tokio::test(start_paused = true)]
async fn failure_keeps_partial_content_and_reports_error() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["par"],
        fail: Some("stream reset"),
        ..Script::default()
    }))
    .await;
    let mut rx = h.service.subscribe();

    let outcome = h.service.send(Some(&h.conversation_id), request("go", 5, false)).await.unwrap();
    assert_eq!(outcome.status(), "failed");
    assert!(outcome.error().unwrap().contains("stream reset"));
    assert_eq!(content_of(&messages(&h).await, MessageRole::Model).as_deref(), Some("par"));
    assert!(!h.service.is_streaming(&h.conversation_id));

    let finished = drain_events(&mut rx).into_iter().find_map(|e| match e {
        ConversationEvent::TurnFinished { status, error, .. } => Some((status, error)),
        _ => None,
    });
    assert!(matches!(finished, Some(("failed", Some(_)))));
}

#[tokio::test(start_paused = true)]
async fn title_is_generated_once_conversation_has_substance() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["Hey!"],
        usage: Some(usage(4)),
        ..Script::default()
    }))
    .await;

    h.service.send(Some(&h.conversation_id), request("Hello", 5, false)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.service.get_conversation(&h.conversation_id).await.unwrap().title.is_none());

    h.service.send(Some(&h.conversation_id), request("How are you?", 5, false)).await.unwrap();
    let mut title = None;
    for _ in 0..100 {
        let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
        if conversation.title.is_some() {
            assert!(!conversation.title_generation_in_flight);
            title = conversation.title;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(title.as_deref(), Some(TITLE));
}

#[tokio::test(start_paused = true)]
async fn wait_until_idle_resolves_after_drain() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["done"],
        usage: Some(usage(2)),
        ..Script::default()
    }))
    .await;

    let service = h.service.clone();
    let conversation_id = h.conversation_id.clone();
    let turn = tokio::spawn(async move {
        service.send(Some(&conversation_id), request("go", 10, false)).await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(h.service.phase(&h.conversation_id).is_some());

    h.service.wait_until_idle(&h.conversation_id).await;
    assert!(!h.service.is_streaming(&h.conversation_id));
    assert_eq!(content_of(&messages(&h).await, MessageRole::Model).as_deref(), Some("done"));
    assert_eq!(turn.await.unwrap().unwrap().status(), "completed");
}

#[tokio::test(start_paused = true)]
async fn dropped_caller_does_not_wedge_conversation() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["abcdefghij"],
        usage: Some(usage(5)),
        ..Script::default()
    }))
    .await;

    let service = h.service.clone();
    let conversation_id = h.conversation_id.clone();
    let caller = tokio::spawn(async move {
        service.send(Some(&conversation_id), request("go", 10, false)).await
    });
    tokio::time::sleep(Duration::from_millis(25)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!h.service.is_streaming(&h.conversation_id));
    assert_eq!(content_of(&messages(&h).await, MessageRole::Model).as_deref(), Some("abcdefghij"));
    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.token_usage.map(|u| u.total), Some(5));

    let next = h.service.send(Some(&h.conversation_id), request("again", 5, false)).await.unwrap();
    assert_eq!(next.status(), "completed");
}

#[tokio::test(start_paused = true)]
async fn storage_failure_stops_reveal_and_fails_turn() {
    let client = ScriptedClient::new(Script {
        answer: vec!["abcdefghij"],
        usage: Some(usage(5)),
        ..Script::default()
    });
    let h = harness_with(Arc::new(FlakyStore::new(4)), client).await;
    let mut rx = h.service.subscribe();

    let outcome = h.service.send(Some(&h.conversation_id), request("go", 5, false)).await.unwrap();

    assert_eq!(outcome.status(), "failed");
    assert!(outcome.error().unwrap().contains("disk full"));
    assert_eq!(content_of(&messages(&h).await, MessageRole::Model).as_deref(), Some("abcd"));
    assert!(!h.service.is_streaming(&h.conversation_id));
    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert!(conversation.token_usage.is_none());

    let deltas = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ConversationEvent::MessageDelta { .. }))
        .count();
    assert_eq!(deltas, 4);
}

#[tokio::test(start_paused = true)]
async fn one_piece_answer_goes_through_the_reveal() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["Hi there"],
        usage: Some(usage(6)),
        hold_answer: true,
        ..Script::default()
    }))
    .await;
    let mut rx = h.service.subscribe();

    let started = Instant::now();
    let outcome = h.service.send(Some(&h.conversation_id), request("go", 10, false)).await.unwrap();
    assert_eq!(outcome.status(), "completed");
    assert!(started.elapsed() >= Duration::from_millis(70));

    let stored = messages(&h).await;
    assert_eq!(stored.len(), 2);
    assert_eq!(content_of(&stored, MessageRole::Model).as_deref(), Some("Hi there"));
    assert!(content_of(&stored, MessageRole::Thinking).is_none());

    let deltas = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ConversationEvent::MessageDelta { .. }))
        .count();
    assert_eq!(deltas, "Hi there".len());
}

#[tokio::test(start_paused = true)]
async fn streamed_thinking_is_not_repeated_by_one_piece_answer() {
    let h = harness(ScriptedClient::new(Script {
        thinking: vec!["Analy", "zing"],
        answer: vec!["42"],
        usage: Some(usage(6)),
        hold_answer: true,
        ..Script::default()
    }))
    .await;

    h.service.send(Some(&h.conversation_id), request("go", 5, true)).await.unwrap();

    let stored = messages(&h).await;
    assert_eq!(content_of(&stored, MessageRole::Thinking).as_deref(), Some("Analyzing"));
    assert_eq!(content_of(&stored, MessageRole::Model).as_deref(), Some("42"));
}

#[tokio::test(start_paused = true)]
async fn unstreamed_thinking_still_precedes_streamed_answer() {
    let h = harness(ScriptedClient::new(Script {
        thinking: vec!["Analyzing"],
        answer: vec!["4", "2"],
        usage: Some(usage(6)),
        hold_thinking: true,
        ..Script::default()
    }))
    .await;
    let mut rx = h.service.subscribe();

    h.service.send(Some(&h.conversation_id), request("go", 5, true)).await.unwrap();

    let revealed: String = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ConversationEvent::MessageDelta { delta, .. } => Some(delta),
            _ => None,
        })
        .collect();
    assert_eq!(revealed, "Analyzing42");
    let stored = messages(&h).await;
    assert_eq!(content_of(&stored, MessageRole::Thinking).as_deref(), Some("Analyzing"));
    assert_eq!(content_of(&stored, MessageRole::Model).as_deref(), Some("42"));
}

#[tokio::test(start_paused = true)]
async fn thinking_without_summaries_leaves_no_placeholder() {
    let h = harness(ScriptedClient::new(Script {
        answer: vec!["Sure"],
        usage: Some(usage(3)),
        ..Script::default()
    }))
    .await;

    let mut req = request("go", 5, true);
    if let Some(params) = req.params.as_mut() {
        params.include_summaries = false;
    }
    let outcome = h.service.send(Some(&h.conversation_id), req).await.unwrap();

    assert_eq!(outcome.status(), "completed");
    let stored = messages(&h).await;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|m| m.role != MessageRole::Thinking));
    assert_eq!(content_of(&stored, MessageRole::Model).as_deref(), Some("Sure"));
}

#[tokio::test]
async fn new_conversation_takes_the_backend_model() {
    let h = harness(ScriptedClient::new(Script::default())).await;
    let conversation = h.service.get_conversation(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.model, "scripted-1");
    assert!(conversation.title.is_none());
}
