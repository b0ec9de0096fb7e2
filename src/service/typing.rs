//! Fixed-period consumer that reveals buffered text one character per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::stream_buffer::{StreamBuffer, TickAction};
use super::turns::{PhaseReporter, TurnPhase};
use crate::agent::StreamChunk;
use crate::db::ConversationStore;
use crate::errors::AppError;
use crate::events::{ConversationEvent, EventBus};

/// What the scheduler committed before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub thinking_chars: usize,
    pub answer_chars: usize,
    pub cancelled: bool,
    /// Set when a character could not be stored; the reveal stopped there.
    pub error: Option<String>,
}

pub struct TypingScheduler {
    pub store: Arc<dyn ConversationStore>,
    pub events: EventBus,
    pub phase: PhaseReporter,
    pub conversation_id: String,
    pub thinking_message_id: Option<String>,
    pub model_message_id: String,
    pub period: Duration,
}

impl TypingScheduler {
    /// Runs until the buffer is drained after the producer closes `chunks`,
    /// or until `cancel` fires.
    pub fn spawn(
        self,
        chunks: mpsc::Receiver<StreamChunk>,
        cancel: CancellationToken,
    ) -> JoinHandle<DrainReport> {
        tokio::spawn(self.run(chunks, cancel))
    }

    async fn run(
        self,
        mut chunks: mpsc::Receiver<StreamChunk>,
        cancel: CancellationToken,
    ) -> DrainReport {
        let mut buffer = StreamBuffer::new(self.thinking_message_id.is_some());
        let mut report = DrainReport::default();
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    buffer.clear();
                    report.cancelled = true;
                    break;
                }
                chunk = chunks.recv(), if !buffer.network_done() => match chunk {
                    Some(chunk) => buffer.push(chunk),
                    None => {
                        debug!(conversation_id = %self.conversation_id, "network done");
                        buffer.mark_network_done();
                    }
                },
                _ = ticker.tick() => {
                    let action = buffer.tick();
                    // Cancellation may land between the select and the write.
                    if cancel.is_cancelled() {
                        buffer.clear();
                        report.cancelled = true;
                        break;
                    }
                    let written = match action {
                        TickAction::Thinking(c) => match &self.thinking_message_id {
                            Some(id) => {
                                self.phase.set(TurnPhase::StreamingThinking);
                                self.append(id, c).await.map(|()| report.thinking_chars += 1)
                            }
                            None => Ok(()),
                        },
                        TickAction::ThinkingLatched => {
                            debug!(conversation_id = %self.conversation_id, "thinking phase latched");
                            Ok(())
                        }
                        TickAction::Answer(c) => {
                            self.phase.set(TurnPhase::StreamingAnswer);
                            self.append(&self.model_message_id, c)
                                .await
                                .map(|()| report.answer_chars += 1)
                        }
                        TickAction::Finished => break,
                        TickAction::Wait => Ok(()),
                    };
                    // A character that could not be stored ends the reveal.
                    if let Err(e) = written {
                        error!("Stopping reveal for conversation {}: {e}", self.conversation_id);
                        buffer.clear();
                        report.error = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        info!(
            conversation_id = %self.conversation_id,
            thinking_chars = report.thinking_chars,
            answer_chars = report.answer_chars,
            cancelled = report.cancelled,
            "typing scheduler stopped"
        );
        report
    }

    async fn append(&self, message_id: &str, c: char) -> Result<(), AppError> {
        let mut utf8 = [0u8; 4];
        let delta: &str = c.encode_utf8(&mut utf8);
        self.store
            .update_message(&self.conversation_id, message_id, delta, true, None)
            .await?;
        self.events.publish(ConversationEvent::MessageDelta {
            conversation_id: self.conversation_id.clone(),
            message_id: message_id.to_string(),
            delta: delta.to_string(),
        });
        Ok(())
    }
}
