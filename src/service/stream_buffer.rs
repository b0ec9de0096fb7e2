//! Two-queue buffer between the network producer and the typing scheduler.
//!
//! Every [`StreamBuffer::tick`] performs exactly one action. Reasoning text
//! drains first; the answer queue is only touched once the reasoning phase
//! has latched, which requires the network to be done and the reasoning
//! queue to be empty.

use std::collections::VecDeque;

use crate::agent::StreamChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    DrainingThinking,
    DrainingAnswer,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Append one character to the thinking message.
    Thinking(char),
    /// The reasoning phase just ended; answer text may flow from now on.
    ThinkingLatched,
    /// Append one character to the model message.
    Answer(char),
    /// Both queues drained after the network finished.
    Finished,
    /// Nothing to reveal yet.
    Wait,
}

#[derive(Debug)]
pub struct StreamBuffer {
    pending_thinking: VecDeque<char>,
    pending_answer: VecDeque<char>,
    network_done: bool,
    has_thinking_message: bool,
    state: DrainState,
}

impl StreamBuffer {
    pub fn new(has_thinking_message: bool) -> Self {
        Self {
            pending_thinking: VecDeque::new(),
            pending_answer: VecDeque::new(),
            network_done: false,
            has_thinking_message,
            state: if has_thinking_message {
                DrainState::DrainingThinking
            } else {
                DrainState::DrainingAnswer
            },
        }
    }

    /// Reasoning text is dropped when the turn has no thinking message to
    /// hold it.
    pub fn push(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Thinking(text) if self.has_thinking_message => {
                self.pending_thinking.extend(text.chars())
            }
            StreamChunk::Thinking(_) => {}
            StreamChunk::Answer(text) => self.pending_answer.extend(text.chars()),
        }
    }

    pub fn mark_network_done(&mut self) {
        self.network_done = true;
    }

    pub fn network_done(&self) -> bool {
        self.network_done
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.pending_thinking.len(), self.pending_answer.len())
    }

    pub fn tick(&mut self) -> TickAction {
        match self.state {
            DrainState::DrainingThinking => {
                if let Some(c) = self.pending_thinking.pop_front() {
                    TickAction::Thinking(c)
                } else if self.network_done {
                    self.state = DrainState::DrainingAnswer;
                    TickAction::ThinkingLatched
                } else {
                    TickAction::Wait
                }
            }
            DrainState::DrainingAnswer => {
                if let Some(c) = self.pending_answer.pop_front() {
                    TickAction::Answer(c)
                } else if self.network_done {
                    self.state = DrainState::Done;
                    TickAction::Finished
                } else {
                    TickAction::Wait
                }
            }
            DrainState::Done => TickAction::Finished,
        }
    }

    /// Drops everything still queued.
    pub fn clear(&mut self) {
        self.pending_thinking.clear();
        self.pending_answer.clear();
    }
}
