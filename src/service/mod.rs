pub mod chat_service;
pub mod stream_buffer;
pub mod title;
pub mod turns;
pub mod typing;
pub mod usage;

pub use chat_service::{ChatService, ChatSettings, TurnOutcome};
pub use turns::TurnPhase;
