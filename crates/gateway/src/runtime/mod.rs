//! The chat turn runtime: the frame producer behind the SSE endpoint and
//! the per-session input lock.

pub mod lock;
pub mod turn;

pub use turn::{run_chat_turn, ChatFrame, ChatRequest, FileRef, UserMessage};
