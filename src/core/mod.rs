//! Core orchestration: persistence gateway, conversation service, and the
//! presentation state projector.

mod projector;
mod service;
mod store;

pub use projector::{ChatState, ConversationItem, StateProjector};
pub use service::{ChangeEvent, ChatError, ChatService};
pub use store::ChatStore;
