pub mod conversation;
pub mod registry;

pub use conversation::SqliteConversationStore;
pub use registry::{AgentRegistry, AgentStore};
