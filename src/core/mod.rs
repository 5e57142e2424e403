//! 核心层：会话、编排与应用上下文

pub mod context;
pub mod orchestrator;
pub mod session;

pub use context::AppContext;
pub use orchestrator::{ChatRequest, ChatResponse, Orchestrator, OrchestratorConfig};
pub use session::{ChatMessage, ConversationState, Role, SessionContext, SessionManager};
