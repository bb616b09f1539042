pub mod compressor;
pub mod config;
pub mod error;
pub mod llm;
pub mod manager;
pub mod scope;
pub mod session;
pub mod short_term;
pub mod token_counter;
pub mod types;

pub use compressor::{Compressor, Summary};
pub use config::{CompressionStrategy, MemoryConfig};
pub use error::MemoryError;
pub use llm::CompressionLlm;
pub use manager::{ActualTokens, MemoryManager, MemoryStats};
pub use scope::{MemoryScope, ScopedView};
pub use session::file_store::FileSessionStore;
#[cfg(feature = "sqlite")]
pub use session::sql_store::SqlSessionStore;
pub use session::{LoadedSession, SessionListEntry, SessionStats, SessionStore};
pub use short_term::ShortTermBuffer;
pub use token_counter::{BudgetStatus, NetSavings, TokenCounter};
pub use types::{Block, Content, FunctionCall, Message, Role, ToolCall, ToolUseView};
