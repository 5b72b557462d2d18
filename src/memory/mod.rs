//! 记忆层：检索（上下文片段）与持久化（消息 / 事实 / 配置）

pub mod retrieval;
pub mod store;

pub use retrieval::{KeywordVault, NoopRetrieval, Passage, RetrievalError, RetrievalProvider};
pub use store::{ChatRole, PersistenceStore, SqliteStore, StoreError, StoredMessage};
