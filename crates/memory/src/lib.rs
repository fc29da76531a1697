pub mod event_log;
pub mod retrieval;
pub mod schema;
pub mod store;

pub use event_log::ExperienceLog;
pub use retrieval::cosine_similarity;
pub use schema::{Experience, Issue, IssueType, MemoryEntry, Response};
pub use store::{Admission, EmbeddingCache, EmbeddingCacheStats, ExperienceMemory};
