// Markdown image synchronizer: uploads local images referenced from
// Markdown documents and rewrites the links to their public URLs.
pub mod aggregator;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod conflict;
pub mod dispatcher;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod scanner;
pub mod stats;
pub mod storage;
pub mod task;

pub use cache::{CacheEntry, ContentCache};
pub use cancel::CancelToken;
pub use config::{ProviderConfig, SyncConfig};
pub use conflict::ConflictPolicy;
pub use error::{PipelineError, StorageError, TaskError};
pub use hash::ContentHash;
pub use pipeline::Pipeline;
pub use scanner::Source;
pub use stats::RunStatistics;
pub use storage::{create_provider, LocalProvider, MemoryProvider, StorageProvider};
