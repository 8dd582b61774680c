pub mod batch;
pub mod controller;
pub mod extractor;
pub mod listing;
pub mod task;
pub mod worker_pool;

// Re-export common types
pub use batch::{BatchConfig, BatchMetrics, BatchProcessor, MatchProcessor, MetricsSummary, TabBoundHandler};
pub use controller::{MatchSource, RunReport, ScrapeController};
pub use extractor::PageExtractor;
pub use listing::{MatchDay, MatchLister};
pub use task::{WorkerResult, WorkerTask};
pub use worker_pool::{PoolStats, TaskHandler, WorkerPool, WorkerStatus};
