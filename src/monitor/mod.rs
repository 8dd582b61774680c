pub mod performance;
pub mod resources;

pub use performance::{MemorySummary, PerformanceMonitor};
pub use resources::{ResourceManager, ResourceSummary};
