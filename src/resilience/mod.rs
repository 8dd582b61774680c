pub mod classifier;
pub mod network;
pub mod retry;

pub use classifier::{classify, ErrorContext, ErrorHandler, ErrorKind};
pub use network::{Connectivity, NetworkHealth, NetworkMonitor, NetworkStats};
pub use retry::{is_network_error, NetworkRetryManager, RetryManager};
