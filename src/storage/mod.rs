pub mod results;
pub mod session;

// Re-export common types
pub use results::{ResultFile, ResultStore};
pub use session::{JsonSessionStore, MatchStatus, SessionManager, SessionState, SessionStore, SessionSummary};
