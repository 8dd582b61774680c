pub mod driver;
pub mod session;
pub mod tabs;

// Re-export common types
pub use driver::{BrowserDriver, DriverError, DriverErrorKind};
pub use session::{BrowserLauncher, WebDriverLauncher, WebDriverSession};
pub use tabs::{TabPool, TabState, TabStats};
