use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Coarse category of a driver failure, assigned where the raw error is translated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// Page load, script or wait deadline exceeded
    Timeout,
    /// Element lookup returned nothing
    NoSuchElement,
    /// Element exists but cannot be used
    NotInteractable,
    /// Transport to the browser or the site failed
    Connection,
    /// Any other failure reported by the webdriver protocol
    WebDriver,
    /// The page that loaded is not the one that was requested
    UrlMismatch,
    /// The page loaded but did not carry the expected content
    ContentMismatch,
    /// Anything else
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::NoSuchElement => "no such element",
            DriverErrorKind::NotInteractable => "not interactable",
            DriverErrorKind::Connection => "connection",
            DriverErrorKind::WebDriver => "webdriver",
            DriverErrorKind::UrlMismatch => "url mismatch",
            DriverErrorKind::ContentMismatch => "content mismatch",
            DriverErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Structured failure from the browser capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn webdriver(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::WebDriver, message)
    }

    /// Infer the kind from a raw driver message.
    ///
    /// Used at the boundary where third-party errors only expose text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let kind = if lower.contains("no such element") || lower.contains("unable to locate element") {
            DriverErrorKind::NoSuchElement
        } else if lower.contains("not interactable") {
            DriverErrorKind::NotInteractable
        } else if lower.contains("timeout") || lower.contains("timed out") {
            DriverErrorKind::Timeout
        } else if lower.contains("error sending request")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("broken pipe")
        {
            DriverErrorKind::Connection
        } else {
            DriverErrorKind::WebDriver
        };

        Self { kind, message }
    }

    /// First line of the message, for compact log output
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// The subset of a browser automation session the scraper relies on.
///
/// A single session is shared by every worker. Callers serialize access
/// through the tab pool's switch gate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a new blank tab
    async fn open_tab(&self) -> Result<(), DriverError>;

    /// Handles of every open tab, in opening order
    async fn window_handles(&self) -> Result<Vec<String>, DriverError>;

    /// Focus the tab with the given handle
    async fn switch_to(&self, handle: &str) -> Result<(), DriverError>;

    /// Navigate the focused tab
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Run a script in the focused tab and return its JSON result
    async fn execute_script(&self, script: &str) -> Result<Value, DriverError>;

    /// Close the focused tab
    async fn close_current(&self) -> Result<(), DriverError>;

    /// End the session
    async fn quit(&self) -> Result<(), DriverError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory browser used by pool and batch tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct FakeState {
        handles: Vec<String>,
        focused: usize,
        next_handle: usize,
        urls: Vec<Option<String>>,
        ready_at: Vec<Option<Instant>>,
        load_time: Duration,
        fail_open: bool,
        broken_handles: HashSet<String>,
        navigations: usize,
        quit: bool,
    }

    /// Fake browser whose tabs load instantly unless `slow_loads` is set
    #[derive(Debug)]
    pub struct FakeBrowser {
        state: Mutex<FakeState>,
    }

    impl FakeBrowser {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(FakeState {
                    handles: vec!["tab-0".to_string()],
                    focused: 0,
                    next_handle: 1,
                    urls: vec![None],
                    ready_at: vec![None],
                    load_time: Duration::ZERO,
                    fail_open: false,
                    broken_handles: HashSet::new(),
                    navigations: 0,
                    quit: false,
                }),
            }
        }

        pub fn failing_open() -> Self {
            let browser = Self::new();
            browser.state.lock().fail_open = true;
            browser
        }

        /// Pages report `loading` for this long after navigation
        pub fn slow_loads(&self, load_time: Duration) {
            self.state.lock().load_time = load_time;
        }

        /// Make every switch to the tab at `index` fail
        pub fn break_tab(&self, index: usize) {
            let mut state = self.state.lock();
            let handle = state.handles[index].clone();
            state.broken_handles.insert(handle);
        }

        pub fn tab_count(&self) -> usize {
            self.state.lock().handles.len()
        }

        pub fn navigations(&self) -> usize {
            self.state.lock().navigations
        }

        pub fn has_quit(&self) -> bool {
            self.state.lock().quit
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeBrowser {
        async fn open_tab(&self) -> Result<(), DriverError> {
            let mut state = self.state.lock();
            if state.fail_open {
                return Err(DriverError::webdriver("cannot open window"));
            }
            let handle = format!("tab-{}", state.next_handle);
            state.next_handle += 1;
            state.handles.push(handle);
            state.urls.push(None);
            state.ready_at.push(None);
            Ok(())
        }

        async fn window_handles(&self) -> Result<Vec<String>, DriverError> {
            Ok(self.state.lock().handles.clone())
        }

        async fn switch_to(&self, handle: &str) -> Result<(), DriverError> {
            let mut state = self.state.lock();
            if state.broken_handles.contains(handle) {
                return Err(DriverError::webdriver("chrome not reachable"));
            }
            match state.handles.iter().position(|h| h == handle) {
                Some(index) => {
                    state.focused = index;
                    Ok(())
                }
                None => Err(DriverError::webdriver("no such window")),
            }
        }

        async fn navigate(&self, url: &str) -> Result<(), DriverError> {
            let mut state = self.state.lock();
            let focused = state.focused;
            state.urls[focused] = Some(url.to_string());
            state.ready_at[focused] = Some(Instant::now() + state.load_time);
            state.navigations += 1;
            Ok(())
        }

        async fn execute_script(&self, script: &str) -> Result<Value, DriverError> {
            let state = self.state.lock();
            if script.contains("readyState") {
                let loading = state.ready_at[state.focused].is_some_and(|at| Instant::now() < at);
                let ready = if loading { "loading" } else { "complete" };
                return Ok(Value::String(ready.to_string()));
            }
            if script.contains("location.href") {
                let url = state.urls[state.focused].clone().unwrap_or_default();
                return Ok(Value::String(url));
            }
            Ok(serde_json::json!({ "title": "match" }))
        }

        async fn close_current(&self) -> Result<(), DriverError> {
            let mut state = self.state.lock();
            let focused = state.focused;
            state.handles.remove(focused);
            state.urls.remove(focused);
            state.ready_at.remove(focused);
            state.focused = 0;
            Ok(())
        }

        async fn quit(&self) -> Result<(), DriverError> {
            self.state.lock().quit = true;
            Ok(())
        }
    }
}
