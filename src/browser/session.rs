use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::browser::driver::{BrowserDriver, DriverError};
use crate::cli::config::BrowserSettings;

impl From<WebDriverError> for DriverError {
    fn from(err: WebDriverError) -> Self {
        DriverError::from_message(err.to_string())
    }
}

/// Browser session backed by a remote WebDriver endpoint
pub struct WebDriverSession {
    /// WebDriver instance, `None` once the session has quit
    driver: RwLock<Option<WebDriver>>,
}

impl WebDriverSession {
    /// Start a new browser session with the given settings
    pub async fn connect(config: &BrowserSettings) -> Result<Self> {
        let driver = match config.browser_type.as_str() {
            "chrome" => {
                let mut caps = DesiredCapabilities::chrome();

                caps.add_chrome_arg(&format!("--user-agent={}", config.user_agent))?;
                caps.add_chrome_arg(&format!(
                    "--window-size={},{}",
                    config.viewport.width, config.viewport.height
                ))?;

                if config.headless {
                    caps.set_headless()?;
                }

                caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
                caps.add_chrome_arg("--disable-dev-shm-usage")?;
                caps.add_chrome_arg("--no-sandbox")?;
                if config.disable_images {
                    caps.add_chrome_arg("--blink-settings=imagesEnabled=false")?;
                }

                WebDriver::new(&config.webdriver_url, caps).await
            }
            "firefox" => {
                let mut caps = DesiredCapabilities::firefox();
                if config.headless {
                    caps.set_headless()?;
                }
                WebDriver::new(&config.webdriver_url, caps).await
            }
            other => anyhow::bail!("Unsupported browser type: {}", other),
        }
        .context(format!("Failed to connect to WebDriver at {}", config.webdriver_url))?;

        driver
            .set_page_load_timeout(Duration::from_secs(config.page_load_timeout_secs))
            .await?;

        info!(
            browser = %config.browser_type,
            headless = config.headless,
            "Browser session initialized"
        );

        Ok(Self {
            driver: RwLock::new(Some(driver)),
        })
    }
}

fn not_initialized() -> DriverError {
    DriverError::connection("Browser session not initialized")
}

#[async_trait]
impl BrowserDriver for WebDriverSession {
    async fn open_tab(&self) -> Result<(), DriverError> {
        let guard = self.driver.read().await;
        let driver = guard.as_ref().ok_or_else(not_initialized)?;

        driver
            .execute("window.open('about:blank', '_blank');", Vec::new())
            .await?;
        Ok(())
    }

    async fn window_handles(&self) -> Result<Vec<String>, DriverError> {
        let guard = self.driver.read().await;
        let driver = guard.as_ref().ok_or_else(not_initialized)?;

        let handles = driver.windows().await?;
        Ok(handles.into_iter().map(String::from).collect())
    }

    async fn switch_to(&self, handle: &str) -> Result<(), DriverError> {
        let guard = self.driver.read().await;
        let driver = guard.as_ref().ok_or_else(not_initialized)?;

        let target = WindowHandle::try_from(handle)
            .map_err(|_| DriverError::webdriver(format!("invalid window handle: {}", handle)))?;

        driver.switch_to_window(target).await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let guard = self.driver.read().await;
        let driver = guard.as_ref().ok_or_else(not_initialized)?;

        debug!("Navigating to: {}", url);
        driver.goto(url).await?;
        Ok(())
    }

    async fn execute_script(&self, script: &str) -> Result<Value, DriverError> {
        let guard = self.driver.read().await;
        let driver = guard.as_ref().ok_or_else(not_initialized)?;

        let ret = driver.execute(script, Vec::new()).await?;
        let value = ret.convert::<Value>()?;
        Ok(value)
    }

    async fn close_current(&self) -> Result<(), DriverError> {
        let guard = self.driver.read().await;
        let driver = guard.as_ref().ok_or_else(not_initialized)?;

        driver.close_window().await?;
        Ok(())
    }

    async fn quit(&self) -> Result<(), DriverError> {
        if let Some(driver) = self.driver.write().await.take() {
            driver.quit().await?;
            debug!("Browser session closed");
        }
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            // Quit in the background when a runtime is still around
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}

/// Starts browser sessions, once per run and again on every restart
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>>;
}

/// Launches `WebDriverSession`s against the configured endpoint
pub struct WebDriverLauncher {
    settings: BrowserSettings,
}

impl WebDriverLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>> {
        let session = WebDriverSession::connect(&self.settings).await?;
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_handle_conversions() {
        let handle = WindowHandle::try_from("CDwindow-6A1B").unwrap();
        assert_eq!(String::from(handle), "CDwindow-6A1B");
        assert!(WindowHandle::try_from("current").is_err());
    }

    #[tokio::test]
    async fn test_unknown_browser_type_is_rejected() {
        let settings = BrowserSettings {
            browser_type: "lynx".to_string(),
            ..BrowserSettings::default()
        };
        let err = WebDriverSession::connect(&settings).await.err().unwrap();
        assert!(err.to_string().contains("Unsupported browser type"));
    }
}
