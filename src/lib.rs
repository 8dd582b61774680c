//! Tab-parallel browser scraper for basketball match pages.
//!
//! One browser session is shared by a pool of tabs. Matches are processed
//! in adaptive batches with network-aware retries, per-match error
//! tracking, resource monitoring and a resumable session checkpoint.

pub mod browser;
pub mod cli;
pub mod error;
pub mod monitor;
pub mod resilience;
pub mod scraper;
pub mod storage;
pub mod utils;

pub use error::{Result, ScraperError};
