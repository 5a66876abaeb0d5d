//! # webshot-relay
//!
//! A headless-browser screenshot service. Each request gets its own
//! isolated Chrome instance, a navigation with a configurable readiness
//! condition, a preparation pass that makes lazy content render, and a PNG
//! capture with bounded retries. The result can be forwarded to a callback
//! endpoint in the same call.
//!
//! ## HTTP API
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `/scrape` | Capture a page, optionally forward it to `notify_api` |
//! | `POST` | `/send` | Forward an existing base64 screenshot |
//! | `GET` | `/health` | Liveness and current load |
//! | `GET` | `/metrics` | Prometheus exposition |
//!
//! Errors are returned as `{"detail": "..."}`. Invalid requests answer
//! 422, navigation and capture failures 504, everything else 500.
//!
//! ## Page preparation
//!
//! Before capturing, the page is stabilised:
//! - CSS animations and transitions are frozen
//! - lazy images and iframes are switched to eager loading
//! - the page is scrolled until its height stops growing
//! - pending images and web fonts get a bounded wait
//! - videos are paused and media requests are blocked
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webshot_relay::{CaptureService, Config, ScrapeRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = CaptureService::new(Config::default());
//!
//!     let request = ScrapeRequest {
//!         url: "https://example.com".to_string(),
//!         ..Default::default()
//!     };
//!     let result = service.capture_page(&request).await?;
//!     println!("Captured {} ({})", result.final_url, result.title);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Service
//! ```bash
//! webshot-relay serve --bind 0.0.0.0:8000
//! ```
//!
//! ### Single Capture
//! ```bash
//! webshot-relay capture --url https://example.com --output example.png
//! ```

/// Service configuration and request/response types
pub mod config;

/// Error types and their HTTP mapping
pub mod error;

/// Per-request browser sessions, navigation and network tracking
pub mod browser;

/// In-page preparation before capture
pub mod prepare;

/// Capture orchestration
pub mod capture;

/// Callback delivery
pub mod notify;

/// HTTP routes
pub mod server;

/// Command-line interface
pub mod cli;

/// Prometheus metrics
pub mod metrics;

/// Utility functions
pub mod utils;


pub use browser::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use metrics::*;
pub use notify::*;
pub use prepare::*;
pub use server::*;
pub use utils::*;
