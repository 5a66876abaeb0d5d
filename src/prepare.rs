//! Page preparation before capture
//!
//! Freezes animations, forces lazy assets to load, scrolls until the
//! document stops growing and waits for images and fonts. Every step is
//! best-effort: a failing script is logged and the capture carries on with
//! whatever the page rendered.

use crate::{AutoscrollSettings, CaptureError};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Upper bound for a single injected script.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

const FREEZE_ANIMATIONS_JS: &str = r#"(() => {
  const id = '__webshot_relay_freeze';
  if (document.getElementById(id)) return true;
  const style = document.createElement('style');
  style.id = id;
  style.textContent = `
    *, *::before, *::after {
      animation: none !important;
      animation-duration: 0s !important;
      transition: none !important;
      scroll-behavior: auto !important;
      caret-color: transparent !important;
    }
    * { background-attachment: scroll !important; }
  `;
  (document.head || document.documentElement).appendChild(style);
  return true;
})()"#;

const EAGER_LOAD_JS: &str = r#"(() => {
  let touched = 0;
  document.querySelectorAll('img[loading], iframe[loading]').forEach((el) => {
    try {
      if (el.getAttribute('loading') === 'lazy') {
        el.setAttribute('loading', 'eager');
        touched++;
      }
    } catch (e) {}
  });
  document.querySelectorAll('img[data-src], iframe[data-src], video[data-src], source[data-src]').forEach((el) => {
    try {
      const src = el.getAttribute('data-src');
      if (src && el.getAttribute('src') !== src) {
        el.setAttribute('src', src);
        touched++;
      }
    } catch (e) {}
  });
  document.querySelectorAll('img[data-srcset], source[data-srcset]').forEach((el) => {
    try {
      const srcset = el.getAttribute('data-srcset');
      if (srcset && el.getAttribute('srcset') !== srcset) {
        el.setAttribute('srcset', srcset);
        touched++;
      }
    } catch (e) {}
  });
  return touched;
})()"#;

const MEASURE_JS: &str = r#"(() => ({
  height: Math.max(
    document.body ? document.body.scrollHeight : 0,
    document.documentElement ? document.documentElement.scrollHeight : 0
  ),
  bottom: window.scrollY + window.innerHeight
}))()"#;

const SCROLL_TO_BOTTOM_JS: &str = r#"(() => {
  window.scrollTo(0, Math.max(
    document.body ? document.body.scrollHeight : 0,
    document.documentElement ? document.documentElement.scrollHeight : 0
  ));
  return true;
})()"#;

const ASSET_WAIT_JS: &str = r#"(async () => {
  const pending = Array.from(document.images)
    .filter((img) => !img.complete || img.naturalWidth === 0)
    .map((img) => (img.decode ? img.decode().catch(() => {}) : Promise.resolve()));
  const fonts = document.fonts && document.fonts.ready
    ? document.fonts.ready.catch(() => {})
    : Promise.resolve();
  const ready = Promise.all([...pending, fonts]).then(() => true);
  const expired = new Promise((resolve) => setTimeout(() => resolve(false), __TIMEOUT_MS__));
  return await Promise.race([ready, expired]);
})()"#;

const PAUSE_VIDEOS_JS: &str = r#"(() => {
  let paused = 0;
  document.querySelectorAll('video').forEach((video) => {
    try {
      if (!video.paused) {
        video.pause();
        paused++;
      }
    } catch (e) {}
  });
  return paused;
})()"#;

fn scroll_by_js(step_px: u32) -> String {
    format!("(() => {{ window.scrollBy(0, {step_px}); return true; }})()")
}

fn asset_wait_js(budget: Duration) -> String {
    ASSET_WAIT_JS.replace("__TIMEOUT_MS__", &budget.as_millis().to_string())
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct PageMetrics {
    height: f64,
    bottom: f64,
}

impl PageMetrics {
    fn at_bottom(&self) -> bool {
        self.bottom + 1.0 >= self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// Keep scrolling
    Growing,
    /// Height stopped growing at the bottom of the page
    Settled,
    /// Round cap reached
    Exhausted,
}

/// Stop condition for autoscroll-until-settled
///
/// A round counts as stable when the document did not grow past the tallest
/// height seen so far and the viewport already touches the bottom. Enough
/// consecutive stable rounds settle the page; the round cap ends infinite
/// feeds.
#[derive(Debug, Clone)]
pub struct ScrollSettle {
    max_height: u64,
    stable: u32,
    rounds: u32,
    stable_rounds: u32,
    max_rounds: u32,
}

impl ScrollSettle {
    pub fn new(settings: &AutoscrollSettings, initial_height: u64) -> Self {
        Self {
            max_height: initial_height,
            stable: 0,
            rounds: 0,
            stable_rounds: settings.stable_rounds.max(1),
            max_rounds: settings.max_rounds.max(1),
        }
    }

    pub fn observe(&mut self, height: u64, at_bottom: bool) -> SettleState {
        self.rounds += 1;

        if height > self.max_height {
            self.max_height = height;
            self.stable = 0;
        } else if at_bottom {
            self.stable += 1;
        } else {
            self.stable = 0;
        }

        if self.stable >= self.stable_rounds {
            SettleState::Settled
        } else if self.rounds >= self.max_rounds {
            SettleState::Exhausted
        } else {
            SettleState::Growing
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn max_height(&self) -> u64 {
        self.max_height
    }
}

/// What the preparation pass managed to do, for logging
#[derive(Debug, Clone, Default)]
pub struct PrepareReport {
    pub animations_frozen: bool,
    pub eager_rewrites: u64,
    pub scroll_rounds: u32,
    pub scroll_state: Option<SettleState>,
    pub document_height: u64,
    pub assets_ready: bool,
    pub videos_paused: u64,
}

/// Options for one preparation pass
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub autoscroll: bool,
    pub scroll_delay: Duration,
    pub asset_budget: Duration,
}

pub struct PagePreparer {
    settings: AutoscrollSettings,
}

impl PagePreparer {
    pub fn new(settings: AutoscrollSettings) -> Self {
        Self { settings }
    }

    pub async fn prepare(&self, page: &Page, options: &PrepareOptions) -> PrepareReport {
        let mut report = PrepareReport {
            animations_frozen: run_script::<bool>(page, FREEZE_ANIMATIONS_JS, SCRIPT_TIMEOUT)
                .await
                .unwrap_or(false),
            eager_rewrites: run_script::<u64>(page, EAGER_LOAD_JS, SCRIPT_TIMEOUT)
                .await
                .unwrap_or(0),
            ..Default::default()
        };

        if options.autoscroll {
            self.autoscroll(page, options.scroll_delay, &mut report).await;
        }

        // The script races its own timer; the outer bound covers a wedged renderer
        report.assets_ready = run_script::<bool>(
            page,
            &asset_wait_js(options.asset_budget),
            options.asset_budget + Duration::from_secs(1),
        )
        .await
        .unwrap_or(false);

        report.videos_paused = run_script::<u64>(page, PAUSE_VIDEOS_JS, SCRIPT_TIMEOUT)
            .await
            .unwrap_or(0);

        debug!("Page preparation finished: {:?}", report);
        report
    }

    async fn autoscroll(&self, page: &Page, delay: Duration, report: &mut PrepareReport) {
        let Some(initial) = run_script::<PageMetrics>(page, MEASURE_JS, SCRIPT_TIMEOUT).await
        else {
            return;
        };

        let mut settle = ScrollSettle::new(&self.settings, initial.height as u64);
        let scroll_js = scroll_by_js(self.settings.step_px);

        loop {
            if run_script::<bool>(page, &scroll_js, SCRIPT_TIMEOUT).await.is_none() {
                break;
            }
            sleep(delay).await;

            let Some(metrics) = run_script::<PageMetrics>(page, MEASURE_JS, SCRIPT_TIMEOUT).await
            else {
                break;
            };

            let state = settle.observe(metrics.height as u64, metrics.at_bottom());
            if state != SettleState::Growing {
                report.scroll_state = Some(state);
                break;
            }
        }

        // Stay at the bottom: virtualized lists drop rows that scroll out of view
        let _ = run_script::<bool>(page, SCROLL_TO_BOTTOM_JS, SCRIPT_TIMEOUT).await;

        report.scroll_rounds = settle.rounds();
        report.document_height = settle.max_height();
        debug!(
            "Autoscroll stopped after {} rounds at height {} ({:?})",
            settle.rounds(),
            settle.max_height(),
            report.scroll_state
        );
    }
}

/// Evaluate `script` and decode its value, or `None` on any failure.
async fn run_script<T: DeserializeOwned>(page: &Page, script: &str, budget: Duration) -> Option<T> {
    match timeout(budget, evaluate::<T>(page, script)).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            debug!("Preparation script failed: {}", e);
            None
        }
        Err(_) => {
            debug!("Preparation script timed out after {:?}", budget);
            None
        }
    }
}

async fn evaluate<T: DeserializeOwned>(page: &Page, script: &str) -> Result<T, CaptureError> {
    let params = EvaluateParams::builder()
        .expression(script)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(CaptureError::PageError)?;

    let result = page.evaluate_expression(params).await?;
    result
        .into_value::<T>()
        .map_err(|e| CaptureError::PageError(e.to_string()))
}
