//! Scheduled probe jobs.
//!
//! Each job owns a ticker and runs on its own task. Simple and API
//! probes are spawned per tick so a slow endpoint cannot delay the
//! schedule; browser probes run inline because a remote browser
//! session is not safe to overlap.

pub mod manager;

use crate::config::{Cookie, StepEntry};
use crate::probe::{api, browser, timing, webdriver, HttpSettings, RequestSpec};
use crate::storage::Storage;

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What a job does on each tick.
#[derive(Debug, Clone)]
pub enum JobKind {
    Simple(RequestSpec),
    Api { steps: Vec<StepEntry> },
    Browser { url: String, cookies: Vec<Cookie> },
}

/// One scheduled probe.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub interval: Duration,
    pub tags: HashMap<String, String>,
    pub kind: JobKind,
}

/// Everything a job needs at runtime. Cloned into each job task.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub storage: Storage,
    pub settings: HttpSettings,
    pub selenium_url: String,
    /// Upper bound in seconds for the randomised pre-start sleep.
    pub stagger_offset: i32,
    pub cancel: CancellationToken,
}

impl Job {
    /// The per-job loop: optional stagger sleep, then a ticker that
    /// fires probes until the root scope is cancelled. The first tick
    /// fires one full interval after startup.
    pub async fn run(self, ctx: JobContext) {
        if ctx.stagger_offset > 0 {
            let delay = stagger_delay(ctx.stagger_offset);
            tracing::info!("job {}: sleeping {:?} before first tick", self.name, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return,
            }
        }

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        // Late ticks fire immediately rather than being coalesced.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.fire(&ctx).await,
                _ = ctx.cancel.cancelled() => {
                    tracing::info!("cancellation received, stopping job {}", self.name);
                    return;
                }
            }
        }
    }

    async fn fire(&self, ctx: &JobContext) {
        match &self.kind {
            JobKind::Simple(spec) => {
                let spec = spec.clone();
                let settings = ctx.settings.clone();
                let storage = ctx.storage.clone();
                let cancel = ctx.cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = timing::run_probe(&spec, &settings, &storage, &cancel).await {
                        tracing::warn!("job {}: {}", spec.name, e);
                    }
                });
            }
            JobKind::Api { steps } => {
                let name = self.name.clone();
                let steps = steps.clone();
                let tags = self.tags.clone();
                let settings = ctx.settings.clone();
                let storage = ctx.storage.clone();
                let cancel = ctx.cancel.clone();
                tokio::spawn(async move {
                    api::run_sequence(&name, &steps, &tags, &settings, &storage, &cancel).await;
                });
            }
            JobKind::Browser { url, cookies } => {
                if let Err(e) = self.run_browser_tick(url, cookies, ctx).await {
                    tracing::warn!("job {}: {}", self.name, e);
                }
            }
        }
    }

    async fn run_browser_tick(
        &self,
        url: &str,
        cookies: &[Cookie],
        ctx: &JobContext,
    ) -> crate::error::Result<()> {
        let client = webdriver::WebDriverClient::new(&ctx.selenium_url, ctx.settings.timeout)?;
        let session = client.new_session().await?;
        browser::run_browser_probe(session, &self.name, url, cookies, &self.tags, &ctx.storage)
            .await
    }
}

/// A uniformly random delay in `[0, offset)` seconds.
fn stagger_delay(offset_secs: i32) -> Duration {
    let window_ms = offset_secs as u64 * 1000;
    Duration::from_millis(rand::random::<u64>() % window_ms)
}
