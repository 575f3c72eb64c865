//! Browser probe: page-load timing through a remote browser session.
//!
//! The probe drives an external automation endpoint, reads the W3C
//! navigation-timing fields after the page settles, and derives five
//! interval metrics. No event is emitted; the page either loads or the
//! tick is logged and skipped.

use crate::config::Cookie;
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::telemetry::Metric;

use chrono::Utc;
use std::collections::HashMap;

/// The verbs a browser session must support. The production
/// implementation is [`crate::probe::webdriver::WebDriverSession`];
/// tests substitute a recording mock.
#[allow(async_fn_in_trait)]
pub trait BrowserDriver {
    async fn navigate(&mut self, url: &str) -> Result<()>;
    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<()>;
    async fn timing_value(&mut self, field: &str) -> Result<f64>;
    async fn close(&mut self) -> Result<()>;
}

/// The W3C navigation-timing marks, in order of occurrence:
///
/// navigationStart -> redirectStart -> redirectEnd -> fetchStart ->
/// domainLookupStart -> domainLookupEnd -> connectStart -> connectEnd ->
/// requestStart -> responseStart -> responseEnd -> domLoading ->
/// domInteractive -> domContentLoadedEventStart -> domComplete ->
/// loadEventStart -> loadEventEnd
#[derive(Debug, Clone, Default)]
pub struct NavigationTimings {
    pub navigation_start: f64,
    pub redirect_start: f64,
    pub redirect_end: f64,
    pub fetch_start: f64,
    pub domain_lookup_start: f64,
    pub domain_lookup_end: f64,
    pub connect_start: f64,
    pub connect_end: f64,
    pub request_start: f64,
    pub response_start: f64,
    pub response_end: f64,
    pub dom_loading: f64,
    pub dom_interactive: f64,
    pub dom_content_loaded_event_start: f64,
    pub dom_complete: f64,
    pub load_event_start: f64,
    pub load_event_end: f64,
}

/// Intervals derived from the timing marks, all in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct NavigationIntervals {
    pub dns_duration: f64,
    pub server_connection_duration: f64,
    pub server_processing_duration: f64,
    pub server_response_duration: f64,
    pub dom_rendering_duration: f64,
}

impl NavigationTimings {
    pub fn intervals(&self) -> NavigationIntervals {
        NavigationIntervals {
            // Time to complete the DNS lookup.
            dns_duration: self.domain_lookup_end - self.domain_lookup_start,
            // Time to establish the TCP connection.
            server_connection_duration: self.connect_end - self.connect_start,
            // Server time before the first response byte.
            server_processing_duration: self.response_start - self.request_start,
            // Time for the server to send the entire response.
            server_response_duration: self.response_end - self.response_start,
            // Time to render the complete DOM.
            dom_rendering_duration: self.dom_complete - self.dom_loading,
        }
    }
}

/// Run one browser probe tick. The session is closed on every exit
/// path, including failures mid-navigation.
pub async fn run_browser_probe<D: BrowserDriver>(
    mut driver: D,
    name: &str,
    url: &str,
    cookies: &[Cookie],
    tags: &HashMap<String, String>,
    storage: &Storage,
) -> Result<()> {
    let outcome = drive_session(&mut driver, url, cookies).await;

    if let Err(e) = driver.close().await {
        tracing::warn!("browser job {}: could not close session: {}", name, e);
    }

    let timings = outcome?;
    emit_intervals(name, url, &timings.intervals(), tags, storage).await;
    Ok(())
}

async fn drive_session<D: BrowserDriver>(
    driver: &mut D,
    url: &str,
    cookies: &[Cookie],
) -> Result<NavigationTimings> {
    // Browsers refuse cookies for a domain they are not currently on.
    // Load a same-origin page that 404s, set the cookies, then do the
    // real navigation.
    if !cookies.is_empty() {
        driver.navigate(&cookie_staging_url(url)?).await?;
        for cookie in cookies {
            driver.add_cookie(cookie).await?;
        }
    }

    driver.navigate(url).await?;
    fetch_timings(driver).await
}

/// A same-origin URL that is expected to 404.
fn cookie_staging_url(target: &str) -> Result<String> {
    let parsed = url::Url::parse(target).map_err(|e| Error::ProbeMalformedUrl {
        url: target.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| Error::ProbeMalformedUrl {
        url: target.to_string(),
        reason: "missing host".to_string(),
    })?;

    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    Ok(format!(
        "{}://{}/selenium-testing-404",
        parsed.scheme(),
        authority
    ))
}

async fn fetch_timings<D: BrowserDriver>(driver: &mut D) -> Result<NavigationTimings> {
    let mut t = NavigationTimings::default();

    t.navigation_start = driver.timing_value("navigationStart").await?;
    t.redirect_start = driver.timing_value("redirectStart").await?;
    t.redirect_end = driver.timing_value("redirectEnd").await?;
    t.fetch_start = driver.timing_value("fetchStart").await?;
    t.domain_lookup_start = driver.timing_value("domainLookupStart").await?;
    t.domain_lookup_end = driver.timing_value("domainLookupEnd").await?;
    t.connect_start = driver.timing_value("connectStart").await?;
    t.connect_end = driver.timing_value("connectEnd").await?;
    t.request_start = driver.timing_value("requestStart").await?;
    t.response_start = driver.timing_value("responseStart").await?;
    t.response_end = driver.timing_value("responseEnd").await?;
    t.dom_loading = driver.timing_value("domLoading").await?;
    t.dom_interactive = driver.timing_value("domInteractive").await?;
    t.dom_content_loaded_event_start = driver.timing_value("domContentLoadedEventStart").await?;
    t.dom_complete = driver.timing_value("domComplete").await?;
    t.load_event_start = driver.timing_value("loadEventStart").await?;
    t.load_event_end = driver.timing_value("loadEventEnd").await?;

    Ok(t)
}

async fn emit_intervals(
    name: &str,
    url: &str,
    intervals: &NavigationIntervals,
    tags: &HashMap<String, String>,
    storage: &Storage,
) {
    let samples = [
        ("dns_duration", intervals.dns_duration),
        ("server_connection_duration", intervals.server_connection_duration),
        ("server_processing_duration", intervals.server_processing_duration),
        ("server_response_duration", intervals.server_response_duration),
        ("dom_rendering_duration", intervals.dom_rendering_duration),
    ];

    for (timing, value) in samples {
        storage
            .record_metric(Metric::new(name, url, timing, value, Utc::now(), tags))
            .await;
    }
}
