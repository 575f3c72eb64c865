//! PagerDuty storage engine.
//!
//! Events only, and only failures: statuses below 400 are dropped, and
//! repeats of the same (name, status) pair are debounced so a flapping
//! endpoint opens one incident per window instead of one per tick.

use crate::config::parse_duration;
use crate::error::{Error, Result};
use crate::telemetry::Event;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://events.pagerduty.com/v2/enqueue";

#[derive(Debug, Clone, Deserialize)]
pub struct PagerDutyConfig {
    #[serde(rename = "routing-key")]
    pub routing_key: String,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(rename = "event-namespace", default)]
    pub namespace: Option<String>,
    /// Debounce window as a duration string, default one hour.
    #[serde(rename = "event-duration", default)]
    pub event_duration: Option<String>,
    /// Override of the Events API endpoint, for tests.
    #[serde(rename = "api-url", default)]
    pub api_url: Option<String>,
}

pub struct PagerDutySink {
    client: reqwest::Client,
    api_url: String,
    routing_key: String,
    client_name: String,
    namespace: String,
    event_duration: Duration,
    // Only this engine's task touches the debounce map.
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl PagerDutySink {
    pub fn new(cfg: &PagerDutyConfig, timeout: Duration) -> Result<Self> {
        if cfg.routing_key.is_empty() {
            return Err(Error::SinkFatal("missing PagerDuty routing key".to_string()));
        }

        let event_duration = match &cfg.event_duration {
            Some(d) => parse_duration(d)
                .map_err(|e| Error::SinkFatal(format!("invalid event-duration: {}", e)))?,
            None => Duration::from_secs(3600),
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::SinkFatal(format!("could not build PagerDuty client: {}", e)))?;

        Ok(Self {
            client,
            api_url: cfg
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            routing_key: cfg.routing_key.clone(),
            client_name: cfg.client.clone().unwrap_or_else(|| "ferrite".to_string()),
            namespace: cfg.namespace.clone().unwrap_or_else(|| "ferrite".to_string()),
            event_duration,
            last_seen: HashMap::new(),
        })
    }

    /// Whether an event should be submitted, updating the debounce map
    /// when it is.
    fn should_submit(&mut self, e: &Event) -> bool {
        if e.server_status < 400 {
            return false;
        }

        let key = format!("{}-{}", e.name, e.server_status);
        match self.last_seen.get(&key) {
            Some(last) if e.timestamp <= *last + chrono::Duration::from_std(self.event_duration).unwrap_or_default() => false,
            _ => {
                self.last_seen.insert(key, e.timestamp);
                true
            }
        }
    }

    pub async fn send_event(&mut self, e: Event) -> Result<()> {
        if !self.should_submit(&e) {
            return Ok(());
        }

        let severity = if e.server_status < 500 {
            "error"
        } else {
            "critical"
        };
        let event_name = format!("{}.{}", self.namespace, e.name);
        let dedup_key = format!(
            "{}-{}-{}",
            e.name,
            e.server_status,
            e.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );

        let payload = json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "dedup_key": dedup_key,
            "client": self.client_name,
            "payload": {
                "summary": format!("{} returned status {}", event_name, e.server_status),
                "source": self.client_name,
                "severity": severity,
                "timestamp": e.timestamp.to_rfc3339(),
                "custom_details": e.tags,
            },
        });

        let resp = self
            .client
            .post(&self.api_url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                Error::SinkTransient(format!("unable to send event via PagerDuty API: {}", err))
            })?;

        if !resp.status().is_success() {
            return Err(Error::SinkTransient(format!(
                "unable to send event via PagerDuty API, response status {}",
                resp.status()
            )));
        }

        Ok(())
    }
}
