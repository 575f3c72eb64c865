//! Splunk HTTP Event Collector storage engine.

use crate::error::{Error, Result};
use crate::telemetry::{Event, Metric};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SplunkHecConfig {
    pub token: String,
    #[serde(rename = "hec-url")]
    pub hec_url: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "metrics-source-type", default)]
    pub metrics_source_type: Option<String>,
    #[serde(rename = "metrics-index", default)]
    pub metrics_index: Option<String>,
    #[serde(rename = "events-source-type", default)]
    pub events_source_type: Option<String>,
    #[serde(rename = "events-index", default)]
    pub events_index: Option<String>,
    #[serde(rename = "skip-cert-validation", default)]
    pub skip_cert_validation: bool,
    #[serde(rename = "ca-cert", default)]
    pub ca_cert: Option<String>,
}

/// HEC envelope around one metric or event.
#[derive(Serialize)]
struct HecEnvelope<T: Serialize> {
    time: i64,
    host: String,
    source: String,
    sourcetype: String,
    index: String,
    event: T,
}

pub struct SplunkHecSink {
    client: reqwest::Client,
    config: SplunkHecConfig,
}

impl SplunkHecSink {
    pub fn new(cfg: &SplunkHecConfig, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(path) = &cfg.ca_cert {
            let pem = std::fs::read(path).map_err(|e| {
                Error::SinkFatal(format!("unable to load ca-cert from {}: {}", path, e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::SinkFatal(format!("unable to parse ca-cert from {}: {}", path, e))
            })?;
            builder = builder.add_root_certificate(cert);
        } else if cfg.skip_cert_validation {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| Error::SinkFatal(format!("could not build Splunk HEC client: {}", e)))?;

        Ok(Self {
            client,
            config: cfg.clone(),
        })
    }

    pub async fn send_metric(&mut self, m: Metric) -> Result<()> {
        let envelope = self.envelope(
            m.timestamp,
            self.config
                .metrics_source_type
                .clone()
                .unwrap_or_else(|| "metric".to_string()),
            self.config
                .metrics_index
                .clone()
                .unwrap_or_else(|| "main".to_string()),
            &m,
        );
        self.post(&envelope).await
    }

    pub async fn send_event(&mut self, e: Event) -> Result<()> {
        let envelope = self.envelope(
            e.timestamp,
            self.config
                .events_source_type
                .clone()
                .unwrap_or_else(|| "event".to_string()),
            self.config
                .events_index
                .clone()
                .unwrap_or_else(|| "main".to_string()),
            &e,
        );
        self.post(&envelope).await
    }

    fn envelope<T: Serialize>(
        &self,
        at: DateTime<Utc>,
        sourcetype: String,
        index: String,
        record: T,
    ) -> HecEnvelope<T> {
        HecEnvelope {
            time: at.timestamp_millis(),
            host: self.config.host.clone().unwrap_or_default(),
            source: self.config.source.clone().unwrap_or_default(),
            sourcetype,
            index,
            event: record,
        }
    }

    async fn post<T: Serialize>(&self, envelope: &HecEnvelope<T>) -> Result<()> {
        let resp = self
            .client
            .post(&self.config.hec_url)
            .header("Authorization", format!("Splunk {}", self.config.token))
            .json(envelope)
            .send()
            .await
            .map_err(|e| Error::SinkTransient(format!("Splunk HEC request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::SinkTransient(format!(
                "unable to send record through Splunk HEC, response status {}",
                resp.status()
            )));
        }

        Ok(())
    }
}
