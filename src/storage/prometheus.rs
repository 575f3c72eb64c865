//! Prometheus storage engine: gauges exposed on a scrape endpoint.

use crate::error::{Error, Result};
use crate::telemetry::Metric;

use axum::{routing::get, Router};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    #[serde(rename = "listen-addr")]
    pub listen_addr: String,
    #[serde(rename = "metric-namespace", default)]
    pub namespace: Option<String>,
}

pub struct PrometheusSink {
    registry: Arc<Registry>,
    namespace: Option<String>,
    gauges: HashMap<String, GaugeVec>,
}

impl PrometheusSink {
    /// Register the scrape server on the configured address. A bind
    /// failure is fatal: a scrape endpoint that never existed is worse
    /// than a crashed agent.
    pub async fn start(cfg: &PrometheusConfig, cancel: CancellationToken) -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
            .await
            .map_err(|e| {
                Error::SinkFatal(format!(
                    "unable to start Prometheus listener on {}: {}",
                    cfg.listen_addr, e
                ))
            })?;
        tracing::info!(
            "Prometheus scrape endpoint listening on {}",
            cfg.listen_addr
        );

        let scrape_registry = registry.clone();
        let router = Router::new().route(
            "/metrics",
            get(move || {
                let registry = scrape_registry.clone();
                async move { render(&registry) }
            }),
        );

        tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::error!("Prometheus scrape server error: {}", e);
            }
        });

        Ok(Self {
            registry,
            namespace: cfg.namespace.as_deref().map(mangle),
            gauges: HashMap::new(),
        })
    }

    pub fn send_metric(&mut self, m: Metric) -> Result<()> {
        let name = match &self.namespace {
            Some(ns) => mangle(&format!("{}_{}", ns, m.timing)),
            None => mangle(&format!("ferrite_{}", m.timing)),
        };

        let mut labels: HashMap<&str, &str> = m
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        labels.insert("job", &m.job);
        labels.insert("url", &m.url);

        let gauge = match self.gauges.get(&name) {
            Some(g) => g.clone(),
            None => {
                let mut label_names: Vec<&str> = labels.keys().copied().collect();
                label_names.sort_unstable();

                let gauge = GaugeVec::new(
                    Opts::new(&name, "Probe timing metric, in milliseconds"),
                    &label_names,
                )
                .map_err(|e| Error::SinkTransient(format!("could not create gauge {}: {}", name, e)))?;

                self.registry
                    .register(Box::new(gauge.clone()))
                    .map_err(|e| {
                        Error::SinkTransient(format!("could not register gauge {}: {}", name, e))
                    })?;

                self.gauges.insert(name.clone(), gauge.clone());
                gauge
            }
        };

        gauge
            .get_metric_with(&labels)
            .map_err(|e| {
                Error::SinkTransient(format!(
                    "unable to get metric {} with tags {:?}: {}",
                    name, labels, e
                ))
            })?
            .set(m.value);

        Ok(())
    }
}

/// Prometheus metric names allow neither `.` nor `-`.
fn mangle(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

fn render(registry: &Registry) -> ([(http::HeaderName, String); 1], Vec<u8>) {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
        tracing::error!("failed to encode prometheus metrics: {}", e);
    }
    (
        [(http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buf,
    )
}
