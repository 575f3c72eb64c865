//! Dogstatsd storage engine: statsd datagrams over UDP.
//!
//! Metrics are sent as timers; events are sent as service checks so a
//! monitor can alert on the status carried with every check.

use crate::error::{Error, Result};
use crate::telemetry::{Event, Metric};

use serde::Deserialize;
use std::collections::HashMap;
use tokio::net::UdpSocket;

#[derive(Debug, Clone, Deserialize)]
pub struct DogstatsdConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "metric-namespace", default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

pub struct DogstatsdSink {
    sock: UdpSocket,
    namespace: Option<String>,
    constant_tags: HashMap<String, String>,
}

impl DogstatsdSink {
    pub async fn connect(cfg: &DogstatsdConfig) -> Result<Self> {
        let addr = format!("{}:{}", cfg.host, cfg.port);
        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::SinkFatal(format!("could not bind dogstatsd socket: {}", e)))?;
        sock.connect(&addr)
            .await
            .map_err(|e| Error::SinkFatal(format!("could not create dogstatsd connection: {}", e)))?;

        Ok(Self {
            sock,
            namespace: cfg.namespace.clone(),
            constant_tags: cfg.tags.clone(),
        })
    }

    fn prefixed(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, name),
            None => format!("ferrite.{}", name),
        }
    }

    fn tag_suffix(&self, tags: &HashMap<String, String>) -> String {
        let mut all: Vec<String> = self
            .constant_tags
            .iter()
            .chain(tags.iter())
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        if all.is_empty() {
            return String::new();
        }
        all.sort();
        format!("|#{}", all.join(","))
    }

    fn metric_datagram(&self, m: &Metric) -> String {
        format!(
            "{}:{}|ms{}",
            self.prefixed(&format!("{}.{}", m.job, m.timing)),
            m.value,
            self.tag_suffix(&m.tags)
        )
    }

    fn event_datagram(&self, e: &Event) -> String {
        // Service-check status: 0 OK, 2 critical. A status of 0 means
        // the request never completed, which is critical too.
        let status = if e.server_status > 0 && e.server_status < 400 {
            0
        } else {
            2
        };
        let name = self.prefixed(&e.name);
        let message = format!(
            "{} is returning a HTTP status code of {}",
            e.name, e.server_status
        );
        format!(
            "_sc|{}|{}{}|m:{}",
            name,
            status,
            self.tag_suffix(&e.tags),
            message
        )
    }

    pub async fn send_metric(&mut self, m: Metric) -> Result<()> {
        let datagram = self.metric_datagram(&m);
        self.sock.send(datagram.as_bytes()).await.map(|_| ()).map_err(|e| {
            Error::SinkTransient(format!("could not send metric {}.{}: {}", m.job, m.timing, e))
        })
    }

    pub async fn send_event(&mut self, e: Event) -> Result<()> {
        let datagram = self.event_datagram(&e);
        self.sock.send(datagram.as_bytes()).await.map(|_| ()).map_err(|err| {
            Error::SinkTransient(format!("could not send event {}: {}", e.name, err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sink_with(namespace: Option<&str>, constant: &[(&str, &str)]) -> DogstatsdSink {
        // Socket pointed at a local address; tests only inspect formatting.
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cfg = DogstatsdConfig {
            host: "127.0.0.1".to_string(),
            port: receiver.local_addr().unwrap().port(),
            namespace: namespace.map(|s| s.to_string()),
            tags: constant
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        DogstatsdSink::connect(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn test_metric_datagram() {
        let sink = sink_with(Some("mon"), &[]).await;
        let m = Metric::new(
            "homepage",
            "http://x/",
            "time_to_first_byte_milliseconds",
            42.0,
            chrono::Utc::now(),
            &[("env".to_string(), "prod".to_string())].into(),
        );
        assert_eq!(
            sink.metric_datagram(&m),
            "mon.homepage.time_to_first_byte_milliseconds:42|ms|#env:prod"
        );
    }

    #[tokio::test]
    async fn test_event_datagram_status_mapping() {
        let sink = sink_with(None, &[]).await;

        let ok = Event::new("check", 200, &HashMap::new());
        assert!(sink.event_datagram(&ok).starts_with("_sc|ferrite.check|0"));

        let bad = Event::new("check", 502, &HashMap::new());
        assert!(sink.event_datagram(&bad).starts_with("_sc|ferrite.check|2"));

        let none = Event::new("check", 0, &HashMap::new());
        assert!(sink.event_datagram(&none).starts_with("_sc|ferrite.check|2"));
    }

    #[tokio::test]
    async fn test_constant_tags_merged() {
        let sink = sink_with(Some("mon"), &[("fleet", "eu")]).await;
        let m = Metric::new(
            "j",
            "u",
            "t",
            1.0,
            chrono::Utc::now(),
            &[("env".to_string(), "prod".to_string())].into(),
        );
        assert_eq!(sink.metric_datagram(&m), "mon.j.t:1|ms|#env:prod,fleet:eu");
    }
}
