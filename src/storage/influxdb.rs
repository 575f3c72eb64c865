//! InfluxDB storage engine: line protocol via the v1 HTTP write
//! endpoint, or raw UDP datagrams.

use crate::error::{Error, Result};
use crate::telemetry::Metric;

use serde::Deserialize;
use std::time::Duration;
use tokio::net::UdpSocket;

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbConfig {
    #[serde(default)]
    pub scheme: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(rename = "metric-namespace", default)]
    pub namespace: Option<String>,
}

enum InfluxConn {
    Http {
        client: reqwest::Client,
        write_url: String,
        username: Option<String>,
        password: Option<String>,
    },
    Udp(UdpSocket),
}

pub struct InfluxDbSink {
    conn: InfluxConn,
    namespace: Option<String>,
    database: String,
}

impl InfluxDbSink {
    pub async fn new(cfg: &InfluxDbConfig, timeout: Duration) -> Result<Self> {
        let conn = if cfg.protocol.as_deref() == Some("udp") {
            let addr = format!("{}:{}", cfg.host, cfg.port.unwrap_or(8089));
            let sock = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| Error::SinkFatal(format!("could not bind InfluxDB socket: {}", e)))?;
            sock.connect(&addr).await.map_err(|e| {
                Error::SinkFatal(format!("could not create InfluxDB connection: {}", e))
            })?;
            InfluxConn::Udp(sock)
        } else {
            let scheme = cfg.scheme.as_deref().unwrap_or("http");
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::SinkFatal(format!("could not build InfluxDB client: {}", e)))?;
            InfluxConn::Http {
                client,
                write_url: format!(
                    "{}://{}:{}/write",
                    scheme,
                    cfg.host,
                    cfg.port.unwrap_or(8086)
                ),
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            }
        };

        Ok(Self {
            conn,
            namespace: cfg.namespace.clone(),
            database: cfg.database.clone(),
        })
    }

    /// Render one metric as an InfluxDB line-protocol point with a
    /// millisecond timestamp.
    fn line(&self, m: &Metric) -> String {
        let prefix = self.namespace.as_deref().unwrap_or("ferrite");
        let mut line = format!("{}.{}", prefix, escape_ident(&m.job));

        let mut tags: Vec<(&String, &String)> = m.tags.iter().collect();
        tags.sort();
        for (k, v) in tags {
            line.push_str(&format!(",{}={}", escape_ident(k), escape_ident(v)));
        }
        if !m.url.is_empty() {
            line.push_str(&format!(",url={}", escape_ident(&m.url)));
        }

        line.push_str(&format!(
            " {}={} {}",
            escape_ident(&m.timing),
            m.value,
            m.timestamp.timestamp_millis()
        ));
        line
    }

    pub async fn send_metric(&mut self, m: Metric) -> Result<()> {
        let line = self.line(&m);

        match &mut self.conn {
            InfluxConn::Http {
                client,
                write_url,
                username,
                password,
            } => {
                let mut req = client
                    .post(write_url.as_str())
                    .query(&[("db", self.database.as_str()), ("precision", "ms")])
                    .body(line);
                if let Some(user) = username {
                    req = req.basic_auth(user, password.as_deref());
                }

                let resp = req.send().await.map_err(|e| {
                    Error::SinkTransient(format!("could not write data point to InfluxDB: {}", e))
                })?;

                if !resp.status().is_success() {
                    return Err(Error::SinkTransient(format!(
                        "InfluxDB write returned status {}",
                        resp.status()
                    )));
                }
                Ok(())
            }
            InfluxConn::Udp(sock) => sock.send(line.as_bytes()).await.map(|_| ()).map_err(|e| {
                Error::SinkTransient(format!("could not write data point to InfluxDB: {}", e))
            }),
        }
    }
}

/// Escape measurement/tag characters significant to the line protocol.
fn escape_ident(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}
