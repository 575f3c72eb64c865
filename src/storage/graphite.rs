//! Graphite storage engine: plaintext protocol over TCP or UDP.

use crate::error::{Error, Result};
use crate::telemetry::Metric;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

#[derive(Debug, Clone, Deserialize)]
pub struct GraphiteConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(rename = "metric-namespace", default)]
    pub namespace: Option<String>,
}

enum GraphiteConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
    /// Dummy driver used when the backend was unreachable at startup.
    Nop,
}

pub struct GraphiteSink {
    conn: GraphiteConn,
    namespace: Option<String>,
    addr: String,
}

impl GraphiteSink {
    /// Connect to the configured Graphite endpoint. An unreachable
    /// backend degrades to a no-op driver rather than failing startup.
    pub async fn connect(cfg: &GraphiteConfig) -> Self {
        let addr = format!("{}:{}", cfg.host, cfg.port);

        let conn = match cfg.protocol.as_deref() {
            Some("udp") => match udp_connect(&addr).await {
                Ok(sock) => GraphiteConn::Udp(sock),
                Err(e) => {
                    tracing::warn!(
                        "could not create Graphite connection, using no-op dummy driver instead: {}",
                        e
                    );
                    GraphiteConn::Nop
                }
            },
            Some("nop") => GraphiteConn::Nop,
            _ => match TcpStream::connect(&addr).await {
                Ok(stream) => GraphiteConn::Tcp(stream),
                Err(e) => {
                    tracing::warn!(
                        "could not create Graphite connection, using no-op dummy driver instead: {}",
                        e
                    );
                    GraphiteConn::Nop
                }
            },
        };

        Self {
            conn,
            namespace: cfg.namespace.clone(),
            addr,
        }
    }

    fn metric_line(&self, m: &Metric) -> String {
        let prefix = self.namespace.as_deref().unwrap_or("ferrite");
        format!(
            "{}.{}.{} {:.3} {}\n",
            prefix,
            m.job,
            m.timing,
            m.value,
            m.timestamp.timestamp()
        )
    }

    pub async fn send_metric(&mut self, m: Metric) -> Result<()> {
        let line = self.metric_line(&m);

        let write_err = match &mut self.conn {
            GraphiteConn::Tcp(stream) => stream.write_all(line.as_bytes()).await.err(),
            GraphiteConn::Udp(sock) => sock.send(line.as_bytes()).await.err(),
            GraphiteConn::Nop => None,
        };

        if let Some(e) = write_err {
            // One reconnect attempt on a broken TCP stream; the record
            // is lost either way if writes keep failing.
            if matches!(self.conn, GraphiteConn::Tcp(_)) {
                if let Ok(fresh) = TcpStream::connect(&self.addr).await {
                    self.conn = GraphiteConn::Tcp(fresh);
                }
            }
            return Err(Error::SinkTransient(format!(
                "could not send metric {}: {}",
                m.timing, e
            )));
        }

        Ok(())
    }
}

async fn udp_connect(addr: &str) -> std::io::Result<UdpSocket> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(addr).await?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn sample_metric() -> Metric {
        Metric::new(
            "homepage",
            "http://example.test/",
            "dns_duration_milliseconds",
            12.5,
            chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            &HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_metric_line_default_namespace() {
        let cfg = GraphiteConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            protocol: Some("nop".to_string()),
            namespace: None,
        };
        let sink = GraphiteSink::connect(&cfg).await;
        assert_eq!(
            sink.metric_line(&sample_metric()),
            "ferrite.homepage.dns_duration_milliseconds 12.500 1714564800\n"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_nop() {
        let cfg = GraphiteConfig {
            host: "127.0.0.1".to_string(),
            // Reserved port that nothing listens on in tests.
            port: 9,
            protocol: None,
            namespace: Some("mon".to_string()),
        };
        let mut sink = GraphiteSink::connect(&cfg).await;
        // A no-op sink accepts records without error.
        assert!(sink.send_metric(sample_metric()).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_send() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            use tokio::io::AsyncReadExt;
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            String::from_utf8(buf).unwrap()
        });

        let cfg = GraphiteConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            protocol: Some("tcp".to_string()),
            namespace: Some("mon".to_string()),
        };
        let mut sink = GraphiteSink::connect(&cfg).await;
        sink.send_metric(sample_metric()).await.unwrap();
        drop(sink);

        let received = server.await.unwrap();
        assert!(received.starts_with("mon.homepage.dns_duration_milliseconds 12.500"));
    }
}
