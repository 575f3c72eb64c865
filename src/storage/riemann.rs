//! Riemann storage engine.
//!
//! Speaks the Riemann TCP protocol directly: a 4-byte big-endian length
//! prefix followed by a protobuf `Msg` carrying events. Only the
//! handful of fields this agent produces are encoded, so the frames are
//! assembled by hand instead of pulling in a protobuf toolchain.

use crate::error::{Error, Result};
use crate::telemetry::{Event, Metric};

use serde::Deserialize;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Deserialize)]
pub struct RiemannConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "metric-namespace", default)]
    pub namespace: Option<String>,
}

pub struct RiemannSink {
    stream: TcpStream,
    namespace: Option<String>,
}

impl RiemannSink {
    /// Connect to the Riemann server. Unlike graphite there is no
    /// degraded mode: an unreachable server fails startup.
    pub async fn connect(cfg: &RiemannConfig) -> Result<Self> {
        let addr = format!("{}:{}", cfg.host, cfg.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::SinkFatal(format!("could not connect to Riemann server: {}", e)))?;

        Ok(Self {
            stream,
            namespace: cfg.namespace.clone(),
        })
    }

    fn service_name(&self, parts: &[&str]) -> String {
        let prefix = self.namespace.as_deref().unwrap_or("ferrite");
        let mut name = prefix.to_string();
        for p in parts {
            name.push('.');
            name.push_str(p);
        }
        name
    }

    pub async fn send_metric(&mut self, m: Metric) -> Result<()> {
        let frame = encode_msg(&RiemannEvent {
            service: self.service_name(&[&m.job, &m.timing]),
            state: None,
            metric: Some(m.value),
            attributes: &m.tags,
        });
        self.write_frame(&frame).await
    }

    pub async fn send_event(&mut self, e: Event) -> Result<()> {
        let state = if e.server_status > 0 && e.server_status < 400 {
            "ok"
        } else {
            "critical"
        };
        let frame = encode_msg(&RiemannEvent {
            service: self.service_name(&[&e.name]),
            state: Some(state),
            metric: Some(e.server_status as f64),
            attributes: &e.tags,
        });
        self.write_frame(&frame).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let transient = |e: std::io::Error| Error::SinkTransient(format!("Riemann send failed: {}", e));

        self.stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .map_err(transient)?;
        self.stream.write_all(frame).await.map_err(transient)?;

        // The server acknowledges with its own length-prefixed Msg; the
        // content is not inspected beyond draining it off the wire.
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.map_err(transient)?;
        let mut reply = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        self.stream.read_exact(&mut reply).await.map_err(transient)?;

        Ok(())
    }
}

struct RiemannEvent<'a> {
    service: String,
    state: Option<&'a str>,
    metric: Option<f64>,
    attributes: &'a HashMap<String, String>,
}

// Protobuf field numbers from the Riemann schema.
const EVENT_STATE: u8 = 2;
const EVENT_SERVICE: u8 = 3;
const EVENT_ATTRIBUTE: u8 = 9;
const EVENT_METRIC_D: u8 = 14;
const ATTRIBUTE_KEY: u8 = 1;
const ATTRIBUTE_VALUE: u8 = 2;
const MSG_EVENTS: u8 = 6;

fn encode_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn encode_len_delimited(buf: &mut Vec<u8>, field: u8, bytes: &[u8]) {
    buf.push((field << 3) | 2);
    encode_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_double(buf: &mut Vec<u8>, field: u8, v: f64) {
    buf.push((field << 3) | 1);
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_event(ev: &RiemannEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);

    if let Some(state) = ev.state {
        encode_len_delimited(&mut buf, EVENT_STATE, state.as_bytes());
    }
    encode_len_delimited(&mut buf, EVENT_SERVICE, ev.service.as_bytes());

    let mut attrs: Vec<(&String, &String)> = ev.attributes.iter().collect();
    attrs.sort();
    for (k, v) in attrs {
        let mut attr = Vec::with_capacity(k.len() + v.len() + 4);
        encode_len_delimited(&mut attr, ATTRIBUTE_KEY, k.as_bytes());
        encode_len_delimited(&mut attr, ATTRIBUTE_VALUE, v.as_bytes());
        encode_len_delimited(&mut buf, EVENT_ATTRIBUTE, &attr);
    }

    if let Some(metric) = ev.metric {
        encode_double(&mut buf, EVENT_METRIC_D, metric);
    }

    buf
}

fn encode_msg(ev: &RiemannEvent) -> Vec<u8> {
    let event = encode_event(ev);
    let mut msg = Vec::with_capacity(event.len() + 4);
    encode_len_delimited(&mut msg, MSG_EVENTS, &event);
    msg
}
