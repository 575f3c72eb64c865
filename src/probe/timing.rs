//! HTTP timing probe.
//!
//! Issues one request over a hand-assembled connection so that every
//! phase boundary is observable: DNS resolution, TCP connect, TLS
//! handshake, first response byte, body close. Connection reuse is
//! impossible by construction, which keeps the connect and handshake
//! phases honest on every tick.

use crate::error::{Error, Result};
use crate::probe::{HttpSettings, RequestSpec};
use crate::storage::Storage;
use crate::telemetry::{Event, Metric};

use chrono::{DateTime, Utc};
use http::{HeaderName, HeaderValue, Request};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Phase boundary timestamps for one request.
///
/// t0: DNS resolution begins (equal to t1 when DNS was skipped)
/// t1: DNS complete, connect begins
/// t2: TCP connect complete
/// t3: connection handed to the HTTP machinery (post-TLS on https)
/// t4: first response byte
/// t5: response body closed
#[derive(Debug, Clone)]
pub struct PhaseMarks {
    started_at: DateTime<Utc>,
    pub t0: Instant,
    pub t1: Instant,
    pub t2: Instant,
    pub t3: Instant,
    pub t4: Instant,
    pub t5: Instant,
    pub tls: bool,
}

impl PhaseMarks {
    /// Wall-clock instant at which a phase mark was captured.
    fn wall(&self, t: Instant) -> DateTime<Utc> {
        self.started_at
            + chrono::Duration::from_std(t.duration_since(self.t0)).unwrap_or_default()
    }
}

fn millis(from: Instant, to: Instant) -> f64 {
    to.duration_since(from).as_secs_f64() * 1000.0
}

/// Outcome of a timed request.
#[derive(Debug)]
pub struct TimedResponse {
    pub status: u16,
    pub body: String,
    pub marks: PhaseMarks,
}

/// Issue the request described by `spec`, record the phase marks, emit
/// one event and the derived metrics, and return the raw response body.
pub async fn run_probe(
    spec: &RequestSpec,
    settings: &HttpSettings,
    storage: &Storage,
    cancel: &CancellationToken,
) -> Result<String> {
    let resp = fetch_timed(spec, settings, cancel).await?;

    storage
        .record_event(Event::new(&spec.name, resp.status, &spec.tags))
        .await;

    for metric in derive_metrics(spec, &resp.marks) {
        storage.record_metric(metric).await;
    }

    Ok(resp.body)
}

/// Issue one request and capture its phase marks. The configured
/// timeout covers the whole exchange; cancellation aborts mid-flight.
pub async fn fetch_timed(
    spec: &RequestSpec,
    settings: &HttpSettings,
    cancel: &CancellationToken,
) -> Result<TimedResponse> {
    let url = url::Url::parse(&spec.url).map_err(|e| Error::ProbeMalformedUrl {
        url: spec.url.clone(),
        reason: e.to_string(),
    })?;

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::ProbeTransport("request cancelled".to_string())),
        res = tokio::time::timeout(settings.timeout, attempt(spec, &url, settings)) => match res {
            Ok(r) => r,
            Err(_) => Err(Error::ProbeTransport(format!(
                "request to {} timed out after {:?}",
                spec.url, settings.timeout
            ))),
        },
    }
}

async fn attempt(
    spec: &RequestSpec,
    url: &url::Url,
    settings: &HttpSettings,
) -> Result<TimedResponse> {
    let tls = match url.scheme() {
        "https" => true,
        "http" => false,
        other => {
            return Err(Error::ProbeMalformedUrl {
                url: spec.url.clone(),
                reason: format!("unsupported scheme {:?}", other),
            })
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| Error::ProbeMalformedUrl {
            url: spec.url.clone(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

    let started_at = Utc::now();

    // DNS phase. Skipped entirely for IP-literal hosts, in which case
    // t0 collapses onto t1.
    let (t0, t1, addr) = if let Ok(ip) = host.parse::<IpAddr>() {
        let now = Instant::now();
        (now, now, SocketAddr::new(ip, port))
    } else {
        let t0 = Instant::now();
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| Error::ProbeTransport(format!("DNS lookup of {} failed: {}", host, e)))?
            .next()
            .ok_or_else(|| {
                Error::ProbeTransport(format!("DNS lookup of {} returned no addresses", host))
            })?;
        (t0, Instant::now(), addr)
    };

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::ProbeTransport(format!("connect to {} failed: {}", addr, e)))?;
    let t2 = Instant::now();

    let req = build_request(spec, url, &host, port, settings)?;

    let (status, body, t3, t4, t5) = if tls {
        let connector = tls_connector();
        let server_name = ServerName::try_from(host.clone()).map_err(|e| {
            Error::ProbeMalformedUrl {
                url: spec.url.clone(),
                reason: format!("invalid TLS server name: {}", e),
            }
        })?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::ProbeTransport(format!("TLS handshake with {} failed: {}", host, e)))?;
        let t3 = Instant::now();
        let (status, body, t4, t5) = exchange(stream, req).await?;
        (status, body, t3, t4, t5)
    } else {
        let t3 = Instant::now();
        let (status, body, t4, t5) = exchange(stream, req).await?;
        (status, body, t3, t4, t5)
    };

    Ok(TimedResponse {
        status,
        body,
        marks: PhaseMarks {
            started_at,
            t0,
            t1,
            t2,
            t3,
            t4,
            t5,
            tls,
        },
    })
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn build_request(
    spec: &RequestSpec,
    url: &url::Url,
    host: &str,
    port: u16,
    settings: &HttpSettings,
) -> Result<Request<Full<Bytes>>> {
    let transport = |e: String| Error::ProbeTransport(e);

    let method = http::Method::from_bytes(spec.method.as_bytes())
        .map_err(|e| transport(format!("invalid method {:?}: {}", spec.method, e)))?;

    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };

    let host_header = if url.port().is_some() && Some(port) != default_port(url.scheme()) {
        format!("{}:{}", host, port)
    } else {
        host.to_string()
    };

    let mut builder = Request::builder().method(method).uri(path);
    builder = builder.header(http::header::HOST, host_header);

    for (k, v) in &spec.header {
        let name = HeaderName::try_from(k.as_str())
            .map_err(|e| transport(format!("invalid header name {:?}: {}", k, e)))?;
        let value = HeaderValue::try_from(v.as_str())
            .map_err(|e| transport(format!("invalid header value for {:?}: {}", k, e)))?;
        builder = builder.header(name, value);
    }

    if let Some(ct) = &spec.content_type {
        let value = HeaderValue::try_from(ct.as_str())
            .map_err(|e| transport(format!("invalid content type {:?}: {}", ct, e)))?;
        builder = builder.header(http::header::CONTENT_TYPE, value);
    }

    if !spec.cookies.is_empty() {
        let value = HeaderValue::try_from(crate::config::cookie_header(&spec.cookies))
            .map_err(|e| transport(format!("invalid cookie value: {}", e)))?;
        builder = builder.header(http::header::COOKIE, value);
    }

    let has_user_agent = spec
        .header
        .keys()
        .any(|k| k.eq_ignore_ascii_case("user-agent"));
    if !has_user_agent {
        let value = HeaderValue::try_from(settings.user_agent.as_str())
            .map_err(|e| transport(format!("invalid user agent: {}", e)))?;
        builder = builder.header(http::header::USER_AGENT, value);
    }

    let body = Bytes::from(spec.body.clone().unwrap_or_default());

    builder
        .body(Full::new(body))
        .map_err(|e| transport(format!("could not build request: {}", e)))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Send the request over an established stream and read the full body.
async fn exchange<S>(
    stream: S,
    req: Request<Full<Bytes>>,
) -> Result<(u16, String, Instant, Instant)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let transport = |e: String| Error::ProbeTransport(e);

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| transport(format!("HTTP handshake failed: {}", e)))?;
    let driver = tokio::spawn(conn);

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| transport(format!("request failed: {}", e)))?;
    let t4 = Instant::now();

    let status = resp.status().as_u16();
    let collected = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| transport(format!("failed to read response body: {}", e)))?;
    let t5 = Instant::now();

    drop(sender);
    driver.abort();

    let body = String::from_utf8_lossy(&collected.to_bytes()).into_owned();
    Ok((status, body, t4, t5))
}

/// Derive the per-phase metrics from the captured marks. An https
/// request yields six samples, plain http five. Emission order keeps
/// metric timestamps non-decreasing.
pub fn derive_metrics(spec: &RequestSpec, marks: &PhaseMarks) -> Vec<Metric> {
    let m = |timing: &str, from: Instant, to: Instant, at: Instant| {
        Metric::new(
            &spec.name,
            &spec.url,
            timing,
            millis(from, to),
            marks.wall(at),
            &spec.tags,
        )
    };

    if marks.tls {
        vec![
            m("dns_duration_milliseconds", marks.t0, marks.t1, marks.t1),
            m("server_connection_duration_milliseconds", marks.t1, marks.t2, marks.t2),
            m("tls_handshake_duration_milliseconds", marks.t2, marks.t3, marks.t3),
            m("server_processing_duration_milliseconds", marks.t3, marks.t4, marks.t4),
            m("time_to_first_byte_milliseconds", marks.t0, marks.t4, marks.t4),
            m("server_response_duration_milliseconds", marks.t4, marks.t5, marks.t5),
        ]
    } else {
        vec![
            m("dns_duration_milliseconds", marks.t0, marks.t1, marks.t1),
            m("server_connection_duration_milliseconds", marks.t1, marks.t3, marks.t3),
            m("server_processing_duration_milliseconds", marks.t3, marks.t4, marks.t4),
            m("time_to_first_byte_milliseconds", marks.t0, marks.t4, marks.t4),
            m("server_response_duration_milliseconds", marks.t4, marks.t5, marks.t5),
        ]
    }
}
