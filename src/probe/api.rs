//! API probe: a sequence of HTTP steps with placeholder substitution.
//!
//! Steps run strictly in order within one tick. Each step's response
//! body is stored in the response map under the step's name so later
//! steps can reference its JSON values. The map lives for exactly one
//! tick.

use crate::config::StepEntry;
use crate::error::Result;
use crate::probe::placeholder::{self, ResponseMap};
use crate::probe::timing;
use crate::probe::{HttpSettings, RequestSpec};
use crate::storage::Storage;

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Execute one tick of an API job. A failing step aborts the remainder
/// of this tick's sequence; the job itself continues on the next tick.
pub async fn run_sequence(
    job_name: &str,
    steps: &[StepEntry],
    job_tags: &HashMap<String, String>,
    settings: &HttpSettings,
    storage: &Storage,
    cancel: &CancellationToken,
) {
    let mut responses = ResponseMap::new();

    for step in steps {
        if let Err(e) = run_step(step, job_tags, settings, storage, cancel, &mut responses).await {
            tracing::warn!(
                "api job {}: step {} failed, aborting remaining steps: {}",
                job_name,
                step.name,
                e
            );
            return;
        }
    }
}

async fn run_step(
    step: &StepEntry,
    job_tags: &HashMap<String, String>,
    settings: &HttpSettings,
    storage: &Storage,
    cancel: &CancellationToken,
    responses: &mut ResponseMap,
) -> Result<()> {
    let mut spec = RequestSpec::from_step(step, job_tags);

    if let Some(body) = &spec.body {
        spec.body = Some(placeholder::resolve(body, responses)?);
    }

    let mut header = HashMap::with_capacity(spec.header.len());
    for (k, v) in &spec.header {
        header.insert(k.clone(), placeholder::resolve(v, responses)?);
    }
    spec.header = header;

    let body = timing::run_probe(&spec, settings, storage, cancel).await?;
    responses.insert(step.name.clone(), body);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal sequential HTTP stub: serves one canned response per
    /// connection and records each request's head and body.
    async fn stub_server(
        responses: Vec<&'static str>,
    ) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            for body in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                let _ = tx.send(request);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (addr, rx)
    }

    /// Read one full request: headers, then content-length worth of body.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return String::from_utf8_lossy(&buf).into_owned();
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
        let content_length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        String::from_utf8_lossy(&buf).into_owned()
    }

    fn settings() -> HttpSettings {
        HttpSettings {
            timeout: std::time::Duration::from_secs(5),
            user_agent: "ferrite/test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_two_step_sequence_with_placeholder() {
        let (addr, mut requests) = stub_server(vec![r#"{"token":"abc"}"#, "{}"]).await;

        let steps = vec![
            StepEntry {
                name: "step1".to_string(),
                url: format!("http://{}/auth", addr),
                method: Some("POST".to_string()),
                ..Default::default()
            },
            StepEntry {
                name: "step2".to_string(),
                url: format!("http://{}/use", addr),
                method: Some("POST".to_string()),
                body: Some(r#"{"t":"{{ step1.token }}"}"#.to_string()),
                ..Default::default()
            },
        ];

        let (storage, mut metric_rx, mut event_rx) = Storage::bounded(64);
        let cancel = CancellationToken::new();
        run_sequence("login", &steps, &HashMap::new(), &settings(), &storage, &cancel).await;

        let _first = requests.recv().await.unwrap();
        let second = requests.recv().await.unwrap();
        // The second request carries the substituted raw JSON value,
        // quotes included.
        assert!(second.ends_with(r#"{"t":""abc""}"#), "body was: {}", second);

        // One event and five http metrics per completed step.
        let mut events = 0;
        while event_rx.try_recv().is_ok() {
            events += 1;
        }
        assert_eq!(events, 2);

        let mut metrics = 0;
        while metric_rx.try_recv().is_ok() {
            metrics += 1;
        }
        assert_eq!(metrics, 10);
    }

    #[tokio::test]
    async fn test_placeholder_failure_aborts_sequence() {
        let (addr, mut requests) = stub_server(vec!["{}", "{}"]).await;

        let steps = vec![
            StepEntry {
                name: "one".to_string(),
                url: format!("http://{}/", addr),
                ..Default::default()
            },
            StepEntry {
                name: "two".to_string(),
                url: format!("http://{}/", addr),
                body: Some("{{ missing.key }}".to_string()),
                ..Default::default()
            },
        ];

        let (storage, _metric_rx, mut event_rx) = Storage::bounded(64);
        let cancel = CancellationToken::new();
        run_sequence("j", &steps, &HashMap::new(), &settings(), &storage, &cancel).await;

        // Only the first step reached the server.
        assert!(requests.recv().await.is_some());
        assert!(requests.try_recv().is_err());

        let mut events = 0;
        while event_rx.try_recv().is_ok() {
            events += 1;
        }
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_header_placeholders_resolved() {
        let (addr, mut requests) = stub_server(vec![r#"{"token":"xyz"}"#, "{}"]).await;

        let steps = vec![
            StepEntry {
                name: "auth".to_string(),
                url: format!("http://{}/auth", addr),
                ..Default::default()
            },
            StepEntry {
                name: "fetch".to_string(),
                url: format!("http://{}/fetch", addr),
                header: [(
                    "X-Auth".to_string(),
                    "{{ auth.token }}".to_string(),
                )]
                .into(),
                ..Default::default()
            },
        ];

        let (storage, _m, _e) = Storage::bounded(64);
        let cancel = CancellationToken::new();
        run_sequence("j", &steps, &HashMap::new(), &settings(), &storage, &cancel).await;

        let _first = requests.recv().await.unwrap();
        let second = requests.recv().await.unwrap();
        assert!(
            second.to_lowercase().contains("x-auth: \"xyz\""),
            "headers were: {}",
            second
        );
    }
}
