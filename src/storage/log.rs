//! Log-file storage engine.
//!
//! Writes template-formatted lines for metrics and events to stdout,
//! stderr, or a file. Metric templates understand `%time`, `%job`,
//! `%timing`, `%value`, `%url`, `%tags`; event templates `%time`,
//! `%name`, `%status`, `%tags`. Tags are rendered through their own
//! `%name`/`%value` template joined by a separator.

use crate::error::{Error, Result};
use crate::telemetry::{Event, Metric};

use chrono::{DateTime, Local, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub file: String,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub time: TimeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatConfig {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(rename = "tag-separator", default)]
    pub tag_separator: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeConfig {
    /// "Local" (default) or "UTC".
    #[serde(default)]
    pub location: Option<String>,
    /// chrono format string, default "%Y/%m/%d %H:%M:%S".
    #[serde(default)]
    pub format: Option<String>,
}

enum LogStream {
    Stdout(tokio::io::Stdout),
    Stderr(tokio::io::Stderr),
    File(tokio::fs::File),
}

enum Location {
    Local,
    Utc,
}

pub struct LogSink {
    stream: LogStream,
    metric_format: String,
    event_format: String,
    tag_format: String,
    tag_separator: String,
    time_format: String,
    location: Location,
}

impl LogSink {
    pub async fn open(cfg: &LogConfig) -> Result<Self> {
        let stream = match cfg.file.as_str() {
            "stdout" => LogStream::Stdout(tokio::io::stdout()),
            "stderr" => LogStream::Stderr(tokio::io::stderr()),
            path => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| {
                        Error::SinkFatal(format!("could not open log file {}: {}", path, e))
                    })?;
                LogStream::File(file)
            }
        };

        let location = match cfg.time.location.as_deref() {
            None | Some("Local") | Some("") => Location::Local,
            Some("UTC") => Location::Utc,
            Some(other) => {
                return Err(Error::SinkFatal(format!(
                    "unsupported log time location {:?} (use Local or UTC)",
                    other
                )))
            }
        };

        Ok(Self {
            stream,
            metric_format: cfg
                .format
                .metric
                .clone()
                .unwrap_or_else(|| "%time [M: %job] %timing: %value (%tags)\n".to_string()),
            event_format: cfg
                .format
                .event
                .clone()
                .unwrap_or_else(|| "%time [E: %name] status: %status (%tags)\n".to_string()),
            tag_format: cfg
                .format
                .tag
                .clone()
                .unwrap_or_else(|| "%name: %value".to_string()),
            tag_separator: cfg
                .format
                .tag_separator
                .clone()
                .unwrap_or_else(|| ", ".to_string()),
            time_format: cfg
                .time
                .format
                .clone()
                .unwrap_or_else(|| "%Y/%m/%d %H:%M:%S".to_string()),
            location,
        })
    }

    fn format_time(&self, t: DateTime<Utc>) -> String {
        match self.location {
            Location::Local => t.with_timezone(&Local).format(&self.time_format).to_string(),
            Location::Utc => t.format(&self.time_format).to_string(),
        }
    }

    fn format_tags(&self, tags: &HashMap<String, String>) -> String {
        if tags.is_empty() {
            return String::new();
        }

        let mut sorted: Vec<(&String, &String)> = tags.iter().collect();
        sorted.sort();
        sorted
            .iter()
            .map(|(name, value)| {
                self.tag_format
                    .replace("%name", name)
                    .replace("%value", value)
            })
            .collect::<Vec<_>>()
            .join(&self.tag_separator)
    }

    fn format_metric(&self, m: &Metric) -> String {
        self.metric_format
            .replace("%time", &self.format_time(m.timestamp))
            .replace("%job", &m.job)
            .replace("%timing", &m.timing)
            .replace("%value", &format_significant(m.value, 6))
            .replace("%url", &m.url)
            .replace("%tags", &self.format_tags(&m.tags))
    }

    fn format_event(&self, e: &Event) -> String {
        self.event_format
            .replace("%time", &self.format_time(e.timestamp))
            .replace("%name", &e.name)
            .replace("%status", &e.server_status.to_string())
            .replace("%tags", &self.format_tags(&e.tags))
    }

    pub async fn send_metric(&mut self, m: Metric) -> Result<()> {
        let line = self.format_metric(&m);
        self.write(line.as_bytes()).await
    }

    pub async fn send_event(&mut self, e: Event) -> Result<()> {
        let line = self.format_event(&e);
        self.write(line.as_bytes()).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let res = match &mut self.stream {
            LogStream::Stdout(s) => s.write_all(bytes).await,
            LogStream::Stderr(s) => s.write_all(bytes).await,
            LogStream::File(f) => f.write_all(bytes).await,
        };
        res.map_err(|e| Error::SinkTransient(format!("could not write log line: {}", e)))
    }
}

/// Format a float with the given number of significant digits, with
/// trailing zeros trimmed, like printf's %g.
fn format_significant(value: f64, digits: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }

    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= digits as i32 {
        let s = format!("{:.*e}", digits.saturating_sub(1), value);
        return trim_exp_zeros(&s);
    }

    let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
    let s = format!("{:.*}", decimals, value);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

fn trim_exp_zeros(s: &str) -> String {
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let mantissa = if mantissa.contains('.') {
                mantissa.trim_end_matches('0').trim_end_matches('.')
            } else {
                mantissa
            };
            format!("{}e{}", mantissa, exp)
        }
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn utc_sink(file: &str) -> LogSink {
        let cfg = LogConfig {
            file: file.to_string(),
            format: FormatConfig::default(),
            time: TimeConfig {
                location: Some("UTC".to_string()),
                format: None,
            },
        };
        LogSink::open(&cfg).await.unwrap()
    }

    fn metric() -> Metric {
        Metric::new(
            "homepage",
            "http://example.test/",
            "dns_duration_milliseconds",
            12.34567891,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            &[("env".to_string(), "prod".to_string())].into(),
        )
    }

    #[tokio::test]
    async fn test_metric_line_default_template() {
        let sink = utc_sink("stdout").await;
        assert_eq!(
            sink.format_metric(&metric()),
            "2024/05/01 12:00:00 [M: homepage] dns_duration_milliseconds: 12.3457 (env: prod)\n"
        );
    }

    #[tokio::test]
    async fn test_event_line_default_template() {
        let sink = utc_sink("stdout").await;
        let mut e = Event::new("homepage", 503, &HashMap::new());
        e.timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            sink.format_event(&e),
            "2024/05/01 12:00:00 [E: homepage] status: 503 ()\n"
        );
    }

    #[tokio::test]
    async fn test_multiple_tags_joined() {
        let sink = utc_sink("stdout").await;
        let tags = [
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]
        .into();
        assert_eq!(sink.format_tags(&tags), "a: 1, b: 2");
    }

    #[tokio::test]
    async fn test_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.log");
        let mut sink = utc_sink(path.to_str().unwrap()).await;

        sink.send_metric(metric()).await.unwrap();
        sink.send_event(Event::new("homepage", 200, &HashMap::new()))
            .await
            .unwrap();
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("[M: homepage]"));
        assert!(contents.contains("status: 200"));
    }

    #[test]
    fn test_format_significant() {
        assert_eq!(format_significant(12.34567891, 6), "12.3457");
        assert_eq!(format_significant(0.0, 6), "0");
        assert_eq!(format_significant(1500.0, 6), "1500");
        assert_eq!(format_significant(0.000123456, 6), "0.000123456");
        assert_eq!(format_significant(1234567.0, 6), "1.23457e6");
    }
}
