//! YAML configuration loading and validation.

use crate::error::{Error, Result};
use crate::storage::dogstatsd::DogstatsdConfig;
use crate::storage::graphite::GraphiteConfig;
use crate::storage::influxdb::InfluxDbConfig;
use crate::storage::log::LogConfig;
use crate::storage::pagerduty::PagerDutyConfig;
use crate::storage::prometheus::PrometheusConfig;
use crate::storage::riemann::RiemannConfig;
use crate::storage::splunk_hec::SplunkHecConfig;

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "ferrite/1.0";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
    #[serde(default)]
    pub selenium: SeleniumConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Instance-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(rename = "job-configuration-url", default)]
    pub job_configuration_url: Option<String>,
    #[serde(rename = "request-timeout", default)]
    pub request_timeout: Option<String>,
    #[serde(rename = "report-internal-metrics", default)]
    pub report_internal_metrics: bool,
    #[serde(rename = "internal-metrics-gathering-interval", default)]
    pub internal_metrics_gathering_interval: Option<u64>,
    #[serde(rename = "user-agent", default)]
    pub user_agent: Option<String>,
}

/// One probe as it appears in the config file. The `type` field
/// discriminates; the Job Manager materialises the typed shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    pub interval: u16,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(rename = "content-type", default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
}

/// One request within an API job's sequence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(rename = "content-type", default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
}

/// Cookie data from the job configuration, sent as a `Cookie` header by
/// HTTP probes and injected through the driver by browser probes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub expiry: Option<u64>,
}

/// Serialise cookies for a `Cookie` request header. Metadata is not
/// sent in the header form.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Remote browser-automation service settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeleniumConfig {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "job-stagger-offset", default)]
    pub job_stagger_offset: i32,
}

/// Storage backends. Presence of a sub-section activates the backend;
/// more than one may be active at once.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub graphite: Option<GraphiteConfig>,
    #[serde(default)]
    pub influxdb: Option<InfluxDbConfig>,
    #[serde(default)]
    pub dogstatsd: Option<DogstatsdConfig>,
    #[serde(default)]
    pub prometheus: Option<PrometheusConfig>,
    #[serde(default)]
    pub riemann: Option<RiemannConfig>,
    #[serde(default)]
    pub pagerduty: Option<PagerDutyConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(rename = "splunk-hec", default)]
    pub splunk_hec: Option<SplunkHecConfig>,
}

/// Shape of a remotely fetched job list.
#[derive(Debug, Clone, Deserialize)]
struct JobListDoc {
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("could not read {}: {}", path, e)))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)
            .map_err(|e| Error::ConfigInvalid(format!("could not parse YAML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() && self.general.job_configuration_url.is_none() {
            return Err(Error::ConfigInvalid("no jobs were configured".to_string()));
        }

        for job in &self.jobs {
            validate_job(job)?;
        }

        if let Some(t) = &self.general.request_timeout {
            parse_duration(t)?;
        }

        Ok(())
    }

    /// The per-request timeout for every HTTP client, default 15s.
    pub fn request_timeout(&self) -> Result<Duration> {
        match &self.general.request_timeout {
            Some(t) => parse_duration(t),
            None => Ok(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn user_agent(&self) -> String {
        self.general
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

/// Structural checks that apply to any probe entry regardless of kind.
/// Unknown kinds are reported later, when the Job Manager materialises
/// the typed job.
pub fn validate_job(job: &JobEntry) -> Result<()> {
    if job.name.is_empty() {
        return Err(Error::ConfigInvalid("job with empty name".to_string()));
    }

    if job.interval == 0 {
        return Err(Error::ConfigInvalid(format!(
            "job {}: interval must be greater than zero",
            job.name
        )));
    }

    if job.kind == "api" {
        if job.steps.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "api job {} has no steps",
                job.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for s in &job.steps {
            if s.name.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "api job {} has a step with an empty name",
                    job.name
                )));
            }
            if !seen.insert(s.name.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "api job {}: duplicate step name {}",
                    job.name, s.name
                )));
            }
        }
    } else if job.url.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "job {} has no url",
            job.name
        )));
    }

    Ok(())
}

/// Fetch a supplemental job list from a remote YAML document. Called
/// once at startup when `general.job-configuration-url` is set; any
/// failure is fatal like a local configuration error.
pub async fn fetch_job_configuration(url: &str, timeout: Duration) -> Result<Vec<JobEntry>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::ConfigInvalid(format!("could not build HTTP client: {}", e)))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::ConfigInvalid(format!("could not fetch job configuration: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(Error::ConfigInvalid(format!(
            "job configuration fetch returned status {}",
            status
        )));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| Error::ConfigInvalid(format!("could not read job configuration: {}", e)))?;

    let doc: JobListDoc = serde_yaml::from_str(&body)
        .map_err(|e| Error::ConfigInvalid(format!("could not parse job configuration: {}", e)))?;

    for job in &doc.jobs {
        validate_job(job)?;
    }

    Ok(doc.jobs)
}

/// Parse a Go-style duration string: one or more `<number><unit>`
/// segments where unit is `ms`, `s`, `m`, or `h`, e.g. "15s" or "1m30s".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let err = || Error::ConfigInvalid(format!("could not parse duration {:?}", s));

    if s.is_empty() {
        return Err(err());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(err());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| err())?;
        rest = &rest[digits..];

        let (unit_ms, unit_len) = if rest.starts_with("ms") {
            (1, 2)
        } else if rest.starts_with('s') {
            (1_000, 1)
        } else if rest.starts_with('m') {
            (60_000, 1)
        } else if rest.starts_with('h') {
            (3_600_000, 1)
        } else {
            return Err(err());
        };
        rest = &rest[unit_len..];

        total += Duration::from_millis(value * unit_ms);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
general:
  tags:
    region: us-east-1
  request-timeout: 10s
  report-internal-metrics: true
  internal-metrics-gathering-interval: 30
jobs:
  - name: homepage
    type: simple
    url: https://example.com/
    interval: 30
    tags:
      team: web
  - name: login-flow
    type: api
    interval: 60
    steps:
      - name: auth
        url: https://example.com/api/auth
        method: POST
        content-type: application/json
        body: '{"user":"u","pass":"p"}'
      - name: profile
        url: https://example.com/api/me
        header:
          Authorization: 'Bearer {{ auth.token }}'
selenium:
  url: http://localhost:4444/wd/hub
  job-stagger-offset: 10
storage:
  prometheus:
    listen-addr: 127.0.0.1:9100
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.jobs.len(), 2);
        assert_eq!(cfg.jobs[0].kind, "simple");
        assert_eq!(cfg.jobs[1].steps.len(), 2);
        assert_eq!(cfg.request_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(cfg.selenium.job_stagger_offset, 10);
        assert!(cfg.storage.prometheus.is_some());
        assert!(cfg.storage.graphite.is_none());
        assert_eq!(cfg.user_agent(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_no_jobs_rejected() {
        let err = Config::from_yaml("general:\n  tags: {}\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let raw = "jobs:\n  - name: j\n    type: simple\n    url: http://x/\n    interval: 0\n";
        assert!(Config::from_yaml(raw).is_err());
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let raw = r#"
jobs:
  - name: j
    type: api
    interval: 5
    steps:
      - name: a
        url: http://x/
      - name: a
        url: http://y/
"#;
        assert!(Config::from_yaml(raw).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_cookie_header() {
        let cookies = vec![
            Cookie {
                name: "session".to_string(),
                value: "abc123".to_string(),
                ..Default::default()
            },
            Cookie {
                name: "theme".to_string(),
                value: "dark".to_string(),
                ..Default::default()
            },
        ];
        assert_eq!(cookie_header(&cookies), "session=abc123; theme=dark");
        assert_eq!(cookie_header(&[]), "");
    }
}
