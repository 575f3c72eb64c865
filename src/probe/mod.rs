//! Probe implementations.
//!
//! Supports simple HTTP timing probes, multi-step API probes, and
//! remote browser probes.

pub mod api;
pub mod browser;
pub mod placeholder;
pub mod timing;
pub mod webdriver;

use crate::config::{Cookie, JobEntry, StepEntry};

use std::collections::HashMap;
use std::time::Duration;

/// Everything needed to issue one probe request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub name: String,
    pub url: String,
    pub method: String,
    pub header: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub cookies: Vec<Cookie>,
    pub tags: HashMap<String, String>,
}

impl RequestSpec {
    pub fn from_job(job: &JobEntry) -> Self {
        Self {
            name: job.name.clone(),
            url: job.url.clone(),
            method: normalize_method(job.method.as_deref()),
            header: job.header.clone(),
            content_type: job.content_type.clone(),
            body: job.body.clone(),
            cookies: job.cookies.clone(),
            tags: job.tags.clone(),
        }
    }

    pub fn from_step(step: &StepEntry, job_tags: &HashMap<String, String>) -> Self {
        // Step tags layer on top of the job's merged tags.
        let mut tags = job_tags.clone();
        for (k, v) in &step.tags {
            tags.insert(k.clone(), v.clone());
        }

        Self {
            name: step.name.clone(),
            url: step.url.clone(),
            method: normalize_method(step.method.as_deref()),
            header: step.header.clone(),
            content_type: step.content_type.clone(),
            body: step.body.clone(),
            cookies: step.cookies.clone(),
            tags,
        }
    }
}

/// Shared HTTP client settings for all probes.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: String,
}

fn normalize_method(method: Option<&str>) -> String {
    match method {
        Some(m) if !m.is_empty() => m.to_uppercase(),
        _ => "GET".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_defaults_to_get() {
        assert_eq!(normalize_method(None), "GET");
        assert_eq!(normalize_method(Some("")), "GET");
        assert_eq!(normalize_method(Some("post")), "POST");
    }

    #[test]
    fn test_step_tags_override_job_tags() {
        let mut job_tags = HashMap::new();
        job_tags.insert("env".to_string(), "prod".to_string());
        job_tags.insert("team".to_string(), "web".to_string());

        let step = StepEntry {
            name: "s".to_string(),
            url: "http://x/".to_string(),
            tags: [("env".to_string(), "staging".to_string())].into(),
            ..Default::default()
        };

        let spec = RequestSpec::from_step(&step, &job_tags);
        assert_eq!(spec.tags["env"], "staging");
        assert_eq!(spec.tags["team"], "web");
    }
}
