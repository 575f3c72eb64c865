//! Telemetry record types.
//!
//! A `Metric` is a named timing sample; an `Event` is a status
//! observation. Both are immutable values that get copied through every
//! queue in the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// One timing sample observed by a probe.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    /// Name of the job that produced this sample.
    pub job: String,
    /// URL that was probed.
    pub url: String,
    /// Phase identifier, e.g. `dns_duration_milliseconds`.
    pub timing: String,
    /// Value in milliseconds.
    pub value: f64,
    /// The instant the phase completed, not the enqueue time.
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

impl Metric {
    pub fn new(
        job: &str,
        url: &str,
        timing: &str,
        value: f64,
        timestamp: DateTime<Utc>,
        tags: &HashMap<String, String>,
    ) -> Self {
        Self {
            job: job.to_string(),
            url: url.to_string(),
            timing: timing.to_string(),
            value,
            timestamp,
            tags: tags.clone(),
        }
    }
}

/// One status observation for a probe execution.
///
/// A `server_status` of 0 means the request never completed. 1xx-3xx is
/// healthy, 400 and up is unhealthy.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub server_status: u16,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

impl Event {
    pub fn new(name: &str, server_status: u16, tags: &HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            server_status,
            timestamp: Utc::now(),
            tags: tags.clone(),
        }
    }

    /// Whether this status should page: anything 400 and up.
    pub fn is_failure(&self) -> bool {
        self.server_status >= 400
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tags_never_null() {
        let e = Event::new("check", 200, &HashMap::new());
        assert!(e.tags.is_empty());
        assert_eq!(e.server_status, 200);
    }

    #[test]
    fn test_failure_threshold() {
        assert!(!Event::new("c", 200, &HashMap::new()).is_failure());
        assert!(!Event::new("c", 301, &HashMap::new()).is_failure());
        assert!(Event::new("c", 404, &HashMap::new()).is_failure());
        assert!(Event::new("c", 503, &HashMap::new()).is_failure());
        assert!(!Event::new("c", 0, &HashMap::new()).is_failure());
    }
}
