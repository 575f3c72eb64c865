//! Job construction and supervision.

use crate::config::{Config, JobEntry};
use crate::error::{Error, Result};
use crate::job::{Job, JobContext, JobKind};
use crate::probe::{HttpSettings, RequestSpec};
use crate::storage::Storage;

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owns every job: builds them from config, starts one task per job,
/// and waits for the tasks to drain after cancellation.
pub struct JobManager {
    jobs: Vec<Job>,
    ctx: JobContext,
    tasks: JoinSet<()>,
}

impl JobManager {
    /// Materialise a typed job for every configured probe. An entry
    /// with an unknown kind is a fatal configuration error.
    pub fn build(cfg: &Config, storage: Storage, cancel: CancellationToken) -> Result<Self> {
        let settings = HttpSettings {
            timeout: cfg.request_timeout()?,
            user_agent: cfg.user_agent(),
        };

        let mut jobs = Vec::with_capacity(cfg.jobs.len());
        for entry in &cfg.jobs {
            jobs.push(build_job(entry, &cfg.general.tags)?);
        }

        Ok(Self {
            jobs,
            ctx: JobContext {
                storage,
                settings,
                selenium_url: cfg.selenium.url.clone(),
                stagger_offset: cfg.selenium.job_stagger_offset,
                cancel,
            },
            tasks: JoinSet::new(),
        })
    }

    /// Launch every job on its own task.
    pub fn start(&mut self) {
        tracing::info!("starting {} job(s)", self.jobs.len());
        for job in self.jobs.drain(..) {
            tracing::info!("launching job {}", job.name);
            self.tasks.spawn(job.run(self.ctx.clone()));
        }
    }

    /// Block until every job task has exited. A panicking job is
    /// reported without affecting its peers.
    pub async fn wait(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!("job task panicked: {}", e);
                }
            }
        }
    }
}

fn build_job(entry: &JobEntry, global_tags: &HashMap<String, String>) -> Result<Job> {
    let mut tags = merge_tags(&entry.tags, global_tags);
    add_automatic_tags(&mut tags, entry);

    let kind = match entry.kind.as_str() {
        "simple" => {
            let mut spec = RequestSpec::from_job(entry);
            spec.tags = tags.clone();
            JobKind::Simple(spec)
        }
        "api" => JobKind::Api {
            steps: entry.steps.clone(),
        },
        "selenium" => JobKind::Browser {
            url: entry.url.clone(),
            cookies: entry.cookies.clone(),
        },
        other => {
            return Err(Error::ConfigInvalid(format!(
                "job {} has unknown type {:?}",
                entry.name, other
            )))
        }
    };

    Ok(Job {
        name: entry.name.clone(),
        interval: Duration::from_secs(u64::from(entry.interval)),
        tags,
        kind,
    })
}

/// Merge job tags over global tags: a key set on the job always wins,
/// every key from either side appears, and empty inputs produce an
/// empty map rather than nothing.
pub fn merge_tags(
    job_tags: &HashMap<String, String>,
    global_tags: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = HashMap::with_capacity(job_tags.len() + global_tags.len());

    for (k, v) in job_tags {
        merged.insert(k.clone(), v.clone());
    }

    for (k, v) in global_tags {
        merged.entry(k.clone()).or_insert_with(|| v.clone());
    }

    merged
}

/// Tags the agent adds to every record of a job. Underscore names so
/// they survive as Prometheus label names.
fn add_automatic_tags(tags: &mut HashMap<String, String>, entry: &JobEntry) {
    if let Ok(parsed) = url::Url::parse(&entry.url) {
        if let Some(host) = parsed.host_str() {
            tags.insert("ferrite_job_hostname".to_string(), host.to_string());
        }
    }
    tags.insert("ferrite_job_type".to_string(), entry.kind.clone());
}
