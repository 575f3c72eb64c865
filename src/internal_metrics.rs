//! Periodic sampling of the agent's own runtime counters.

use crate::storage::Storage;
use crate::telemetry::Metric;

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;

const INTERNAL_JOB_NAME: &str = "ferrite-process";
pub const DEFAULT_GATHERING_INTERVAL: u64 = 15;

/// Sample process counters every `interval` and report them as
/// metrics until cancelled.
pub async fn run(interval: Duration, storage: Storage, cancel: CancellationToken) {
    let mut system = System::new();
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(e) => {
            tracing::error!("internal metrics disabled, could not determine pid: {}", e);
            return;
        }
    };

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + interval,
        interval,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                let Some(process) = system.process(pid) else {
                    continue;
                };

                let samples = [
                    ("mem.resident_bytes", process.memory() as f64),
                    ("mem.virtual_bytes", process.virtual_memory() as f64),
                    ("cpu.percent", process.cpu_usage() as f64),
                    (
                        "num_tasks",
                        tokio::runtime::Handle::current().metrics().num_alive_tasks() as f64,
                    ),
                ];

                for (timing, value) in samples {
                    storage.record_metric(internal_metric(timing, value)).await;
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("cancellation received, stopping internal metrics");
                return;
            }
        }
    }
}

fn internal_metric(timing: &str, value: f64) -> Metric {
    Metric::new(
        INTERNAL_JOB_NAME,
        "",
        timing,
        value,
        Utc::now(),
        &HashMap::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_samples_per_tick() {
        let (storage, mut metric_rx, _e) = Storage::bounded(32);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            Duration::from_millis(20),
            storage,
            cancel.clone(),
        ));

        let first = tokio::time::timeout(Duration::from_secs(2), metric_rx.recv())
            .await
            .expect("no internal metric arrived")
            .unwrap();
        assert_eq!(first.job, INTERNAL_JOB_NAME);

        // One full sample set per tick.
        let mut timings = vec![first.timing];
        for _ in 0..3 {
            timings.push(metric_rx.recv().await.unwrap().timing);
        }
        assert!(timings.contains(&"mem.resident_bytes".to_string()));
        assert!(timings.contains(&"num_tasks".to_string()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sampler did not stop")
            .unwrap();
    }
}
