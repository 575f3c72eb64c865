//! Telemetry delivery: two global inboxes, a fan-out dispatcher, and
//! one engine task per configured backend.
//!
//! The dispatcher forwards each record to every engine whose capability
//! matches the record kind. A full engine queue blocks the dispatcher;
//! that backpressure is intentional — monitoring data is not silently
//! dropped mid-pipeline, producers stall at the inboxes instead.

pub mod dogstatsd;
pub mod graphite;
pub mod influxdb;
pub mod log;
pub mod pagerduty;
pub mod prometheus;
pub mod riemann;
pub mod splunk_hec;

use crate::config::Config;
use crate::error::Result;
use crate::telemetry::{Event, Metric};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const INBOX_CAPACITY: usize = 20;
pub const ENGINE_QUEUE_CAPACITY: usize = 10;

/// Handle that probes use to submit telemetry. Cheap to clone; every
/// record is value-copied into the pipeline.
#[derive(Debug, Clone)]
pub struct Storage {
    metric_tx: mpsc::Sender<Metric>,
    event_tx: mpsc::Sender<Event>,
}

impl Storage {
    /// Create a handle plus the inbox receivers the dispatcher drains.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Metric>, mpsc::Receiver<Event>) {
        let (metric_tx, metric_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            Self {
                metric_tx,
                event_tx,
            },
            metric_rx,
            event_rx,
        )
    }

    /// Submit a metric. Blocks while the inbox is full.
    pub async fn record_metric(&self, metric: Metric) {
        if self.metric_tx.send(metric).await.is_err() {
            tracing::debug!("metric dropped: storage pipeline has shut down");
        }
    }

    /// Submit an event. Blocks while the inbox is full.
    pub async fn record_event(&self, event: Event) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("event dropped: storage pipeline has shut down");
        }
    }
}

/// A configured backend. The dispatcher switches on the capability
/// descriptor; the engine task switches on the variant.
pub enum Sink {
    Graphite(graphite::GraphiteSink),
    InfluxDb(influxdb::InfluxDbSink),
    Dogstatsd(dogstatsd::DogstatsdSink),
    Prometheus(prometheus::PrometheusSink),
    Riemann(riemann::RiemannSink),
    PagerDuty(pagerduty::PagerDutySink),
    Log(log::LogSink),
    SplunkHec(splunk_hec::SplunkHecSink),
}

impl Sink {
    pub fn name(&self) -> &'static str {
        match self {
            Sink::Graphite(_) => "graphite",
            Sink::InfluxDb(_) => "influxdb",
            Sink::Dogstatsd(_) => "dogstatsd",
            Sink::Prometheus(_) => "prometheus",
            Sink::Riemann(_) => "riemann",
            Sink::PagerDuty(_) => "pagerduty",
            Sink::Log(_) => "log",
            Sink::SplunkHec(_) => "splunk-hec",
        }
    }

    pub fn accepts_metrics(&self) -> bool {
        !matches!(self, Sink::PagerDuty(_))
    }

    pub fn accepts_events(&self) -> bool {
        matches!(
            self,
            Sink::Dogstatsd(_) | Sink::Riemann(_) | Sink::PagerDuty(_) | Sink::Log(_) | Sink::SplunkHec(_)
        )
    }

    async fn send_metric(&mut self, metric: Metric) -> Result<()> {
        match self {
            Sink::Graphite(s) => s.send_metric(metric).await,
            Sink::InfluxDb(s) => s.send_metric(metric).await,
            Sink::Dogstatsd(s) => s.send_metric(metric).await,
            Sink::Prometheus(s) => s.send_metric(metric),
            Sink::Riemann(s) => s.send_metric(metric).await,
            Sink::PagerDuty(_) => Ok(()),
            Sink::Log(s) => s.send_metric(metric).await,
            Sink::SplunkHec(s) => s.send_metric(metric).await,
        }
    }

    async fn send_event(&mut self, event: Event) -> Result<()> {
        match self {
            Sink::Dogstatsd(s) => s.send_event(event).await,
            Sink::Riemann(s) => s.send_event(event).await,
            Sink::PagerDuty(s) => s.send_event(event).await,
            Sink::Log(s) => s.send_event(event).await,
            Sink::SplunkHec(s) => s.send_event(event).await,
            _ => Ok(()),
        }
    }
}

/// Inbound queues of one engine, as seen by the dispatcher. A missing
/// sender means the engine does not accept that record kind.
struct EngineHandle {
    name: &'static str,
    metric_tx: Option<mpsc::Sender<Metric>>,
    event_tx: Option<mpsc::Sender<Event>>,
}

/// Owns the dispatcher and engine tasks.
pub struct StorageRuntime {
    tasks: JoinSet<()>,
}

impl StorageRuntime {
    /// Wait for the dispatcher and every engine to exit. Call after the
    /// root scope has been cancelled.
    pub async fn wait(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!("storage task panicked: {}", e);
                }
            }
        }
    }
}

/// Build every configured engine, start its task, and start the
/// dispatcher. Engines that cannot reach their backend either degrade
/// to a no-op (graphite) or fail startup (riemann).
pub async fn start(
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<(Storage, StorageRuntime)> {
    let (storage, metric_rx, event_rx) = Storage::bounded(INBOX_CAPACITY);
    let mut tasks = JoinSet::new();
    let mut engines = Vec::new();

    if let Some(c) = &cfg.storage.graphite {
        let sink = Sink::Graphite(graphite::GraphiteSink::connect(c).await);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.influxdb {
        let sink = Sink::InfluxDb(influxdb::InfluxDbSink::new(c, cfg.request_timeout()?).await?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.dogstatsd {
        let sink = Sink::Dogstatsd(dogstatsd::DogstatsdSink::connect(c).await?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.prometheus {
        let sink = Sink::Prometheus(prometheus::PrometheusSink::start(c, cancel.clone()).await?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.riemann {
        let sink = Sink::Riemann(riemann::RiemannSink::connect(c).await?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.pagerduty {
        let sink = Sink::PagerDuty(pagerduty::PagerDutySink::new(c, cfg.request_timeout()?)?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.log {
        let sink = Sink::Log(log::LogSink::open(c).await?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    if let Some(c) = &cfg.storage.splunk_hec {
        let sink = Sink::SplunkHec(splunk_hec::SplunkHecSink::new(c, cfg.request_timeout()?)?);
        spawn_engine(sink, &mut engines, &mut tasks, cancel);
    }

    tracing::info!("storage pipeline started with {} engine(s)", engines.len());

    let dispatcher_cancel = cancel.clone();
    tasks.spawn(dispatch(metric_rx, event_rx, engines, dispatcher_cancel));

    Ok((storage, StorageRuntime { tasks }))
}

fn spawn_engine(
    sink: Sink,
    engines: &mut Vec<EngineHandle>,
    tasks: &mut JoinSet<()>,
    cancel: &CancellationToken,
) {
    let name = sink.name();

    let (metric_tx, metric_rx) = if sink.accepts_metrics() {
        let (tx, rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let (event_tx, event_rx) = if sink.accepts_events() {
        let (tx, rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    engines.push(EngineHandle {
        name,
        metric_tx,
        event_tx,
    });

    tracing::info!("starting {} storage engine", name);
    tasks.spawn(engine_task(sink, metric_rx, event_rx, cancel.clone()));
}

/// Receive from an optional queue; a missing queue never yields.
async fn recv_maybe<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Drain one engine's queues, invoking the sink for each record. Sink
/// errors are logged and swallowed; the next record proceeds.
async fn engine_task(
    mut sink: Sink,
    mut metric_rx: Option<mpsc::Receiver<Metric>>,
    mut event_rx: Option<mpsc::Receiver<Event>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            m = recv_maybe(&mut metric_rx) => match m {
                Some(m) => {
                    if let Err(e) = sink.send_metric(m).await {
                        tracing::warn!("{} engine: {}", sink.name(), e);
                    }
                }
                None => break,
            },
            e = recv_maybe(&mut event_rx) => match e {
                Some(e) => {
                    if let Err(e) = sink.send_event(e).await {
                        tracing::warn!("{} engine: {}", sink.name(), e);
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                tracing::info!("cancellation received, stopping {} engine", sink.name());
                break;
            }
        }
    }
}

/// Fan records out from the global inboxes to every engine that accepts
/// the record kind. Blocks when a destination queue is full.
async fn dispatch(
    mut metric_rx: mpsc::Receiver<Metric>,
    mut event_rx: mpsc::Receiver<Event>,
    engines: Vec<EngineHandle>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            Some(m) = metric_rx.recv() => {
                for engine in &engines {
                    if let Some(tx) = &engine.metric_tx {
                        if tx.send(m.clone()).await.is_err() {
                            tracing::warn!("{} engine queue closed, metric lost", engine.name);
                        }
                    }
                }
            }
            Some(e) = event_rx.recv() => {
                for engine in &engines {
                    if let Some(tx) = &engine.event_tx {
                        if tx.send(e.clone()).await.is_err() {
                            tracing::warn!("{} engine queue closed, event lost", engine.name);
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("cancellation received, stopping storage dispatcher");
                break;
            }
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_inbox_round_trip() {
        let (storage, mut metric_rx, mut event_rx) = Storage::bounded(4);

        storage
            .record_metric(Metric::new(
                "j",
                "http://x/",
                "dns_duration_milliseconds",
                1.5,
                chrono::Utc::now(),
                &HashMap::new(),
            ))
            .await;
        storage.record_event(Event::new("j", 200, &HashMap::new())).await;

        let m = metric_rx.recv().await.unwrap();
        assert_eq!(m.timing, "dns_duration_milliseconds");
        let e = event_rx.recv().await.unwrap();
        assert_eq!(e.server_status, 200);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_by_capability() {
        let (storage, metric_rx, event_rx) = Storage::bounded(8);
        let cancel = CancellationToken::new();

        // A metrics-only engine and an events-only engine.
        let (m_tx, mut m_rx) = mpsc::channel(8);
        let (e_tx, mut e_rx) = mpsc::channel(8);
        let engines = vec![
            EngineHandle {
                name: "metrics-only",
                metric_tx: Some(m_tx),
                event_tx: None,
            },
            EngineHandle {
                name: "events-only",
                metric_tx: None,
                event_tx: Some(e_tx),
            },
        ];

        let task = tokio::spawn(dispatch(metric_rx, event_rx, engines, cancel.clone()));

        for _ in 0..3 {
            storage
                .record_metric(Metric::new(
                    "j",
                    "u",
                    "t",
                    1.0,
                    chrono::Utc::now(),
                    &HashMap::new(),
                ))
                .await;
        }
        storage.record_event(Event::new("j", 500, &HashMap::new())).await;

        for _ in 0..3 {
            assert!(m_rx.recv().await.is_some());
        }
        let e = e_rx.recv().await.unwrap();
        assert_eq!(e.server_status, 500);

        // Nothing crossed capabilities.
        assert!(m_rx.try_recv().is_err());
        assert!(e_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}
