//! Probe scheduler
//!
//! Two independent loops share one set of collaborators:
//! - the tick loop runs every `Ticker` each spy interval
//! - the report loop runs every `Reporter` concurrently each publish
//!   interval, merges the results, applies `Tagger`s and publishes
//!
//! Shortcut reports queued with `publish` skip the interval and go out
//! immediately.

use crate::publisher::ReportPublisher;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, warn};
use periscope_common::Report;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the shortcut report queue
pub const SHORTCUT_QUEUE_SIZE: usize = 1024;

/// Produces a report each publish interval
#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;
    async fn report(&self) -> Result<Report>;
}

/// Annotates a merged report in place
pub trait Tagger: Send + Sync {
    fn name(&self) -> &str;
    fn tag(&self, report: &mut Report) -> Result<()>;
}

/// Refreshes cached state each spy interval
#[async_trait]
pub trait Ticker: Send + Sync {
    fn name(&self) -> &str;
    async fn tick(&self) -> Result<()>;
}

struct Shared {
    spy_interval: Duration,
    reporters: Vec<Arc<dyn Reporter>>,
    taggers: Vec<Arc<dyn Tagger>>,
    tickers: Vec<Arc<dyn Ticker>>,
    publisher: Arc<dyn ReportPublisher>,
}

impl Shared {
    async fn tick(&self) {
        for ticker in &self.tickers {
            if let Err(e) = ticker.tick().await {
                error!("Error doing ticker {}: {:#}", ticker.name(), e);
            }
        }
    }

    async fn report(&self) -> Report {
        let spy_interval = self.spy_interval;
        let reports = join_all(self.reporters.iter().map(|reporter| async move {
            let start = Instant::now();
            let result = reporter.report().await;
            let took = start.elapsed();
            if took > spy_interval {
                warn!(
                    "{} reporter took {:?} (longer than {:?})",
                    reporter.name(),
                    took,
                    spy_interval
                );
            }
            match result {
                Ok(report) => report,
                Err(e) => {
                    error!("Error generating {} report: {:#}", reporter.name(), e);
                    // An empty report merges harmlessly.
                    Report::new()
                }
            }
        }))
        .await;

        let mut merged = Report::new();
        for report in &reports {
            merged.merge(report);
        }
        merged.ts = Some(Utc::now());
        merged
    }

    fn tag(&self, report: &mut Report) {
        for tagger in &self.taggers {
            if let Err(e) = tagger.tag(report) {
                error!("Error applying tagger {}: {:#}", tagger.name(), e);
            }
        }
    }

    fn publish(&self, report: &Report) {
        if let Err(e) = self.publisher.publish(report) {
            error!("Error publishing report: {}", e);
        }
    }
}

/// Generates and publishes reports on a schedule
pub struct Probe {
    spy_interval: Duration,
    publish_interval: Duration,
    reporters: Vec<Arc<dyn Reporter>>,
    taggers: Vec<Arc<dyn Tagger>>,
    tickers: Vec<Arc<dyn Ticker>>,
    publisher: Arc<dyn ReportPublisher>,
    shortcut_tx: mpsc::Sender<Report>,
    shortcut_rx: Mutex<Option<mpsc::Receiver<Report>>>,
    shared: Mutex<Option<Arc<Shared>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Probe {
    pub fn new(
        spy_interval: Duration,
        publish_interval: Duration,
        publisher: Arc<dyn ReportPublisher>,
    ) -> Self {
        let (shortcut_tx, shortcut_rx) = mpsc::channel(SHORTCUT_QUEUE_SIZE);
        Self {
            spy_interval,
            publish_interval,
            reporters: Vec::new(),
            taggers: Vec::new(),
            tickers: Vec::new(),
            publisher,
            shortcut_tx,
            shortcut_rx: Mutex::new(Some(shortcut_rx)),
            shared: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn add_reporter(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    pub fn add_tagger(&mut self, tagger: Arc<dyn Tagger>) {
        self.taggers.push(tagger);
    }

    pub fn add_ticker(&mut self, ticker: Arc<dyn Ticker>) {
        self.tickers.push(ticker);
    }

    /// Start both loops; a second call does nothing
    pub fn start(&self) {
        let Some(shortcuts) = self.shortcut_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        let shared = Arc::new(Shared {
            spy_interval: self.spy_interval,
            reporters: self.reporters.clone(),
            taggers: self.taggers.clone(),
            tickers: self.tickers.clone(),
            publisher: Arc::clone(&self.publisher),
        });
        if let Ok(mut slot) = self.shared.lock() {
            *slot = Some(Arc::clone(&shared));
        }

        self.tasks.spawn(tick_loop(
            Arc::clone(&shared),
            self.spy_interval,
            self.cancel.clone(),
        ));
        self.tasks.spawn(report_loop(
            shared,
            self.publish_interval,
            shortcuts,
            self.cancel.clone(),
        ));
    }

    /// Tag `report` and queue it for immediate publication
    pub fn publish(&self, mut report: Report) {
        match self.shared.lock().ok().and_then(|s| s.clone()) {
            Some(shared) => shared.tag(&mut report),
            None => {
                for tagger in &self.taggers {
                    if let Err(e) = tagger.tag(&mut report) {
                        error!("Error applying tagger {}: {:#}", tagger.name(), e);
                    }
                }
            }
        }
        if self.shortcut_tx.try_send(report).is_err() {
            warn!("Shortcut report queue full, dropping report");
        }
    }

    /// Stop both loops, giving in-flight work up to `grace` to finish
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("Probe loops did not finish within {:?}", grace);
        }
    }
}

async fn tick_loop(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        shared.tick().await;
    }
}

async fn report_loop(
    shared: Arc<Shared>,
    interval: Duration,
    mut shortcuts: mpsc::Receiver<Report>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; wait a full interval instead.
    ticker.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                // In-flight generation finishes before cancellation is seen.
                let mut report = shared.report().await;
                drain_into(&mut report, &mut shortcuts);
                shared.tag(&mut report);
                shared.publish(&report);
            }
            shortcut = shortcuts.recv() => {
                let Some(mut report) = shortcut else { return };
                drain_into(&mut report, &mut shortcuts);
                report.shortcut = true;
                debug!("Publishing shortcut report");
                shared.publish(&report);
            }
        }
    }
}

fn drain_into(report: &mut Report, queue: &mut mpsc::Receiver<Report>) {
    while let Ok(queued) = queue.try_recv() {
        report.merge(&queued);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PublishError;
    use periscope_common::report::{topology, Node};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Report>>);

    impl ReportPublisher for Collecting {
        fn publish(&self, report: &Report) -> Result<(), PublishError> {
            self.0.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct NodeReporter(&'static str);

    #[async_trait]
    impl Reporter for NodeReporter {
        fn name(&self) -> &str {
            self.0
        }

        async fn report(&self) -> Result<Report> {
            let mut rpt = Report::new();
            rpt.topology_mut(topology::HOST).add_node(Node::new(self.0));
            Ok(rpt)
        }
    }

    struct Broken;

    #[async_trait]
    impl Reporter for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn report(&self) -> Result<Report> {
            anyhow::bail!("permission denied")
        }
    }

    struct Labeller;

    impl Tagger for Labeller {
        fn name(&self) -> &str {
            "labeller"
        }

        fn tag(&self, report: &mut Report) -> Result<()> {
            let now = Utc::now();
            for node in report.topology_mut(topology::HOST).nodes.values_mut() {
                node.latest.insert(
                    "probe".to_string(),
                    periscope_common::LatestEntry {
                        timestamp: now,
                        value: "test".to_string(),
                    },
                );
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingTicker(AtomicUsize);

    #[async_trait]
    impl Ticker for CountingTicker {
        fn name(&self) -> &str {
            "counting"
        }

        async fn tick(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_loop_merges_and_tags() {
        let published = Arc::new(Collecting::default());
        let ticks = Arc::new(CountingTicker::default());
        let mut probe = Probe::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            published.clone(),
        );
        probe.add_reporter(Arc::new(NodeReporter("a")));
        probe.add_reporter(Arc::new(NodeReporter("b")));
        probe.add_reporter(Arc::new(Broken));
        probe.add_tagger(Arc::new(Labeller));
        probe.add_ticker(ticks.clone());
        probe.start();

        tokio::time::sleep(Duration::from_millis(1050)).await;
        probe.stop(Duration::from_secs(1)).await;

        let reports = published.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let rpt = &reports[0];
        assert!(rpt.ts.is_some());
        assert!(!rpt.shortcut);
        for id in ["a", "b"] {
            let node = rpt.node(topology::HOST, id).expect("node present");
            assert_eq!(node.latest_value("probe"), Some("test"));
        }
        // Ticks at 0, 100, ..., 1000ms.
        assert_eq!(ticks.0.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortcut_published_immediately() {
        let published = Arc::new(Collecting::default());
        let mut probe = Probe::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            published.clone(),
        );
        probe.add_tagger(Arc::new(Labeller));
        probe.start();

        let mut rpt = Report::new();
        rpt.topology_mut(topology::HOST).add_node(Node::new("x"));
        probe.publish(rpt);
        tokio::time::sleep(Duration::from_millis(10)).await;
        probe.stop(Duration::from_secs(1)).await;

        let reports = published.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].shortcut);
        let node = reports[0].node(topology::HOST, "x").expect("node");
        assert_eq!(node.latest_value("probe"), Some("test"));
    }

    struct Slow;

    #[async_trait]
    impl Reporter for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn report(&self) -> Result<Report> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Report::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_by_grace() {
        let mut probe = Probe::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Arc::new(Collecting::default()),
        );
        probe.add_reporter(Arc::new(Slow));
        probe.start();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let start = tokio::time::Instant::now();
        probe.stop(Duration::from_secs(2)).await;
        assert!(start.elapsed() <= Duration::from_secs(2));
    }
}
