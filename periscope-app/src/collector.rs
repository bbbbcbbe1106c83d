//! Windowed report collector
//!
//! Reports received from many probes are kept for `window` and merged on
//! demand. Reports that arrive within `QUANTISATION_INTERVAL` of each other
//! are pre-merged, so the cost of `report()` grows with the window length
//! rather than with the number of probes.

use periscope_common::Report;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Reports arriving closer together than this are merged into one entry
pub const QUANTISATION_INTERVAL: Duration = Duration::from_secs(3);

const SUBSCRIBER_CAPACITY: usize = 16;

struct Entry {
    at: Instant,
    report: Report,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    cached: Option<Report>,
}

impl State {
    /// Drop every entry that has left the window
    fn prune(&mut self, now: Instant, window: Duration) {
        let Some(oldest) = now.checked_sub(window) else {
            return;
        };
        let before = self.entries.len();
        self.entries.retain(|entry| entry.at > oldest);
        if self.entries.len() != before {
            debug!("Pruned {} reports", before - self.entries.len());
        }
    }

    /// Merge runs of entries that fall within one quantum of the first
    fn quantise(&mut self) {
        if self.entries.len() < 2 {
            return;
        }
        let mut quantised: Vec<Entry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match quantised.last_mut() {
                Some(quantum) if entry.at.duration_since(quantum.at) < QUANTISATION_INTERVAL => {
                    quantum.report.merge(&entry.report);
                }
                _ => quantised.push(entry),
            }
        }
        self.entries = quantised;
    }
}

/// Receives reports from many probes and yields their merge over a window
pub struct Collector {
    window: Duration,
    state: Mutex<State>,
    shortcuts: broadcast::Sender<()>,
}

impl Collector {
    pub fn new(window: Duration) -> Self {
        let (shortcuts, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            window,
            state: Mutex::new(State::default()),
            shortcuts,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a freshly received report
    pub fn add(&self, report: Report) {
        let shortcut = report.shortcut;
        {
            let mut state = self.state();
            state.entries.push(Entry {
                at: Instant::now(),
                report,
            });
            state.prune(Instant::now(), self.window);
            state.cached = None;
        }
        if shortcut {
            // No subscribers is fine.
            let _ = self.shortcuts.send(());
        }
    }

    /// Merge of every report still inside the window
    pub fn report(&self) -> Report {
        let now = Instant::now();
        let mut state = self.state();

        if let (Some(cached), Some(first)) = (&state.cached, state.entries.first()) {
            let still_fresh = match now.checked_sub(self.window) {
                Some(oldest) => first.at > oldest,
                None => true,
            };
            if still_fresh {
                return cached.clone();
            }
        }

        state.prune(now, self.window);
        state.quantise();

        let merged = state
            .entries
            .iter()
            .fold(Report::new(), |mut acc, entry| {
                acc.merge(&entry.report);
                acc
            });
        state.cached = Some(merged.clone());
        merged
    }

    /// Be told whenever a shortcut report arrives
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shortcuts.subscribe()
    }

    /// Number of (quantised) entries currently held
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_common::report::topology;
    use periscope_common::Node;

    fn report_with(id: &str) -> Report {
        let mut rpt = Report::new();
        rpt.topology_mut(topology::PROCESS).add_node(Node::new(id));
        rpt
    }

    #[tokio::test]
    async fn test_window_prunes_old_reports() {
        let collector = Collector::new(Duration::from_millis(1));
        collector.add(report_with("p1"));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(collector.report().is_empty());
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_merges_reports_from_probes() {
        let collector = Collector::new(Duration::from_secs(15));
        collector.add(report_with("p1"));
        collector.add(report_with("p2"));

        let merged = collector.report();
        assert!(merged.node(topology::PROCESS, "p1").is_some());
        assert!(merged.node(topology::PROCESS, "p2").is_some());
        assert_eq!(merged, report_with("p1").merged(&report_with("p2")));

        // Asking again without new input gives the same view.
        assert_eq!(collector.report(), merged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quantisation_merges_close_reports() {
        let collector = Collector::new(Duration::from_secs(60));
        collector.add(report_with("a"));
        tokio::time::advance(Duration::from_secs(1)).await;
        collector.add(report_with("b"));
        tokio::time::advance(Duration::from_secs(1)).await;
        collector.add(report_with("c"));
        tokio::time::advance(Duration::from_secs(3)).await;
        collector.add(report_with("d"));
        assert_eq!(collector.len(), 4);

        let merged = collector.report();
        assert_eq!(merged.node_count(), 4);
        // [0, 1, 2] collapse into one quantum, 5 starts the next.
        assert_eq!(collector.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_view_expires_with_window() {
        let collector = Collector::new(Duration::from_secs(10));
        collector.add(report_with("a"));
        assert_eq!(collector.report().node_count(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(collector.report().is_empty());
    }

    #[tokio::test]
    async fn test_shortcut_notifies_subscribers() {
        let collector = Collector::new(Duration::from_secs(15));
        let mut waiter = collector.subscribe();

        collector.add(report_with("regular"));
        assert!(waiter.try_recv().is_err());

        let mut shortcut = report_with("urgent");
        shortcut.shortcut = true;
        collector.add(shortcut);
        assert!(waiter.try_recv().is_ok());
    }
}
