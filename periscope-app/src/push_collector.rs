//! Pull-free collection from probes that stream reports over TCP
//!
//! The collector dials each probe address, reads length-delimited report
//! frames and merges them into one current report. Every `batch_time` that
//! report is handed to the output channel and a new one is started.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use periscope_common::codec::{self, frame_codec};
use periscope_common::{retry_with_backoff, Backoff, Encoding, Flow, Report};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

type Current = Arc<Mutex<Report>>;

fn lock(current: &Current) -> MutexGuard<'_, Report> {
    current.lock().unwrap_or_else(|e| e.into_inner())
}

/// Merges reports streamed by a changing set of probe addresses
pub struct PushCollector {
    current: Current,
    readers: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl PushCollector {
    /// Start collecting; batches are delivered on the returned receiver
    pub fn new(batch_time: Duration) -> (Self, mpsc::Receiver<Report>) {
        let (out, batches) = mpsc::channel(1);
        let collector = Self {
            current: Arc::new(Mutex::new(Report::new())),
            readers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        collector.tasks.spawn(batch_loop(
            Arc::clone(&collector.current),
            batch_time,
            out,
            collector.cancel.clone(),
        ));
        (collector, batches)
    }

    /// Start reading from `addr`; adding a known address does nothing
    pub fn add(&self, addr: &str) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        if readers.contains_key(addr) || self.cancel.is_cancelled() {
            return;
        }
        let quit = self.cancel.child_token();
        readers.insert(addr.to_string(), quit.clone());

        let current = Arc::clone(&self.current);
        let addr = addr.to_string();
        self.tasks.spawn(async move {
            retry_with_backoff(
                "report stream",
                &addr,
                Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
                &quit,
                || read_session(&addr, &current),
            )
            .await;
            debug!("Stopped collecting from {}", addr);
        });
    }

    /// Stop reading from `addr`
    pub fn remove(&self, addr: &str) {
        let removed = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
        if let Some(quit) = removed {
            quit.cancel();
        }
    }

    /// Addresses currently being read, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        addrs.sort();
        addrs
    }

    /// Copy of the report merged so far in this batch
    pub fn peek(&self) -> Report {
        lock(&self.current).clone()
    }

    /// Cancel every reader and the batch loop, and wait for them
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn batch_loop(
    current: Current,
    batch_time: Duration,
    out: mpsc::Sender<Report>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(batch_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let batch = std::mem::take(&mut *lock(&current));
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = out.send(batch) => {
                if sent.is_err() {
                    debug!("Report batch receiver dropped");
                    return;
                }
            }
        }
    }
}

/// Read frames from one connection until it ends
///
/// A connection that ends before delivering anything counts as a failure so
/// that a probe which keeps dropping us (it only serves its newest
/// connection) is retried with backoff rather than in a tight loop. Once a
/// report has arrived, the connection worked and any later error only ends
/// the session.
async fn read_session(addr: &str, current: &Current) -> Result<Flow> {
    debug!("Dialing {}", addr);
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| format!("Timed out connecting to {}", addr))??;
    info!("Collecting reports from {}", addr);

    let mut frames = FramedRead::new(stream, frame_codec());
    let mut received = 0u64;
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if received > 0 => {
                warn!(
                    "Report stream from {} broke after {} reports: {}",
                    addr, received, e
                );
                return Ok(Flow::Continue);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Reading report stream from {}", addr))
            }
        };
        match codec::decode(&frame, Encoding::JsonGzip) {
            Ok(report) => {
                lock(current).merge(&report);
                received += 1;
            }
            Err(e) => warn!("Dropping undecodable report from {}: {}", addr, e),
        }
    }

    if received == 0 {
        bail!("{} closed the connection without sending a report", addr);
    }
    debug!("Report stream from {} ended after {} reports", addr, received);
    Ok(Flow::Continue)
}
