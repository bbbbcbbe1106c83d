//! Latest-wins payload delivery
//!
//! A `LatestSender` holds at most one pending payload. `send` replaces
//! whatever is pending, so a slow app only ever receives the freshest report
//! and the probe never queues. A single worker task delivers one payload at
//! a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use periscope_common::xfer::{self, PROBE_ID_HEADER, PROBE_VERSION_HEADER};
use periscope_common::{Buffer, Encoding, VERSION};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Performs a single delivery of a payload
#[async_trait]
pub trait Deliver: Send + Sync + 'static {
    /// Where payloads go, for log messages
    fn target(&self) -> &str;

    async fn deliver(&self, payload: Buffer) -> Result<()>;
}

/// POSTs encoded reports to an app's report endpoint
pub struct HttpDelivery {
    client: reqwest::Client,
    url: Url,
    target: String,
    token: String,
    probe_id: String,
    encoding: Encoding,
}

impl HttpDelivery {
    pub fn new(
        client: reqwest::Client,
        url: Url,
        token: impl Into<String>,
        probe_id: impl Into<String>,
        encoding: Encoding,
    ) -> Self {
        Self {
            client,
            target: url.to_string(),
            url,
            token: token.into(),
            probe_id: probe_id.into(),
            encoding,
        }
    }
}

#[async_trait]
impl Deliver for HttpDelivery {
    fn target(&self) -> &str {
        &self.target
    }

    async fn deliver(&self, payload: Buffer) -> Result<()> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, xfer::authorization_header(&self.token))
            .header(PROBE_ID_HEADER, &self.probe_id)
            .header(PROBE_VERSION_HEADER, VERSION);
        if let Some(encoding) = self.encoding.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        let response = request
            .body(payload.into_bytes())
            .send()
            .await
            .with_context(|| format!("POST {}", self.target))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{}: {}", status, body.trim());
        }
        Ok(())
    }
}

struct SenderInner {
    pending: Mutex<Option<Buffer>>,
    wake: Notify,
    cancel: CancellationToken,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Lossy single-slot sender in front of a `Deliver`
pub struct LatestSender {
    target: String,
    inner: Arc<SenderInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LatestSender {
    /// Start the delivery worker; must be called inside a tokio runtime
    pub fn new<D: Deliver>(delivery: D) -> Self {
        let target = delivery.target().to_string();
        let inner = Arc::new(SenderInner {
            pending: Mutex::new(None),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&inner), delivery));
        Self {
            target,
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Replace the pending payload; never blocks
    pub fn send(&self, payload: Buffer) {
        if self.inner.cancel.is_cancelled() {
            payload.release();
            return;
        }

        let replaced = match self.inner.pending.lock() {
            Ok(mut pending) => pending.replace(payload),
            Err(_) => return,
        };
        if let Some(old) = replaced {
            old.release();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dropping report to {}: previous delivery still in flight (slow app?)",
                self.target
            );
        }
        self.inner.wake.notify_one();
    }

    /// Stop the worker and release any pending payload
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let pending = self.inner.pending.lock().ok().and_then(|mut p| p.take());
        if let Some(payload) = pending {
            payload.release();
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Sender worker for {} ended abnormally: {}", self.target, e);
            }
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

async fn run_worker<D: Deliver>(inner: Arc<SenderInner>, delivery: D) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            _ = inner.wake.notified() => {}
        }

        let payload = match inner.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => return,
        };
        let Some(payload) = payload else {
            continue;
        };

        let result = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            result = delivery.deliver(payload) => result,
        };
        match result {
            Ok(()) => {
                inner.delivered.fetch_add(1, Ordering::Relaxed);
                debug!("Delivered report to {}", delivery.target());
            }
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Error publishing to {}: {:#}", delivery.target(), e);
            }
        }
    }
}
