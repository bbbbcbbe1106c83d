//! Streams encoded reports to a push collector over TCP
//!
//! The probe listens; a collector connects and receives one length-prefixed
//! frame per published report. Only the most recent connection is served.

use crate::publisher::{PublishError, Publisher};
use anyhow::{Context, Result};
use futures::SinkExt;
use log::{debug, info, warn};
use periscope_common::codec::frame_codec;
use periscope_common::Buffer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct TcpPublisher {
    local_addr: SocketAddr,
    payloads: mpsc::Sender<Buffer>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TcpPublisher {
    /// Listen on `addr` (port 0 picks a free port)
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("Report stream listening on {}", local_addr);

        let (payloads, payload_rx) = mpsc::channel(1);
        let (conn_tx, conn_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(accept_loop(listener, conn_tx, cancel.clone()));
        tasks.spawn(write_loop(conn_rx, payload_rx, cancel.clone()));

        Ok(Self {
            local_addr,
            payloads,
            dropped: Arc::new(AtomicU64::new(0)),
            cancel,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Publisher for TcpPublisher {
    fn publish(&self, payload: Buffer) -> Result<(), PublishError> {
        match self.payloads.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(payload)) => {
                payload.release();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Report stream busy, dropping report");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(payload)) => {
                payload.release();
                Err(PublishError::Stopped)
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    conns: mpsc::Sender<(TcpStream, SocketAddr)>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(conn) => {
                if conns.send(conn).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Failed to accept report stream connection: {}", e),
        }
    }
}

async fn write_loop(
    mut conns: mpsc::Receiver<(TcpStream, SocketAddr)>,
    mut payloads: mpsc::Receiver<Buffer>,
    cancel: CancellationToken,
) {
    let mut current: Option<(FramedWrite<TcpStream, LengthDelimitedCodec>, SocketAddr)> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            conn = conns.recv() => {
                let Some((stream, peer)) = conn else { return };
                if let Some((_, old)) = current.take() {
                    debug!("Closing report stream to {} in favour of {}", old, peer);
                }
                info!("Streaming reports to {}", peer);
                current = Some((FramedWrite::new(stream, frame_codec()), peer));
            }
            payload = payloads.recv() => {
                let Some(payload) = payload else { return };
                let Some((framed, peer)) = current.as_mut() else {
                    payload.release();
                    continue;
                };
                if let Err(e) = framed.send(payload.into_bytes()).await {
                    warn!("Report stream to {} failed: {}", peer, e);
                    current = None;
                }
            }
        }
    }
}
