//! App side of the control channel
//!
//! Each probe keeps one control WebSocket open to the app. `handle` sends a
//! request down the probe's socket and waits for the response carrying the
//! same id.

use dashmap::DashMap;
use periscope_common::control::{RpcRequest, RpcResponse};
use periscope_common::{ControlError, ControlRequest, ControlResponse};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long `handle` waits for a probe to answer
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

const OUTBOUND_QUEUE: usize = 64;

type Pending = Arc<DashMap<u64, oneshot::Sender<ControlResponse>>>;

struct ProbeConnection {
    generation: u64,
    frames: mpsc::Sender<String>,
    pending: Pending,
}

/// A probe's registered control connection
///
/// The owner of the socket sends every frame received from `outbound` to the
/// probe and feeds every frame read from the probe to `complete`. Dropping
/// the session (or calling `ControlRouter::deregister`) fails every request
/// still waiting on it.
pub struct ProbeSession {
    pub probe_id: String,
    pub outbound: mpsc::Receiver<String>,
    generation: u64,
    pending: Pending,
}

impl ProbeSession {
    /// Route one response frame read from the probe
    pub fn complete(&self, frame: &str) {
        let response: RpcResponse = match serde_json::from_str(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!("Malformed control frame from {}: {}", self.probe_id, e);
                return;
            }
        };
        match self.pending.remove(&response.id) {
            Some((_, waiter)) => {
                // The caller may have timed out already.
                let _ = waiter.send(response.into_response());
            }
            None => debug!(
                "Control response {} from {} has no waiter",
                response.id, self.probe_id
            ),
        }
    }
}

/// Routes control requests to connected probes
#[derive(Default)]
pub struct ControlRouter {
    probes: DashMap<String, ProbeConnection>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl ControlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe's control connection, replacing any older one
    pub fn register(&self, probe_id: &str) -> ProbeSession {
        let (frames, outbound) = mpsc::channel(OUTBOUND_QUEUE);
        let pending: Pending = Arc::new(DashMap::new());
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let old = self.probes.insert(
            probe_id.to_string(),
            ProbeConnection {
                generation,
                frames,
                pending: Arc::clone(&pending),
            },
        );
        if old.is_some() {
            info!("Probe {} reconnected its control channel", probe_id);
        } else {
            info!("Probe {} connected its control channel", probe_id);
        }

        ProbeSession {
            probe_id: probe_id.to_string(),
            outbound,
            generation,
            pending,
        }
    }

    /// Forget a session; a newer connection for the same probe is left alone
    pub fn deregister(&self, session: &ProbeSession) {
        let removed = self
            .probes
            .remove_if(&session.probe_id, |_, conn| {
                conn.generation == session.generation
            });
        if removed.is_some() {
            info!("Probe {} disconnected its control channel", session.probe_id);
        }
        // Waiters see their sender dropped and report a disconnect.
        session.pending.clear();
    }

    pub fn is_connected(&self, probe_id: &str) -> bool {
        self.probes.contains_key(probe_id)
    }

    /// Probes with a live control connection, sorted
    pub fn probes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.probes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Send `request` to `probe_id` and wait for its response
    pub async fn handle(
        &self,
        probe_id: &str,
        mut request: ControlRequest,
    ) -> Result<ControlResponse, ControlError> {
        self.handle_with_timeout(probe_id, &mut request, CONTROL_TIMEOUT)
            .await
    }

    pub async fn handle_with_timeout(
        &self,
        probe_id: &str,
        request: &mut ControlRequest,
        timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        request.id = id;
        let frame = serde_json::to_string(&RpcRequest::handle(id, request)?)?;

        // Clone out of the map so no shard lock is held across awaits.
        let (frames, pending) = match self.probes.get(probe_id) {
            Some(conn) => (conn.frames.clone(), Arc::clone(&conn.pending)),
            None => return Err(ControlError::ProbeNotConnected(probe_id.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        if frames.send(frame).await.is_err() {
            pending.remove(&id);
            return Err(ControlError::Disconnected(id));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ControlError::Disconnected(id)),
            Err(_) => {
                pending.remove(&id);
                warn!("Control {} to probe {} timed out", request.control, probe_id);
                Err(ControlError::Timeout(id))
            }
        }
    }
}
