//! Wiring of a running app: HTTP API, collector and optional push collection

use crate::config::AppConfig;
use crate::error::{PeriscopeError, Result};
use periscope_app::{serve, AppState, PushCollector};
use periscope_common::Details;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct AppServer {
    local_addr: SocketAddr,
    state: Arc<AppState>,
    server: JoinHandle<()>,
    push: Option<(PushCollector, JoinHandle<()>)>,
}

impl AppServer {
    /// Bind the API and start serving
    pub async fn start(config: &AppConfig) -> Result<Self> {
        config.validate()?;

        let app_id = if config.app_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.app_id.clone()
        };
        let hostname = hostname::get()?.to_string_lossy().into_owned();
        let details = Details {
            id: app_id,
            version: crate::VERSION.to_string(),
            hostname,
        };
        info!("App id {} on {}", details.id, details.hostname);

        let state = Arc::new(AppState::new(details, config.window)?);
        let listener = TcpListener::bind(&config.listen).await?;
        let local_addr = listener.local_addr()?;

        let server = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = serve(listener, state).await {
                    error!("API server failed: {:#}", e);
                }
            })
        };

        let push = if config.push_probes.is_empty() {
            None
        } else {
            Some(start_push(config, &state))
        };

        Ok(Self {
            local_addr,
            state,
            server,
            push,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Stop accepting requests, end open sessions and wait for background tasks
    pub async fn shutdown(self) -> Result<()> {
        self.state.shutdown.cancel();
        if let Some((push, forward)) = self.push {
            push.stop().await;
            forward
                .await
                .map_err(|e| PeriscopeError::ServerError(e.to_string()))?;
        }
        self.server
            .await
            .map_err(|e| PeriscopeError::ServerError(e.to_string()))?;
        self.state.pipes.stop().await;
        info!("App stopped");
        Ok(())
    }
}

fn start_push(config: &AppConfig, state: &Arc<AppState>) -> (PushCollector, JoinHandle<()>) {
    let (push, mut batches) = PushCollector::new(config.batch_time);
    for addr in &config.push_probes {
        info!("Pulling reports from {}", addr);
        push.add(addr);
    }

    let state = Arc::clone(state);
    let forward = tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            if batch.is_empty() {
                continue;
            }
            state
                .metrics
                .reports_received
                .with_label_values(&["tcp"])
                .inc();
            state.collector.add(batch);
        }
    });
    (push, forward)
}
