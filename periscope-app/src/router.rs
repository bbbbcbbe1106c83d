//! HTTP and WebSocket API served by the app

use crate::collector::Collector;
use crate::control_router::ControlRouter;
use crate::error::{AppError, Result};
use crate::metrics::AppMetrics;
use crate::pipe_router::{End, PipeEnd, PipeRouter};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use periscope_common::codec::{self, MAX_REPORT_SIZE};
use periscope_common::xfer::{CONTROL_WS_PATH, DETAILS_PATH, PROBE_ID_HEADER, REPORT_PATH};
use periscope_common::{ControlRequest, ControlResponse, Details, Encoding, Report};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const PIPE_READ_SIZE: usize = 8 * 1024;
const PIPE_DRAIN_IDLE: Duration = Duration::from_millis(250);

/// Everything the handlers share
pub struct AppState {
    pub details: Details,
    pub collector: Arc<Collector>,
    pub controls: Arc<ControlRouter>,
    pub pipes: Arc<PipeRouter>,
    pub metrics: Arc<AppMetrics>,
    /// Cancelled on shutdown; ends long-lived WebSocket sessions
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build fresh state (starts the pipe GC loop, so needs a runtime)
    pub fn new(details: Details, window: Duration) -> Result<Self> {
        Ok(Self {
            details,
            collector: Arc::new(Collector::new(window)),
            controls: Arc::new(ControlRouter::new()),
            pipes: Arc::new(PipeRouter::new()),
            metrics: Arc::new(AppMetrics::new()?),
            shutdown: CancellationToken::new(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(DETAILS_PATH, get(details))
        .route(REPORT_PATH, get(get_report).post(post_report))
        .route("/metrics", get(metrics))
        .route(CONTROL_WS_PATH, get(control_ws))
        .route("/api/control/:probe_id/:node_id/:control", post(control))
        .route(
            "/api/pipe/:pipe_id",
            get(pipe_ui_ws).delete(delete_pipe).post(delete_pipe),
        )
        .route("/api/pipe/:pipe_id/probe", get(pipe_probe_ws))
        .layer(DefaultBodyLimit::max(MAX_REPORT_SIZE as usize))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `state.shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn details(State(state): State<Arc<AppState>>) -> Json<Details> {
    Json(state.details.clone())
}

async fn get_report(State(state): State<Arc<AppState>>) -> Json<Report> {
    Json(state.collector.report())
}

async fn post_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let decoded = Encoding::from_content_encoding(encoding)
        .and_then(|encoding| codec::decode(&body, encoding));

    let report = match decoded {
        Ok(report) => report,
        Err(e) => {
            state
                .metrics
                .decode_errors
                .with_label_values(&["http"])
                .inc();
            let probe = headers
                .get(PROBE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            warn!("Rejecting report from probe {}: {}", probe, e);
            return Err(e.into());
        }
    };

    state
        .metrics
        .reports_received
        .with_label_values(&["http"])
        .inc();
    state.metrics.report_bytes.inc_by(body.len() as f64);
    state.collector.add(report);
    Ok(StatusCode::OK)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response> {
    state
        .metrics
        .probes_connected
        .set(state.controls.len() as i64);
    state.metrics.pipes_open.set(state.pipes.open_count() as i64);
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn control(
    State(state): State<Arc<AppState>>,
    Path((probe_id, node_id, control)): Path<(String, String, String)>,
) -> Result<Json<ControlResponse>> {
    let request = ControlRequest {
        app_id: state.details.id.clone(),
        node_id,
        control,
        ..Default::default()
    };
    let result = state.controls.handle(&probe_id, request).await;
    let outcome = match &result {
        Ok(response) if response.is_error() => "error",
        Ok(_) => "ok",
        Err(_) => "failed",
    };
    state
        .metrics
        .control_requests
        .with_label_values(&[outcome])
        .inc();
    Ok(Json(result?))
}

async fn control_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(probe_id) = headers
        .get(PROBE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
    else {
        return (StatusCode::BAD_REQUEST, "missing probe id").into_response();
    };
    ws.on_upgrade(move |socket| control_session(socket, probe_id, state))
}

async fn control_session(socket: WebSocket, probe_id: String, state: Arc<AppState>) {
    let mut session = state.controls.register(&probe_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = session.outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!("Failed to send control request to {}: {}", probe_id, e);
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => session.complete(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Control connection from {} failed: {}", probe_id, e);
                    break;
                }
            },
        }
    }

    state.controls.deregister(&session);
}

async fn pipe_ui_ws(
    ws: WebSocketUpgrade,
    Path(pipe_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    pipe_ws(ws, &pipe_id, End::Ui, state)
}

async fn pipe_probe_ws(
    ws: WebSocketUpgrade,
    Path(pipe_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    pipe_ws(ws, &pipe_id, End::Probe, state)
}

fn pipe_ws(
    ws: WebSocketUpgrade,
    pipe_id: &str,
    end: End,
    state: Arc<AppState>,
) -> Result<Response> {
    let pipe_end = state
        .pipes
        .get(pipe_id, end)
        .ok_or_else(|| AppError::PipeNotFound(pipe_id.to_string()))?;
    let shutdown = state.shutdown.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = bridge_pipe(socket, &pipe_end, &shutdown).await {
            debug!(
                "Pipe {} {} connection ended: {:#}",
                pipe_end.id(),
                pipe_end.end(),
                e
            );
        }
    }))
}

/// Copy between a WebSocket and one pipe end until either side finishes
async fn bridge_pipe(
    socket: WebSocket,
    pipe_end: &PipeEnd,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let io = pipe_end.io();
    let mut io = io.lock().await;
    let (mut reader, mut writer) = tokio::io::split(&mut *io);
    let (mut sink, mut stream) = socket.split();

    let inbound = async {
        while let Some(message) = stream.next().await {
            match message? {
                Message::Binary(data) => writer.write_all(&data).await?,
                Message::Text(text) => writer.write_all(text.as_bytes()).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    // Keeps forwarding after the pipe closes until the other end goes quiet,
    // so output written just before the close still reaches this socket.
    let outbound = async {
        let mut buf = vec![0u8; PIPE_READ_SIZE];
        let mut draining = false;
        loop {
            let n = tokio::select! {
                biased;
                n = reader.read(&mut buf) => n?,
                _ = pipe_end.pipe().closed(), if !draining => {
                    draining = true;
                    continue;
                }
                _ = tokio::time::sleep(PIPE_DRAIN_IDLE), if draining => break,
            };
            if n == 0 {
                break;
            }
            sink.send(Message::Binary(buf[..n].to_vec())).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        result = inbound => result,
        result = outbound => result,
    };
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("Failed to close pipe websocket: {}", e);
    }
    result
}

async fn delete_pipe(Path(pipe_id): Path<String>, State(state): State<Arc<AppState>>) -> StatusCode {
    state.pipes.delete(&pipe_id);
    StatusCode::NO_CONTENT
}
