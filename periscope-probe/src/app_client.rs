//! Connection to a single app
//!
//! An `HttpAppClient` owns everything the probe keeps open towards one app:
//! the latest-wins report sender, the control WebSocket and any pipe
//! WebSockets. Background loops reconnect with exponential backoff and are
//! all cancelled and awaited by `stop`.

use crate::sender::{HttpDelivery, LatestSender};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use periscope_common::xfer::{
    self, CONTROL_WS_PATH, DETAILS_PATH, PROBE_ID_HEADER, PROBE_VERSION_HEADER, REPORT_PATH,
};
use periscope_common::{
    retry_with_backoff, Backoff, Buffer, ControlRegistry, Details, Encoding, Flow, Pipe, VERSION,
};
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bound on establishing any connection to an app
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a single HTTP request to an app
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PIPE_READ_SIZE: usize = 8 * 1024;

/// Once a pipe has closed, stop forwarding after this long without output
const PIPE_DRAIN_IDLE: Duration = Duration::from_millis(250);

/// What the probe presents to every app
#[derive(Debug, Clone)]
pub struct ProbeCredentials {
    pub probe_id: String,
    pub token: String,
}

/// A client to one app endpoint
#[async_trait]
pub trait AppClient: Send + Sync {
    /// Endpoint this client talks to
    fn target(&self) -> &str;

    /// Fetch the app's handshake document
    async fn details(&self) -> Result<Details>;

    /// Start the reconnecting control connection in the background
    fn control_connection(&self);

    /// Queue an encoded report for delivery; never blocks
    fn publish(&self, payload: Buffer) -> Result<()>;

    /// Carry `pipe`'s remote end to the app in the background
    fn pipe_connection(&self, pipe_id: &str, pipe: Pipe);

    /// Tell the app a pipe is gone
    async fn pipe_close(&self, pipe_id: &str) -> Result<()>;

    /// Cancel every background loop and wait for them
    async fn stop(&self);
}

struct ClientInner {
    target: String,
    base: Url,
    http: reqwest::Client,
    credentials: ProbeCredentials,
    registry: Arc<ControlRegistry>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// `AppClient` speaking HTTP and WebSocket to a real app
pub struct HttpAppClient {
    inner: Arc<ClientInner>,
    sender: LatestSender,
}

/// Build the HTTP client shared by every app client
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

impl HttpAppClient {
    /// Create a client for `endpoint`; starts the report sender worker
    pub fn new(
        endpoint: &str,
        http: reqwest::Client,
        credentials: ProbeCredentials,
        registry: Arc<ControlRegistry>,
    ) -> Result<Self> {
        let base = Url::parse(endpoint).with_context(|| format!("Invalid app URL {}", endpoint))?;
        if !matches!(base.scheme(), "http" | "https") {
            bail!("Unsupported scheme in app URL {}", endpoint);
        }
        let report_url = base.join(REPORT_PATH)?;

        let sender = LatestSender::new(HttpDelivery::new(
            http.clone(),
            report_url,
            credentials.token.clone(),
            credentials.probe_id.clone(),
            Encoding::JsonGzip,
        ));

        Ok(Self {
            inner: Arc::new(ClientInner {
                target: base.to_string(),
                base,
                http,
                credentials,
                registry,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            sender,
        })
    }

    /// Reports dropped because a newer one arrived first
    pub fn dropped(&self) -> u64 {
        self.sender.dropped()
    }
}

impl ClientInner {
    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(AUTHORIZATION, xfer::authorization_header(&self.credentials.token))
            .header(PROBE_ID_HEADER, &self.credentials.probe_id)
            .header(PROBE_VERSION_HEADER, VERSION)
    }

    fn ws_request(&self, path: &str) -> Result<Request> {
        let mut url = self.base.join(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot use {} as a websocket URL", url))?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&xfer::authorization_header(&self.credentials.token))?,
        );
        headers.insert(
            HeaderName::from_bytes(PROBE_ID_HEADER.as_bytes())?,
            HeaderValue::from_str(&self.credentials.probe_id)?,
        );
        headers.insert(
            HeaderName::from_bytes(PROBE_VERSION_HEADER.as_bytes())?,
            HeaderValue::from_static(VERSION),
        );
        Ok(request)
    }

    /// One control session: serve RPC frames until the socket closes
    async fn control_session(&self) -> Result<Flow> {
        let request = self.ws_request(CONTROL_WS_PATH)?;
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .context("Timed out connecting control websocket")??;
        debug!("Control connection to {} established", self.target);

        let (sink, mut stream) = ws.split();
        let sink = Arc::new(AsyncMutex::new(sink));

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = sink.lock().await.close().await;
                    return Ok(Flow::Done);
                }
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    let registry = Arc::clone(&self.registry);
                    let sink = Arc::clone(&sink);
                    let target = self.target.clone();
                    self.tasks.spawn(async move {
                        let Some(reply) = registry.handle_rpc(&text).await else {
                            return;
                        };
                        let frame = match serde_json::to_string(&reply) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Failed to encode control reply: {}", e);
                                return;
                            }
                        };
                        if let Err(e) = sink.lock().await.send(Message::Text(frame)).await {
                            warn!("Failed to send control reply to {}: {}", target, e);
                        }
                    });
                }
                Some(Ok(Message::Close(_))) | None => return Ok(Flow::Continue),
                Some(Ok(_)) => {}
                // The socket was up, so reconnect without growing the backoff.
                Some(Err(e)) => {
                    warn!("Control connection to {} broke: {}", self.target, e);
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// One pipe session: copy between the pipe and a websocket until either
    /// side ends
    async fn pipe_session(
        &self,
        pipe_id: &str,
        pipe: &Pipe,
        remote: Arc<AsyncMutex<DuplexStream>>,
    ) -> Result<Flow> {
        if pipe.is_closed() {
            return Ok(Flow::Done);
        }

        let request = self.ws_request(&xfer::pipe_probe_path(pipe_id))?;
        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Err(_) => bail!("Timed out connecting pipe websocket"),
            Ok(Err(WsError::Http(response))) if response.status() == StatusCode::NOT_FOUND => {
                // The app (or the user) already closed this pipe.
                pipe.close();
                return Ok(Flow::Done);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok((ws, _))) => ws,
        };

        let mut remote = remote.lock().await;
        let (mut reader, mut writer) = tokio::io::split(&mut *remote);
        let (mut sink, mut stream) = ws.split();

        let inbound = async {
            while let Some(frame) = stream.next().await {
                match frame? {
                    Message::Binary(data) => writer.write_all(&data).await?,
                    Message::Text(text) => writer.write_all(text.as_bytes()).await?,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok::<_, anyhow::Error>(())
        };

        // Runs to end of stream, or until the pipe has closed and no more
        // output turns up, so the last bytes a process wrote are not lost.
        let outbound = async {
            let mut buf = vec![0u8; PIPE_READ_SIZE];
            let mut draining = false;
            loop {
                let n = tokio::select! {
                    biased;
                    n = reader.read(&mut buf) => n?,
                    _ = pipe.closed(), if !draining => {
                        draining = true;
                        continue;
                    }
                    _ = tokio::time::sleep(PIPE_DRAIN_IDLE), if draining => break,
                };
                if n == 0 {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok::<_, anyhow::Error>(true);
                }
                sink.send(Message::Binary(buf[..n].to_vec())).await?;
            }
            let _ = sink.send(Message::Close(None)).await;
            Ok(false)
        };

        let ended = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Flow::Done),
            result = inbound => {
                result?;
                false
            }
            result = outbound => result?,
        };

        // End of stream means the process is gone; nothing left to carry.
        if ended || pipe.is_closed() {
            Ok(Flow::Done)
        } else {
            Ok(Flow::Continue)
        }
    }
}

#[async_trait]
impl AppClient for HttpAppClient {
    fn target(&self) -> &str {
        &self.inner.target
    }

    async fn details(&self) -> Result<Details> {
        let url = self.inner.base.join(DETAILS_PATH)?;
        let response = self
            .inner
            .authorized(self.inner.http.get(url))
            .send()
            .await
            .with_context(|| format!("Fetching details from {}", self.inner.target))?
            .error_for_status()?;
        Ok(response.json::<Details>().await?)
    }

    fn control_connection(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            info!("Control connection to {} starting", inner.target);
            retry_with_backoff(
                "controls",
                &inner.target,
                Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
                &inner.cancel,
                || inner.control_session(),
            )
            .await;
            info!("Control connection to {} exiting", inner.target);
        });
    }

    fn publish(&self, payload: Buffer) -> Result<()> {
        self.sender.send(payload);
        Ok(())
    }

    fn pipe_connection(&self, pipe_id: &str, pipe: Pipe) {
        let Some(remote) = pipe.take_remote() else {
            warn!("Pipe {} has no remote end to connect", pipe_id);
            return;
        };
        let remote = Arc::new(AsyncMutex::new(remote));
        let inner = Arc::clone(&self.inner);
        let pipe_id = pipe_id.to_string();

        self.inner.tasks.spawn(async move {
            info!("Pipe {} connection to {} starting", pipe_id, inner.target);
            retry_with_backoff(
                &pipe_id,
                &inner.target,
                Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
                &inner.cancel,
                || inner.pipe_session(&pipe_id, &pipe, Arc::clone(&remote)),
            )
            .await;
            info!("Pipe {} connection to {} exiting", pipe_id, inner.target);
        });
    }

    async fn pipe_close(&self, pipe_id: &str) -> Result<()> {
        let url = self.inner.base.join(&xfer::pipe_path(pipe_id))?;
        let response = self
            .inner
            .authorized(self.inner.http.delete(url))
            .send()
            .await
            .with_context(|| format!("Closing pipe {} on {}", pipe_id, self.inner.target))?;
        debug!(
            "Pipe {} delete on {} returned {}",
            pipe_id,
            self.inner.target,
            response.status()
        );
        Ok(())
    }

    async fn stop(&self) {
        self.inner.cancel.cancel();
        self.sender.stop().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("Client for {} stopped", self.inner.target);
    }
}
