//! Controls the probe offers to apps

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use periscope_common::{
    ControlHandler, ControlRegistry, ControlRequest, ControlResponse, Pipe, PipeClient,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens an interactive shell on the host
pub const HOST_EXEC: &str = "host_exec";

const OUTPUT_CHUNK: usize = 4 * 1024;

/// How long an exited process's output may take to reach the pipe
const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a shell and connects it to the app through a pipe
pub struct ExecControl {
    shell: String,
    pipes: Arc<dyn PipeClient>,
}

impl ExecControl {
    pub fn new(shell: impl Into<String>, pipes: Arc<dyn PipeClient>) -> Self {
        Self {
            shell: shell.into(),
            pipes,
        }
    }

    async fn exec(&self, request: &ControlRequest) -> Result<String> {
        let pipe = Pipe::new();
        let pipe_id = uuid::Uuid::new_v4().to_string();
        let local = pipe.take_local().context("pipe has no local end")?;

        let mut child = Command::new(&self.shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.shell))?;
        let output = wire_process(&mut child, local);

        if let Err(e) = self
            .pipes
            .on_pipe_opened(&request.app_id, &pipe_id, pipe.clone())
            .await
        {
            pipe.close();
            if let Err(kill) = child.kill().await {
                warn!("Failed to kill {}: {}", self.shell, kill);
            }
            return Err(e);
        }

        info!(
            "Started {} for node {} on pipe {}",
            self.shell, request.node_id, pipe_id
        );
        tokio::spawn(supervise(
            child,
            output,
            pipe,
            Arc::clone(&self.pipes),
            request.app_id.clone(),
            pipe_id.clone(),
        ));
        Ok(pipe_id)
    }
}

#[async_trait]
impl ControlHandler for ExecControl {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match self.exec(&request).await {
            Ok(pipe_id) => ControlResponse::pipe(pipe_id, false),
            Err(e) => ControlResponse::error(format!("{:#}", e)),
        }
    }
}

/// Register every control the probe ships with
pub fn register_controls(registry: &ControlRegistry, shell: &str, pipes: Arc<dyn PipeClient>) {
    registry.register(HOST_EXEC, Arc::new(ExecControl::new(shell, pipes)));
}

/// Connect the process's stdio to the pipe; the handle finishes once all
/// output has been written
fn wire_process(child: &mut Child, local: DuplexStream) -> JoinHandle<()> {
    let (mut from_app, to_app) = tokio::io::split(local);

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut from_app, &mut stdin).await {
                debug!("Pipe to process stdin ended: {}", e);
            }
        });
    }
    tokio::spawn(forward_output(
        child.stdout.take(),
        child.stderr.take(),
        to_app,
    ))
}

async fn read_from<R: AsyncRead + Unpin>(source: &mut Option<R>, buf: &mut [u8]) -> usize {
    match source {
        Some(reader) => reader.read(buf).await.unwrap_or(0),
        None => std::future::pending().await,
    }
}

/// Copy stdout and stderr into the pipe, then signal end of stream
async fn forward_output(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    mut to_app: WriteHalf<DuplexStream>,
) {
    let mut out_buf = vec![0u8; OUTPUT_CHUNK];
    let mut err_buf = vec![0u8; OUTPUT_CHUNK];

    while stdout.is_some() || stderr.is_some() {
        let (n, from_stdout) = tokio::select! {
            n = read_from(&mut stdout, &mut out_buf) => (n, true),
            n = read_from(&mut stderr, &mut err_buf) => (n, false),
        };
        let chunk = match (n, from_stdout) {
            (0, true) => {
                stdout = None;
                continue;
            }
            (0, false) => {
                stderr = None;
                continue;
            }
            (n, true) => &out_buf[..n],
            (n, false) => &err_buf[..n],
        };
        if to_app.write_all(chunk).await.is_err() {
            return;
        }
    }
    let _ = to_app.shutdown().await;
}

/// Tie the process and the pipe together: whichever ends first ends the other
async fn supervise(
    mut child: Child,
    mut output: JoinHandle<()>,
    pipe: Pipe,
    pipes: Arc<dyn PipeClient>,
    app_id: String,
    pipe_id: String,
) {
    let closed = CancellationToken::new();
    let on_close = closed.clone();
    pipe.on_close(move || on_close.cancel());

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => debug!("Process on pipe {} exited: {}", pipe_id, status),
                Err(e) => warn!("Failed waiting for process on pipe {}: {}", pipe_id, e),
            }
            // Closing drops the unread ends, so let the last output land first.
            tokio::select! {
                _ = &mut output => {}
                _ = closed.cancelled() => {}
                _ = tokio::time::sleep(OUTPUT_FLUSH_TIMEOUT) => {
                    warn!("Output of process on pipe {} did not end; dropping it", pipe_id);
                    output.abort();
                }
            }
            pipe.close();
        }
        _ = closed.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill process on pipe {}: {}", pipe_id, e);
            }
        }
    }

    if let Err(e) = pipes.on_pipe_closed(&app_id, &pipe_id).await {
        warn!("Failed to close pipe {} on app {}: {:#}", pipe_id, app_id, e);
    }
}
