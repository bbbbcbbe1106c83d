//! Pipes between a UI and a probe, brokered by the app
//!
//! A pipe is created by whichever end connects first. Each end keeps a
//! reference count; a pipe whose end has had no connection for
//! `PIPE_TIMEOUT` is closed and tombstoned, and tombstones are forgotten
//! after `GC_TIMEOUT`. A closed pipe refuses new connections.

use periscope_common::Pipe;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

pub const GC_INTERVAL: Duration = Duration::from_secs(30);
pub const PIPE_TIMEOUT: Duration = Duration::from_secs(60);
pub const GC_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Ui,
    Probe,
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            End::Ui => write!(f, "ui"),
            End::Probe => write!(f, "probe"),
        }
    }
}

pub type EndIo = Arc<AsyncMutex<DuplexStream>>;

struct EndState {
    ref_count: usize,
    last_used: Instant,
    io: EndIo,
}

impl EndState {
    fn new(io: DuplexStream, now: Instant) -> Self {
        Self {
            ref_count: 0,
            last_used: now,
            io: Arc::new(AsyncMutex::new(io)),
        }
    }

    fn idle_since(&self, now: Instant) -> Option<Duration> {
        (self.ref_count == 0).then(|| now.duration_since(self.last_used))
    }
}

struct RoutedPipe {
    pipe: Pipe,
    ui: EndState,
    probe: EndState,
    tombstone: Option<Instant>,
}

impl RoutedPipe {
    fn new(now: Instant) -> Option<Self> {
        let pipe = Pipe::new();
        let ui = pipe.take_local()?;
        let probe = pipe.take_remote()?;
        Some(Self {
            pipe,
            ui: EndState::new(ui, now),
            probe: EndState::new(probe, now),
            tombstone: None,
        })
    }

    fn end_mut(&mut self, end: End) -> &mut EndState {
        match end {
            End::Ui => &mut self.ui,
            End::Probe => &mut self.probe,
        }
    }

    fn close(&mut self, now: Instant) {
        self.pipe.close();
        self.tombstone.get_or_insert(now);
    }
}

type Pipes = Arc<Mutex<HashMap<String, RoutedPipe>>>;

fn lock(pipes: &Pipes) -> MutexGuard<'_, HashMap<String, RoutedPipe>> {
    pipes.lock().unwrap_or_else(|e| e.into_inner())
}

/// One connection's hold on one end of a pipe; released on drop
pub struct PipeEnd {
    id: String,
    end: End,
    pipe: Pipe,
    io: EndIo,
    pipes: Pipes,
}

impl PipeEnd {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn end(&self) -> End {
        self.end
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    /// The byte stream for this end, shared by every connection to it
    pub fn io(&self) -> EndIo {
        Arc::clone(&self.io)
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let mut pipes = lock(&self.pipes);
        let Some(routed) = pipes.get_mut(&self.id) else {
            return;
        };
        let closed = routed.pipe.is_closed();
        let state = routed.end_mut(self.end);
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 && !closed {
            state.last_used = Instant::now();
        }
    }
}

/// In-memory pipe router with a background reaper
pub struct PipeRouter {
    pipes: Pipes,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl PipeRouter {
    /// Create the router and start its GC loop (needs a tokio runtime)
    pub fn new() -> Self {
        let router = Self {
            pipes: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        router
            .tasks
            .spawn(gc_loop(Arc::clone(&router.pipes), router.cancel.clone()));
        router
    }

    /// Connect to `end` of pipe `id`, creating the pipe if needed
    ///
    /// Returns `None` if the pipe has been closed.
    pub fn get(&self, id: &str, end: End) -> Option<PipeEnd> {
        let now = Instant::now();
        let mut pipes = lock(&self.pipes);
        if !pipes.contains_key(id) {
            debug!("Creating pipe {}", id);
            pipes.insert(id.to_string(), RoutedPipe::new(now)?);
        }
        let routed = pipes.get_mut(id)?;
        if routed.pipe.is_closed() {
            return None;
        }
        let pipe = routed.pipe.clone();
        let state = routed.end_mut(end);
        state.ref_count += 1;
        Some(PipeEnd {
            id: id.to_string(),
            end,
            pipe,
            io: Arc::clone(&state.io),
            pipes: Arc::clone(&self.pipes),
        })
    }

    /// Close pipe `id`; unknown ids are ignored
    pub fn delete(&self, id: &str) {
        if let Some(routed) = lock(&self.pipes).get_mut(id) {
            info!("Closing pipe {}", id);
            routed.close(Instant::now());
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        lock(&self.pipes).contains_key(id)
    }

    /// Pipes not yet closed
    pub fn open_count(&self) -> usize {
        lock(&self.pipes)
            .values()
            .filter(|routed| !routed.pipe.is_closed())
            .count()
    }

    /// Run one timeout + GC pass as of `now`
    pub fn sweep(&self, now: Instant) {
        sweep(&self.pipes, now);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        for routed in lock(&self.pipes).values() {
            routed.pipe.close();
        }
    }
}

impl Default for PipeRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep(pipes: &Pipes, now: Instant) {
    let mut pipes = lock(pipes);

    for (id, routed) in pipes.iter_mut() {
        if routed.pipe.is_closed() {
            continue;
        }
        let idle = [routed.ui.idle_since(now), routed.probe.idle_since(now)];
        if idle.into_iter().flatten().any(|d| d >= PIPE_TIMEOUT) {
            info!("Timing out pipe {}", id);
            routed.close(now);
        }
    }

    pipes.retain(|id, routed| {
        let expired = routed
            .tombstone
            .is_some_and(|at| now.duration_since(at) >= GC_TIMEOUT);
        if expired {
            debug!("Forgetting pipe {}", id);
        }
        !expired
    });
}

async fn gc_loop(pipes: Pipes, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    ticker.reset();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        sweep(&pipes, Instant::now());
    }
}
