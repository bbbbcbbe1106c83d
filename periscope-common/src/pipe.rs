//! Bidirectional byte pipes opened by controls

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

/// In-memory buffer per direction
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

type OnClose = Box<dyn FnOnce() + Send>;

struct PipeInner {
    local: Mutex<Option<DuplexStream>>,
    remote: Mutex<Option<DuplexStream>>,
    // `None` once the pipe is closed
    on_close: Mutex<Option<Vec<OnClose>>>,
    closed: CancellationToken,
}

/// A pair of connected in-memory streams
///
/// The `local` end is used by whatever runs on the probe (e.g. a shell), the
/// `remote` end is forwarded to the app. Clones share the same pipe.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    pub fn new() -> Self {
        let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        Self {
            inner: Arc::new(PipeInner {
                local: Mutex::new(Some(local)),
                remote: Mutex::new(Some(remote)),
                on_close: Mutex::new(Some(Vec::new())),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Take the local end; `None` if already taken or closed
    pub fn take_local(&self) -> Option<DuplexStream> {
        self.inner.local.lock().ok()?.take()
    }

    /// Take the remote end; `None` if already taken or closed
    pub fn take_remote(&self) -> Option<DuplexStream> {
        self.inner.remote.lock().ok()?.take()
    }

    /// Run `f` when the pipe closes, or right away if it already has
    pub fn on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let run_now = match self.inner.on_close.lock() {
            Ok(mut callbacks) => match callbacks.as_mut() {
                Some(list) => {
                    list.push(Box::new(f));
                    None
                }
                None => Some(f),
            },
            Err(_) => Some(f),
        };
        if let Some(f) = run_now {
            f();
        }
    }

    /// Close the pipe; only the first call has any effect
    pub fn close(&self) {
        let callbacks = match self.inner.on_close.lock() {
            Ok(mut callbacks) => callbacks.take(),
            Err(_) => None,
        };
        let Some(callbacks) = callbacks else {
            return;
        };

        // Dropping untaken ends makes readers on the other side see EOF.
        if let Ok(mut local) = self.inner.local.lock() {
            local.take();
        }
        if let Ok(mut remote) = self.inner.remote.lock() {
            remote.take();
        }
        self.inner.closed.cancel();

        for callback in callbacks {
            callback();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Something that can carry a pipe's remote end to an app
#[async_trait]
pub trait PipeClient: Send + Sync {
    async fn on_pipe_opened(&self, app_id: &str, pipe_id: &str, pipe: Pipe) -> anyhow::Result<()>;

    async fn on_pipe_closed(&self, app_id: &str, pipe_id: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_ends_are_connected() {
        let pipe = Pipe::new();
        let mut local = pipe.take_local().expect("local end");
        let mut remote = pipe.take_remote().expect("remote end");
        assert!(pipe.take_local().is_none());

        local.write_all(b"ls\n").await.expect("write");
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ls\n");
    }

    #[tokio::test]
    async fn test_close_runs_callbacks_once() {
        let pipe = Pipe::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let c = Arc::clone(&count);
            pipe.on_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        pipe.close();
        pipe.clone().close();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(pipe.is_closed());

        // Registered after close: runs immediately.
        let c = Arc::clone(&count);
        pipe.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(pipe.take_remote().is_none());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiters() {
        let pipe = Pipe::new();
        let waiter = pipe.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        pipe.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("waiter panicked");
    }

    #[tokio::test]
    async fn test_close_gives_eof_to_taken_end() {
        let pipe = Pipe::new();
        let mut remote = pipe.take_remote().expect("remote end");
        pipe.close();
        let mut buf = Vec::new();
        let n = remote.read_to_end(&mut buf).await.expect("read");
        assert_eq!(n, 0);
    }
}
