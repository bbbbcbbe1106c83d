//! Fan-out to every app the probe knows about
//!
//! Endpoints are grouped by hostname (as resolved by the `Resolver`) but
//! clients are keyed by the app's self-reported identity, so an app reachable
//! through several addresses or names gets exactly one client and one copy of
//! each report.

use crate::app_client::{AppClient, HttpAppClient, ProbeCredentials};
use crate::publisher::{PublishError, Publisher};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use log::{info, warn};
use periscope_common::{Buffer, ControlError, ControlRegistry, Pipe, PipeClient};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

/// Bound on concurrent handshakes during `set`
pub const MAX_CONCURRENT_DETAILS: usize = 10;

/// Builds clients for endpoints
pub trait ClientFactory: Send + Sync {
    fn create(&self, hostname: &str, endpoint: &str) -> Result<Arc<dyn AppClient>>;
}

/// Creates `HttpAppClient`s sharing one HTTP client and control registry
pub struct HttpClientFactory {
    http: reqwest::Client,
    credentials: ProbeCredentials,
    registry: Arc<ControlRegistry>,
}

impl HttpClientFactory {
    pub fn new(
        http: reqwest::Client,
        credentials: ProbeCredentials,
        registry: Arc<ControlRegistry>,
    ) -> Self {
        Self {
            http,
            credentials,
            registry,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, _hostname: &str, endpoint: &str) -> Result<Arc<dyn AppClient>> {
        let client = HttpAppClient::new(
            endpoint,
            self.http.clone(),
            self.credentials.clone(),
            Arc::clone(&self.registry),
        )?;
        Ok(Arc::new(client))
    }
}

#[derive(Default)]
struct State {
    // app id -> client
    clients: HashMap<String, Arc<dyn AppClient>>,
    // hostname -> app ids
    ids: HashMap<String, BTreeSet<String>>,
}

/// Keeps one `AppClient` per app identity
pub struct MultiAppClient {
    factory: Arc<dyn ClientFactory>,
    semaphore: Semaphore,
    state: Mutex<State>,
}

impl MultiAppClient {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            semaphore: Semaphore::new(MAX_CONCURRENT_DETAILS),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the endpoints known for `hostname`
    pub async fn set(&self, hostname: &str, endpoints: &[String]) {
        let handshakes = endpoints.iter().map(|endpoint| async move {
            let _permit = self.semaphore.acquire().await.ok()?;
            let client = match self.factory.create(hostname, endpoint) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Error creating app client for {}: {:#}", endpoint, e);
                    return None;
                }
            };
            match client.details().await {
                Ok(details) => Some((details.id, client)),
                Err(e) => {
                    warn!("Error fetching app details from {}: {:#}", endpoint, e);
                    client.stop().await;
                    None
                }
            }
        });
        let fetched: Vec<_> = join_all(handshakes).await.into_iter().flatten().collect();

        let mut to_stop = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            let mut host_ids = BTreeSet::new();
            for (id, client) in fetched {
                host_ids.insert(id.clone());
                if state.clients.contains_key(&id) {
                    to_stop.push(client);
                } else {
                    info!("Connected to app {} at {}", id, client.target());
                    client.control_connection();
                    state.clients.insert(id, client);
                }
            }
            if host_ids.is_empty() {
                state.ids.remove(hostname);
            } else {
                state.ids.insert(hostname.to_string(), host_ids);
            }

            let referenced: HashSet<&String> = state.ids.values().flatten().collect();
            let stale: Vec<String> = state
                .clients
                .keys()
                .filter(|id| !referenced.contains(id))
                .cloned()
                .collect();
            for id in stale {
                if let Some(client) = state.clients.remove(&id) {
                    info!("Disconnecting from app {} at {}", id, client.target());
                    to_stop.push(client);
                }
            }
        }

        for client in to_stop {
            client.stop().await;
        }
    }

    /// Forget every endpoint of `hostname`
    pub async fn remove(&self, hostname: &str) {
        self.set(hostname, &[]).await;
    }

    /// Identities of the apps currently connected
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn client(&self, app_id: &str) -> Result<Arc<dyn AppClient>, ControlError> {
        self.lock()
            .clients
            .get(app_id)
            .cloned()
            .ok_or_else(|| ControlError::UnknownApp(app_id.to_string()))
    }

    /// Carry a pipe to the app with identity `app_id`
    pub fn pipe_connection(
        &self,
        app_id: &str,
        pipe_id: &str,
        pipe: Pipe,
    ) -> Result<(), ControlError> {
        self.client(app_id)?.pipe_connection(pipe_id, pipe);
        Ok(())
    }

    /// Tell the app with identity `app_id` that a pipe is gone
    pub async fn pipe_close(&self, app_id: &str, pipe_id: &str) -> Result<()> {
        self.client(app_id)?.pipe_close(pipe_id).await
    }

    /// Stop every client
    pub async fn stop(&self) {
        let clients: Vec<_> = {
            let mut state = self.lock();
            state.ids.clear();
            state.clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.stop().await;
        }
    }
}

impl Publisher for MultiAppClient {
    /// One delivery per identity; a failing client does not stop the others
    fn publish(&self, payload: Buffer) -> Result<(), PublishError> {
        let clients: Vec<_> = self.lock().clients.values().cloned().collect();

        let errors = clients
            .iter()
            .filter_map(|client| {
                client
                    .publish(payload.retain())
                    .err()
                    .map(|e| PublishError::target(client.target(), e))
            })
            .collect();
        payload.release();

        PublishError::collect(errors)
    }
}

#[async_trait]
impl PipeClient for MultiAppClient {
    async fn on_pipe_opened(&self, app_id: &str, pipe_id: &str, pipe: Pipe) -> Result<()> {
        Ok(self.pipe_connection(app_id, pipe_id, pipe)?)
    }

    async fn on_pipe_closed(&self, app_id: &str, pipe_id: &str) -> Result<()> {
        self.pipe_close(app_id, pipe_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_common::Details;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        publishes: AtomicUsize,
        stops: AtomicUsize,
        controls: AtomicUsize,
    }

    struct MockClient {
        endpoint: String,
        id: Option<String>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl AppClient for MockClient {
        fn target(&self) -> &str {
            &self.endpoint
        }

        async fn details(&self) -> Result<Details> {
            match &self.id {
                Some(id) => Ok(Details {
                    id: id.clone(),
                    version: "0.0.0".to_string(),
                    hostname: String::new(),
                }),
                None => anyhow::bail!("connection refused"),
            }
        }

        fn control_connection(&self) {
            self.counters.controls.fetch_add(1, Ordering::SeqCst);
        }

        fn publish(&self, payload: Buffer) -> Result<()> {
            payload.release();
            self.counters.publishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pipe_connection(&self, _pipe_id: &str, _pipe: Pipe) {}

        async fn pipe_close(&self, _pipe_id: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Endpoint "xN" reports identity "N"; "down" fails its handshake
    struct MockFactory {
        counters: Arc<Counters>,
    }

    impl ClientFactory for MockFactory {
        fn create(&self, _hostname: &str, endpoint: &str) -> Result<Arc<dyn AppClient>> {
            let id = (endpoint != "down").then(|| endpoint[1..].to_string());
            Ok(Arc::new(MockClient {
                endpoint: endpoint.to_string(),
                id,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    fn multi() -> (MultiAppClient, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = MockFactory {
            counters: Arc::clone(&counters),
        };
        (MultiAppClient::new(Arc::new(factory)), counters)
    }

    fn endpoints(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_publish_once_per_identity() {
        let (multi, counters) = multi();
        multi.set("a", &endpoints(&["a1", "b1"])).await;
        multi.set("b", &endpoints(&["c3"])).await;

        assert_eq!(multi.identities(), vec!["1", "3"]);
        // b1 duplicated identity 1 and was stopped straight away.
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(counters.controls.load(Ordering::SeqCst), 2);

        let payload = Buffer::from_vec(b"report".to_vec());
        let observer = payload.retain();
        multi.publish(payload).expect("publish");
        assert_eq!(counters.publishes.load(Ordering::SeqCst), 2);
        assert_eq!(observer.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_identity_shared_across_hostnames() {
        let (multi, counters) = multi();
        multi.set("first", &endpoints(&["a7"])).await;
        multi.set("second", &endpoints(&["b7"])).await;
        assert_eq!(multi.identities(), vec!["7"]);

        multi.remove("first").await;
        assert_eq!(multi.identities(), vec!["7"]);
        // Only the duplicate from "second" has been stopped so far.
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);

        multi.remove("second").await;
        assert!(multi.identities().is_empty());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_omitted() {
        let (multi, counters) = multi();
        multi.set("a", &endpoints(&["down", "a2"])).await;
        assert_eq!(multi.identities(), vec!["2"]);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_replaces_wholesale() {
        let (multi, _counters) = multi();
        multi.set("a", &endpoints(&["a1", "a2"])).await;
        multi.set("a", &endpoints(&["a3"])).await;
        assert_eq!(multi.identities(), vec!["3"]);
    }

    #[tokio::test]
    async fn test_pipe_to_unknown_app_is_an_error() {
        let (multi, _counters) = multi();
        multi.set("a", &endpoints(&["a1"])).await;
        assert!(multi.pipe_connection("1", "pipe", Pipe::new()).is_ok());
        assert!(matches!(
            multi.pipe_connection("9", "pipe", Pipe::new()),
            Err(ControlError::UnknownApp(_))
        ));
        assert!(multi.on_pipe_closed("9", "pipe").await.is_err());
    }

    #[tokio::test]
    async fn test_set_after_poisoned_lock_keeps_clients() {
        let (multi, counters) = multi();
        multi.set("a", &endpoints(&["a1"])).await;
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = multi.state.lock().unwrap();
            panic!("poison the state lock");
        }));
        assert!(multi.state.is_poisoned());

        multi.set("b", &endpoints(&["b2"])).await;
        assert_eq!(multi.identities(), vec!["1", "2"]);
        assert_eq!(counters.controls.load(Ordering::SeqCst), 2);

        multi.stop().await;
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_stops_everything() {
        let (multi, counters) = multi();
        multi.set("a", &endpoints(&["a1"])).await;
        multi.set("b", &endpoints(&["b2"])).await;
        multi.stop().await;
        assert!(multi.identities().is_empty());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
        assert!(multi.publish(Buffer::from_vec(Vec::new())).is_ok());
    }
}
