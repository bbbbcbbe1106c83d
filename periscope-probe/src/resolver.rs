//! Periodic resolution of app targets into endpoints

use crate::multi_client::MultiAppClient;
use async_trait::async_trait;
use log::{debug, warn};
use periscope_common::xfer::APP_PORT;
use reqwest::Url;
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often targets are re-resolved once the resolver is warmed up
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

const FAST_START: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// A parsed app location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub original: String,
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

impl Target {
    /// URL of this target with the host replaced by `ip`
    pub fn endpoint(&self, ip: IpAddr) -> String {
        let path = if self.path == "/" { "" } else { &self.path };
        format!("{}://{}:{}{}", self.scheme, ip, self.port, path)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

fn has_explicit_port(url: &str) -> bool {
    let authority = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest)
        .split('/')
        .next()
        .unwrap_or_default();
    authority
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

/// Parse target strings, filling in a default scheme and port
///
/// Bare hosts get `http` (or `https` when given as `host:443`) and the app
/// port; URLs with an explicit scheme default to 80/443.
pub fn parse_targets<S: AsRef<str>>(targets: &[S]) -> Result<Vec<Target>, ResolverError> {
    targets
        .iter()
        .map(|target| parse_target(target.as_ref()))
        .collect()
}

fn parse_target(target: &str) -> Result<Target, ResolverError> {
    let invalid = |reason: String| ResolverError::InvalidTarget {
        target: target.to_string(),
        reason,
    };

    let bare = !target.contains("://");
    let full = if !bare {
        target.to_string()
    } else if target.ends_with(":443") {
        format!("https://{}", target)
    } else {
        format!("http://{}", target)
    };

    let url = Url::parse(&full).map_err(|e| invalid(e.to_string()))?;
    let hostname = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?
        .to_string();

    let port = if has_explicit_port(&full) || !bare {
        url.port_or_known_default()
            .ok_or_else(|| invalid(format!("no default port for {}", url.scheme())))?
    } else {
        APP_PORT
    };

    Ok(Target {
        original: target.to_string(),
        scheme: url.scheme().to_string(),
        hostname,
        port,
        path: url.path().to_string(),
    })
}

/// Hostname lookup
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

/// Lookup through the system resolver
pub struct DnsLookup;

#[async_trait]
impl Lookup for DnsLookup {
    async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((hostname, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Receives the endpoints a hostname currently resolves to
#[async_trait]
pub trait EndpointSink: Send + Sync {
    async fn set(&self, hostname: &str, endpoints: Vec<String>);
}

#[async_trait]
impl EndpointSink for MultiAppClient {
    async fn set(&self, hostname: &str, endpoints: Vec<String>) {
        MultiAppClient::set(self, hostname, &endpoints).await
    }
}

/// Background task re-resolving targets and feeding an `EndpointSink`
pub struct Resolver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Resolver {
    /// Resolve every target now, then every `poll_interval`
    ///
    /// Early rounds come faster: 1s, doubling up to `poll_interval`.
    pub fn spawn(
        targets: Vec<Target>,
        sink: Arc<dyn EndpointSink>,
        lookup: Arc<dyn Lookup>,
        poll_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut failed = HashSet::new();
            let mut delay = FAST_START.min(poll_interval);
            loop {
                for target in &targets {
                    let endpoints = resolve_one(target, lookup.as_ref(), &mut failed).await;
                    debug!("Target {} resolved to {:?}", target, endpoints);
                    sink.set(&target.hostname, endpoints).await;
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(poll_interval);
            }
        });
        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn resolve_one(
    target: &Target,
    lookup: &dyn Lookup,
    failed: &mut HashSet<String>,
) -> Vec<String> {
    let addrs = match target.hostname.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => match lookup.lookup(&target.hostname).await {
            Ok(addrs) => {
                failed.remove(&target.hostname);
                addrs
            }
            Err(e) => {
                // Only log the first failure until the name resolves again.
                if failed.insert(target.hostname.clone()) {
                    warn!("Cannot resolve '{}': {}", target.hostname, e);
                }
                return Vec::new();
            }
        },
    };

    let mut endpoints: Vec<String> = addrs
        .into_iter()
        .filter(IpAddr::is_ipv4)
        .map(|ip| target.endpoint(ip))
        .collect();
    endpoints.sort();
    endpoints.dedup();
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[test]
    fn test_parse_targets() {
        let cases = [
            ("foo", "http", 4040),
            ("foo:80", "http", 80),
            ("foo:443", "https", 443),
            ("foo:1234", "http", 1234),
            ("http://foo", "http", 80),
            ("http://foo:80", "http", 80),
            ("https://foo", "https", 443),
            ("https://foo:1234", "https", 1234),
            ("http://foo:4040", "http", 4040),
        ];
        for (input, scheme, port) in cases {
            let target = &parse_targets(&[input]).expect(input)[0];
            assert_eq!(target.hostname, "foo", "{}", input);
            assert_eq!(target.scheme, scheme, "{}", input);
            assert_eq!(target.port, port, "{}", input);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_targets(&["http://"]).is_err());
        assert!(parse_targets(&["foo:notaport"]).is_err());
    }

    struct StaticLookup(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl Lookup for StaticLookup {
        async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(hostname)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not found"))
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<HashMap<String, Vec<String>>>);

    #[async_trait]
    impl EndpointSink for RecordingSink {
        async fn set(&self, hostname: &str, endpoints: Vec<String>) {
            self.0
                .lock()
                .unwrap()
                .insert(hostname.to_string(), endpoints);
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_feeds_sink() {
        let lookup = StaticLookup(HashMap::from([
            ("foo", vec![v4(192, 168, 0, 1)]),
            (
                "bar",
                vec![v4(192, 168, 0, 2), "::1".parse().unwrap(), v4(192, 168, 0, 3)],
            ),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let targets = parse_targets(&["foo", "https://bar", "10.0.0.9:4041", "missing"]).unwrap();

        let resolver = Resolver::spawn(
            targets,
            sink.clone(),
            Arc::new(lookup),
            DEFAULT_POLL_INTERVAL,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.stop().await;

        let seen = sink.0.lock().unwrap();
        assert_eq!(seen["foo"], vec!["http://192.168.0.1:4040"]);
        assert_eq!(
            seen["bar"],
            vec!["https://192.168.0.2:443", "https://192.168.0.3:443"]
        );
        assert_eq!(seen["10.0.0.9"], vec!["http://10.0.0.9:4041"]);
        assert!(seen["missing"].is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_start_ramps_up() {
        #[derive(Default)]
        struct Counting(Mutex<usize>);

        #[async_trait]
        impl EndpointSink for Counting {
            async fn set(&self, _hostname: &str, _endpoints: Vec<String>) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let sink = Arc::new(Counting::default());
        let resolver = Resolver::spawn(
            parse_targets(&["127.0.0.1"]).unwrap(),
            sink.clone(),
            Arc::new(DnsLookup),
            Duration::from_secs(10),
        );
        // Rounds at 0s, 1s, 3s, 7s, 15s, then every 10s.
        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(*sink.0.lock().unwrap(), 4);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*sink.0.lock().unwrap(), 5);
        resolver.stop().await;
    }
}
