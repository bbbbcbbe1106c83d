//! Probe agent for periscope
//!
//! The probe runs on each host and:
//! - Generates topology reports from pluggable reporters
//! - Resolves app targets and keeps one client per app identity
//! - Publishes reports latest-wins over HTTP, and optionally as a TCP stream
//! - Serves controls (e.g. a host shell) over a WebSocket to each app

pub mod app_client;
pub mod config;
pub mod controls;
pub mod multi_client;
pub mod probe;
pub mod publisher;
pub mod reporters;
pub mod resolver;
pub mod sender;
pub mod tcp_publisher;

pub use app_client::{AppClient, HttpAppClient, ProbeCredentials};
pub use config::{ConfigError, ProbeConfig};
pub use multi_client::{ClientFactory, HttpClientFactory, MultiAppClient};
pub use probe::{Probe, Reporter, Tagger, Ticker};
pub use publisher::{EncodingPublisher, PublishError, Publisher, ReportPublisher};
pub use resolver::{parse_targets, Resolver};
pub use sender::{Deliver, HttpDelivery, LatestSender};
pub use tcp_publisher::TcpPublisher;
