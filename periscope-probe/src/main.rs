//! periscope-probe - host agent
//!
//! The probe runs on every host and:
//! - Generates a report each publish interval
//! - Publishes it to every app it resolves, once per app identity
//! - Optionally streams reports to push collectors over TCP
//! - Serves controls requested by apps

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use periscope_common::{ControlRegistry, Encoding};
use periscope_probe::app_client::http_client;
use periscope_probe::controls::register_controls;
use periscope_probe::reporters::HostReporter;
use periscope_probe::resolver::DnsLookup;
use periscope_probe::{
    parse_targets, EncodingPublisher, HttpClientFactory, MultiAppClient, Probe, ProbeConfig,
    ProbeCredentials, Publisher, Resolver, TcpPublisher,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(name = "periscope-probe")]
#[command(about = "Publishes host topology reports to periscope apps", long_about = None)]
#[command(version)]
struct Args {
    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Apps to publish to (hostname, host:port or URL); overrides the config file
    targets: Vec<String>,

    /// Token presented to apps
    #[arg(long)]
    token: Option<String>,

    /// Publish interval (e.g. "3s")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    publish_interval: Option<Duration>,

    /// Spy interval (e.g. "1s")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    spy_interval: Option<Duration>,

    /// Stream reports to push collectors on this address
    #[arg(long)]
    stream_listen: Option<String>,

    /// Disable controls
    #[arg(long)]
    no_controls: bool,
}

impl Args {
    fn into_config(self) -> Result<ProbeConfig> {
        let mut config = match &self.config {
            Some(path) => ProbeConfig::load(path)?,
            None => ProbeConfig::default(),
        };
        if !self.targets.is_empty() {
            config.targets = self.targets;
        }
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(interval) = self.publish_interval {
            config.publish_interval = interval;
        }
        if let Some(interval) = self.spy_interval {
            config.spy_interval = interval;
        }
        if self.stream_listen.is_some() {
            config.stream_listen = self.stream_listen;
        }
        config.no_controls |= self.no_controls;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Args::parse().into_config()?;
    if config.probe_id.is_empty() {
        config.probe_id = uuid::Uuid::new_v4().to_string();
    }
    let hostname = hostname::get()
        .context("Failed to read hostname")?
        .to_string_lossy()
        .into_owned();

    info!(
        "periscope-probe {} starting on {} (id {})",
        periscope_common::VERSION,
        hostname,
        config.probe_id
    );

    let registry = Arc::new(ControlRegistry::new());
    let factory = HttpClientFactory::new(
        http_client()?,
        ProbeCredentials {
            probe_id: config.probe_id.clone(),
            token: config.token.clone(),
        },
        Arc::clone(&registry),
    );
    let apps = Arc::new(MultiAppClient::new(Arc::new(factory)));
    if !config.no_controls {
        register_controls(&registry, &config.shell, apps.clone());
    }

    let mut publishers: Vec<Arc<dyn Publisher>> = vec![apps.clone() as Arc<dyn Publisher>];
    let stream = match &config.stream_listen {
        Some(addr) => {
            let stream = Arc::new(TcpPublisher::bind(addr).await?);
            publishers.push(stream.clone());
            Some(stream)
        }
        None => None,
    };

    let resolver = Resolver::spawn(
        parse_targets(&config.targets)?,
        apps.clone(),
        Arc::new(DnsLookup),
        config.resolve_interval,
    );

    let mut probe = Probe::new(
        config.spy_interval,
        config.publish_interval,
        Arc::new(EncodingPublisher::new(Encoding::JsonGzip, publishers)),
    );
    probe.add_reporter(Arc::new(HostReporter::new(&hostname, &config.probe_id)));
    probe.start();

    info!("periscope-probe running. Press Ctrl+C to exit.");
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    probe.stop(config.stop_grace).await;
    resolver.stop().await;
    apps.stop().await;
    if let Some(stream) = stream {
        stream.stop().await;
    }

    info!("periscope-probe stopped");
    Ok(())
}
