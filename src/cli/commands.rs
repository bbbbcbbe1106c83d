use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::{PeriscopeError, Result};
use crate::server::AppServer;
use periscope_common::xfer::{DETAILS_PATH, REPORT_PATH};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::info;

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::App {
            config,
            listen,
            window,
            push_probe,
        } => handle_app(config, listen, window, push_probe).await,
        Commands::Report { app } => print_json(get(&app, REPORT_PATH).await?),
        Commands::Details { app } => print_json(get(&app, DETAILS_PATH).await?),
        Commands::Control {
            app,
            probe_id,
            node_id,
            control,
        } => handle_control(&app, &probe_id, &node_id, &control).await,
    }
}

async fn handle_app(
    config: Option<PathBuf>,
    listen: Option<String>,
    window: Option<Duration>,
    push_probes: Vec<String>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::default(),
    };
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if let Some(window) = window {
        config.window = window;
    }
    config.push_probes.extend(push_probes);

    let server = AppServer::start(&config).await?;
    info!("periscope app running on {}. Press Ctrl+C to exit.", server.local_addr());

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.shutdown().await
}

async fn handle_control(app: &str, probe_id: &str, node_id: &str, control: &str) -> Result<()> {
    let url = format!(
        "{}/api/control/{}/{}/{}",
        app.trim_end_matches('/'),
        probe_id,
        node_id,
        control
    );
    let response = reqwest::Client::new().post(url).send().await?;
    print_json(json_body(response).await?)
}

async fn get(app: &str, path: &str) -> Result<serde_json::Value> {
    let url = format!("{}{}", app.trim_end_matches('/'), path);
    let response = reqwest::get(url).await?;
    json_body(response).await
}

async fn json_body(response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        return Err(PeriscopeError::AppStatus {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response.json().await?)
}

fn print_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
