pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "periscope")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Collects topology reports from periscope probes and serves the merged view", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the app server")]
    App {
        #[arg(short, long, help = "YAML config file")]
        config: Option<PathBuf>,

        #[arg(short, long, help = "Listen address (host:port)")]
        listen: Option<String>,

        #[arg(short, long, help = "Report window (e.g. 15s)", value_parser = humantime_serde::re::humantime::parse_duration)]
        window: Option<std::time::Duration>,

        #[arg(long, help = "Probe report stream to pull from (host:port)")]
        push_probe: Vec<String>,
    },
    #[command(about = "Print the merged report held by an app")]
    Report {
        #[arg(short, long, default_value = "http://localhost:4040", help = "App URL")]
        app: String,
    },
    #[command(about = "Print an app's details")]
    Details {
        #[arg(short, long, default_value = "http://localhost:4040", help = "App URL")]
        app: String,
    },
    #[command(about = "Run a control on a probe through an app")]
    Control {
        #[arg(short, long, default_value = "http://localhost:4040", help = "App URL")]
        app: String,

        #[arg(help = "Probe id")]
        probe_id: String,

        #[arg(help = "Node id the control applies to")]
        node_id: String,

        #[arg(help = "Control name (e.g. host_exec)")]
        control: String,
    },
}
