//! Reports the host the probe runs on

use crate::probe::Reporter;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use periscope_common::report::{topology, Node};
use periscope_common::{Report, VERSION};

pub const HOSTNAME: &str = "hostname";
pub const PROBE_ID: &str = "probe_id";
pub const PROBE_VERSION: &str = "probe_version";
pub const OS: &str = "os";

pub struct HostReporter {
    hostname: String,
    probe_id: String,
}

impl HostReporter {
    pub fn new(hostname: impl Into<String>, probe_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            probe_id: probe_id.into(),
        }
    }

    /// Node id used for a host in the host topology
    pub fn node_id(hostname: &str) -> String {
        format!("{};<host>", hostname)
    }
}

#[async_trait]
impl Reporter for HostReporter {
    fn name(&self) -> &str {
        "host"
    }

    async fn report(&self) -> Result<Report> {
        let now = Utc::now();
        let mut rpt = Report::new();
        rpt.topology_mut(topology::HOST).add_node(
            Node::new(Self::node_id(&self.hostname))
                .with_latest(HOSTNAME, now, self.hostname.as_str())
                .with_latest(PROBE_ID, now, self.probe_id.as_str())
                .with_latest(PROBE_VERSION, now, VERSION)
                .with_latest(OS, now, std::env::consts::OS),
        );
        Ok(rpt)
    }
}
