//! Handshake document and HTTP conventions shared by probe and app

use serde::{Deserialize, Serialize};

/// Default port the app listens on
pub const APP_PORT: u16 = 4040;

/// Header carrying the probe's unique id
pub const PROBE_ID_HEADER: &str = "X-Periscope-Probe-ID";

/// Header carrying the probe's version
pub const PROBE_VERSION_HEADER: &str = "X-Periscope-Probe-Version";

pub const DETAILS_PATH: &str = "/api";
pub const REPORT_PATH: &str = "/api/report";
pub const CONTROL_WS_PATH: &str = "/api/control/ws";

/// Details served by an app at `GET /api`; `id` identifies the app instance
/// and is what probes deduplicate on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub hostname: String,
}

/// Value for the `Authorization` header sent by probes
pub fn authorization_header(token: &str) -> String {
    format!("Periscope-Probe token={}", token)
}

/// Path of the probe end of a pipe
pub fn pipe_probe_path(pipe_id: &str) -> String {
    format!("/api/pipe/{}/probe", pipe_id)
}

/// Path used to delete a pipe
pub fn pipe_path(pipe_id: &str) -> String {
    format!("/api/pipe/{}", pipe_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_header() {
        assert_eq!(
            authorization_header("abcdefg"),
            "Periscope-Probe token=abcdefg"
        );
    }

    #[test]
    fn test_details_tolerates_missing_hostname() {
        let details: Details =
            serde_json::from_str(r#"{"id":"1234","version":"0.1.0"}"#).expect("parse details");
        assert_eq!(details.id, "1234");
        assert!(details.hostname.is_empty());
    }
}
