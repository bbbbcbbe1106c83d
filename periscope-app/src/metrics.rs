//! Prometheus metrics exported at `/metrics`

use prometheus::{Counter, Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "periscope";

pub struct AppMetrics {
    registry: Registry,
    /// Reports accepted, by transport (http/tcp)
    pub reports_received: IntCounterVec,
    /// Bytes of encoded report bodies accepted
    pub report_bytes: Counter,
    /// Reports rejected because they failed to decode
    pub decode_errors: IntCounterVec,
    /// Probes with a live control connection
    pub probes_connected: IntGauge,
    /// Control requests forwarded to probes, by outcome
    pub control_requests: IntCounterVec,
    /// Pipes currently open
    pub pipes_open: IntGauge,
}

impl AppMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let reports_received = IntCounterVec::new(
            Opts::new("reports_received_total", "Reports accepted by transport.")
                .namespace(NAMESPACE),
            &["transport"],
        )?;
        let report_bytes = Counter::with_opts(
            Opts::new("report_bytes_total", "Encoded report bytes accepted.").namespace(NAMESPACE),
        )?;
        let decode_errors = IntCounterVec::new(
            Opts::new("report_decode_errors_total", "Reports that failed to decode.")
                .namespace(NAMESPACE),
            &["transport"],
        )?;
        let probes_connected = IntGauge::with_opts(
            Opts::new(
                "probes_connected",
                "Probes with an open control connection.",
            )
            .namespace(NAMESPACE),
        )?;
        let control_requests = IntCounterVec::new(
            Opts::new("control_requests_total", "Control requests by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let pipes_open = IntGauge::with_opts(
            Opts::new("pipes_open", "Pipes currently open.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(reports_received.clone()))?;
        registry.register(Box::new(report_bytes.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(probes_connected.clone()))?;
        registry.register(Box::new(control_requests.clone()))?;
        registry.register(Box::new(pipes_open.clone()))?;

        Ok(Self {
            registry,
            reports_received,
            report_bytes,
            decode_errors,
            probes_connected,
            control_requests,
            pipes_open,
        })
    }

    /// Render every registered metric in the text exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
