//! App side of periscope
//!
//! - `Collector`: merges reports from many probes over a time window
//! - `PushCollector`: reads report streams from probes over TCP
//! - `ControlRouter` / `PipeRouter`: controls and pipes towards probes
//! - `router`: the HTTP and WebSocket API tying it together

pub mod collector;
pub mod control_router;
pub mod error;
pub mod metrics;
pub mod pipe_router;
pub mod push_collector;
pub mod router;

pub use collector::Collector;
pub use control_router::ControlRouter;
pub use error::AppError;
pub use metrics::AppMetrics;
pub use pipe_router::{End, PipeRouter};
pub use push_collector::PushCollector;
pub use router::{router, serve, AppState};
