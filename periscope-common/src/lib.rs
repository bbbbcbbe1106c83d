//! Shared types between the periscope probe and app
//!
//! This crate defines everything both sides of the wire must agree on:
//! - `Report` and its merge semantics
//! - The report codec (JSON, optionally gzip-compressed)
//! - Pooled, reference-counted byte buffers for report payloads
//! - The `Details` handshake document and HTTP header names
//! - Control requests/responses, the handler registry and pipes
//! - Exponential backoff for reconnecting loops

pub mod backoff;
pub mod buffer;
pub mod codec;
pub mod control;
pub mod pipe;
pub mod report;
pub mod xfer;

pub use backoff::{retry_with_backoff, Backoff, Flow};
pub use buffer::{Buffer, BufferMut, BufferPool};
pub use codec::{CodecError, Encoding};
pub use control::{ControlError, ControlHandler, ControlRegistry, ControlRequest, ControlResponse};
pub use pipe::{Pipe, PipeClient};
pub use report::{LatestEntry, Node, Report, Topology};
pub use xfer::Details;

/// Version string reported in `Details` and probe headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
