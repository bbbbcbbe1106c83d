//! Report publishing chain
//!
//! A report is encoded once by `EncodingPublisher` into a pooled buffer and
//! the frozen bytes are handed, by reference, to every byte-level
//! `Publisher` (the app fan-out and the TCP stream publisher).

use periscope_common::codec::{self, CodecError};
use periscope_common::{Buffer, BufferPool, Encoding, Report};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to encode report: {0}")]
    Codec(#[from] CodecError),

    #[error("publishing to {target}: {message}")]
    Target { target: String, message: String },

    #[error("{} publishes failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<PublishError>),

    #[error("publisher stopped")]
    Stopped,
}

fn join_errors(errors: &[PublishError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PublishError {
    pub fn target(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PublishError::Target {
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Fold individual failures into one result
    pub fn collect(mut errors: Vec<PublishError>) -> Result<(), PublishError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(PublishError::Aggregate(errors)),
        }
    }
}

/// Sends an already-encoded payload somewhere
///
/// Implementations take ownership of one reference to the payload and must
/// release it when done with it.
pub trait Publisher: Send + Sync {
    fn publish(&self, payload: Buffer) -> Result<(), PublishError>;
}

/// Publishes whole reports
pub trait ReportPublisher: Send + Sync {
    fn publish(&self, report: &Report) -> Result<(), PublishError>;
}

/// Encodes each report once and fans the bytes out to byte publishers
pub struct EncodingPublisher {
    pool: BufferPool,
    encoding: Encoding,
    publishers: Vec<Arc<dyn Publisher>>,
}

impl EncodingPublisher {
    pub fn new(encoding: Encoding, publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self {
            pool: BufferPool::default(),
            encoding,
            publishers,
        }
    }

    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }
}

impl ReportPublisher for EncodingPublisher {
    fn publish(&self, report: &Report) -> Result<(), PublishError> {
        let mut buf = self.pool.acquire();
        codec::encode_into(report, self.encoding, &mut buf)?;
        let payload = buf.freeze();

        let errors = self
            .publishers
            .iter()
            .filter_map(|publisher| publisher.publish(payload.retain()).err())
            .collect();
        payload.release();

        PublishError::collect(errors)
    }
}
