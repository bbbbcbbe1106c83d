//! Built-in reporters

pub mod host;

pub use host::HostReporter;
