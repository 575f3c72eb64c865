//! Crate-wide error types.

use thiserror::Error;

/// One variant per observable failure mode.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed to parse or validate. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Network, DNS, or timeout failure while probing. The tick is skipped.
    #[error("probe transport failure: {0}")]
    ProbeTransport(String),
    /// The probe's URL could not be parsed. The tick is skipped.
    #[error("malformed probe URL {url}: {reason}")]
    ProbeMalformedUrl { url: String, reason: String },
    /// A placeholder could not be resolved against the response map.
    /// Aborts the remaining steps of the current tick.
    #[error("placeholder resolution failed: {0}")]
    PlaceholderResolution(String),
    /// A backend rejected a single record. The record is dropped.
    #[error("sink rejected record: {0}")]
    SinkTransient(String),
    /// A required backend could not be reached at startup.
    #[error("sink unavailable: {0}")]
    SinkFatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
