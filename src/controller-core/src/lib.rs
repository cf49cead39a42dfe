use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    /// The cluster state could not be read; the snapshot for this tick is lost.
    #[error("FetchError: {0}")]
    FetchError(String),

    #[error("MalformedObject: {0}")]
    MalformedObject(String),

    #[error("EvictionTimeout: {} not confirmed within {timeout:?}", .pods.join(","))]
    EvictionTimeout { pods: Vec<String>, timeout: Duration },

    #[error("EvictionFailed: {pod}: {reason}")]
    EvictionFailed { pod: String, reason: String },

    #[error("InvariantViolation: {0}")]
    InvariantViolation(String),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("TelemetryError: {0}")]
    TelemetryError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kubeerror",
            Error::FetchError(_) => "fetcherror",
            Error::MalformedObject(_) => "malformedobject",
            Error::EvictionTimeout { .. } => "evictiontimeout",
            Error::EvictionFailed { .. } => "evictionfailed",
            Error::InvariantViolation(_) => "invariantviolation",
            Error::ConfigError(_) => "configerror",
            Error::TelemetryError(_) => "telemetryerror",
        }
        .to_string()
    }

    /// Whether the next tick may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::FetchError(_)
                | Error::EvictionTimeout { .. }
                | Error::EvictionFailed { .. }
        )
    }
}

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::{Metrics, TickMeasurer};
