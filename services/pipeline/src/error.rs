//! Error classification shared by the router and the workers.

use serde::Serialize;
use std::fmt;

/// How a failure is treated by the delivery machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or unsupported event. Acknowledged, never retried.
    Validation,
    /// Transport or repository unreachable. Retried through redelivery.
    TransientInfra,
    /// Valid event whose extraction or persistence failed. Retried, then dead-lettered.
    Processing,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::TransientInfra => "transient_infra",
            ErrorClass::Processing => "processing",
        }
    }

    /// Whether redelivery may succeed where this attempt failed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Validation)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can surface while handling a message.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
