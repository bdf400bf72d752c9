// SPDX-License-Identifier: MPL-2.0

//! Error types for the acquisition engine and capture backends

use std::fmt;

/// Result type alias for device and engine operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Result type alias for parameter registry operations
pub type ParameterResult<T> = Result<T, ParameterError>;

/// Device- and engine-level errors
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// The requested device is not present
    DeviceNotFound(String),
    /// The device exists but is held by another process
    DeviceBusy(String),
    /// Opaque device or transport failure
    Device(String),
    /// Operation is illegal in the current engine state
    State(String),
    /// A parameter operation failed
    Parameter(ParameterError),
    /// The device or format is not supported by this backend
    Unsupported(String),
}

/// Parameter registry errors
#[derive(Debug, Clone)]
pub enum ParameterError {
    /// No parameter with this name
    NotFound(String),
    /// Parameter exists but cannot currently be read
    NotReadable(String),
    /// Parameter exists but cannot currently be written
    NotWritable(String),
    /// Numeric value outside the device range (reported after clamping)
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Enum entry unknown to the device
    Rejected { name: String, value: String },
    /// Value variant does not match the parameter kind
    Type { name: String, expected: &'static str },
}

/// Per-pull failure taxonomy for the streaming loop
///
/// Only `Timeout` and `Device` advance the engine's consecutive-failure
/// counter; `Incomplete` is logged and discarded.
#[derive(Debug, Clone)]
pub enum PullError {
    /// No frame arrived within the pull timeout
    Timeout,
    /// A frame arrived but its payload is truncated or flagged invalid
    Incomplete(String),
    /// The device or transport failed while pulling
    Device(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceNotFound(id) => write!(f, "Device not found: {}", id),
            CaptureError::DeviceBusy(id) => write!(f, "Device is busy: {}", id),
            CaptureError::Device(msg) => write!(f, "Device error: {}", msg),
            CaptureError::State(msg) => write!(f, "Invalid state: {}", msg),
            CaptureError::Parameter(e) => write!(f, "Parameter error: {}", e),
            CaptureError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterError::NotFound(name) => write!(f, "Parameter not found: {}", name),
            ParameterError::NotReadable(name) => write!(f, "Parameter not readable: {}", name),
            ParameterError::NotWritable(name) => write!(f, "Parameter not writable: {}", name),
            ParameterError::OutOfRange {
                name,
                value,
                min,
                max,
            } => write!(
                f,
                "Value {} for '{}' outside range [{}, {}]",
                value, name, min, max
            ),
            ParameterError::Rejected { name, value } => {
                write!(f, "Entry '{}' rejected for '{}'", value, name)
            }
            ParameterError::Type { name, expected } => {
                write!(f, "Wrong value type for '{}' (expected {})", name, expected)
            }
        }
    }
}

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullError::Timeout => write!(f, "Timed out waiting for frame"),
            PullError::Incomplete(msg) => write!(f, "Incomplete frame: {}", msg),
            PullError::Device(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}
impl std::error::Error for ParameterError {}
impl std::error::Error for PullError {}

impl From<ParameterError> for CaptureError {
    fn from(err: ParameterError) -> Self {
        CaptureError::Parameter(err)
    }
}

impl From<PullError> for CaptureError {
    fn from(err: PullError) -> Self {
        match err {
            PullError::Timeout => CaptureError::Device("frame pull timed out".into()),
            PullError::Incomplete(msg) => CaptureError::Device(format!("incomplete frame: {}", msg)),
            PullError::Device(msg) => CaptureError::Device(msg),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Device(err.to_string())
    }
}
