// SPDX-License-Identifier: MPL-2.0

//! scancap - frame acquisition for structured-light 3D scanning
//!
//! This library provides the capture side of a structured-light scanner:
//! device discovery, parameter handling, and a streaming engine that feeds
//! frames to the pattern decoding stage.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: capture device abstraction (generic/vision/depth)
//! - [`engine`]: the acquisition engine and its streaming loop
//! - [`params`]: parameter model and registry interface
//! - [`config`]: persistent parameter store
//! - [`convert`]: pixel format conversion helpers
//!
//! # Example
//!
//! ```ignore
//! let registry = BackendRegistry::with_defaults();
//! let mut engine = AcquisitionEngine::new(
//!     registry,
//!     EngineConfig::default(),
//!     ParameterStore::load(),
//! );
//! let (sink, frames) = ChannelSink::new();
//! engine.select(&device, Box::new(sink))?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod convert;
pub mod engine;
pub mod errors;
pub mod params;

// Re-export commonly used types
pub use backends::{BackendKind, BackendRegistry, CaptureBackend, DeviceDescriptor, Frame, PixelLayout};
pub use config::ParameterStore;
pub use engine::{AcquisitionEngine, ChannelSink, EngineConfig, EngineState, FrameSink, SinkEvent};
pub use errors::{CaptureError, CaptureResult, ParameterError, PullError};
pub use params::{ParamDescriptor, ParamKind, ParamValue, ParameterRegistry};
