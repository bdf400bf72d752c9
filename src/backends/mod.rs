// SPDX-License-Identifier: MPL-2.0

//! Capture backend abstraction layer
//!
//! Three classes of device sit behind one polymorphic interface:
//!
//! - [`generic`]: OS-level webcams via V4L2
//! - [`vision`]: machine-vision cameras driven through a node map
//! - [`depth`]: software-triggered structured-light depth sensors
//!
//! A [`CaptureBackend`] owns exactly one device for the lifetime of a
//! session; all of its methods are called from a single owner at a time
//! (the engine's caller thread during open, the streaming loop afterwards).

pub mod depth;
pub mod generic;
pub mod types;
pub mod vision;

use std::time::Duration;

use tracing::warn;

use crate::config::ParameterStore;
use crate::errors::{CaptureError, CaptureResult, PullError};
use crate::params::{ParamValue, ParameterRegistry};

pub use types::{BackendKind, DeviceDescriptor, Frame, PixelLayout};

/// One capture device behind a uniform lifecycle
///
/// Lifecycle: `open` → `configure` → `start_streaming` → `pull_frame`* →
/// `stop_streaming` → `close`. `stop_streaming` and `close` are idempotent
/// and safe in any order; `close` implies `stop_streaming`.
pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Acquire the device handle. A device held by another process returns
    /// `DeviceBusy`; an absent device returns `DeviceNotFound`.
    fn open(&mut self, descriptor: &DeviceDescriptor) -> CaptureResult<()>;

    /// Push stored parameters to the device.
    ///
    /// Parameter-level failures are recovered locally: the backend logs,
    /// resets the offending store key to its documented default, and keeps
    /// going. Only a device-level failure aborts startup.
    fn configure(&mut self, store: &mut ParameterStore) -> CaptureResult<()>;

    fn start_streaming(&mut self) -> CaptureResult<()>;

    /// Bounded wait for the next frame
    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError>;

    fn stop_streaming(&mut self);

    fn close(&mut self);

    fn is_streaming(&self) -> bool;

    /// The device's parameter registry, if one is available while open
    fn registry(&mut self) -> Option<&mut dyn ParameterRegistry>;

    /// Apply a single parameter while the device is live.
    ///
    /// Backends that cannot reconfigure mid-stream stop, apply, and resume
    /// internally. A parameter-level rejection resets the store key and
    /// returns `Err(Parameter)` with the device still streaming; a
    /// device-level failure leaves the device cleanly stopped and returns
    /// the error.
    fn write_parameter(
        &mut self,
        name: &str,
        value: ParamValue,
        store: &mut ParameterStore,
    ) -> CaptureResult<()>;
}

/// Discovery and construction for one backend class
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Enumerate devices this provider can open. Must not panic on a
    /// missing runtime; an unreachable transport yields an empty list.
    fn discover(&self) -> Vec<DeviceDescriptor>;

    fn open(&self, descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>>;
}

/// Ordered set of registered backend providers
pub struct BackendRegistry {
    providers: Vec<Box<dyn BackendProvider>>,
}

impl BackendRegistry {
    /// Registry with the always-available generic (V4L2) provider.
    /// Vision and depth providers are registered by the embedding
    /// application once their transport is wired up.
    pub fn with_defaults() -> Self {
        Self {
            providers: vec![Box::new(generic::GenericProvider)],
        }
    }

    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn register(&mut self, provider: Box<dyn BackendProvider>) {
        self.providers.push(provider);
    }

    /// All discoverable devices in provider order. A failing provider is
    /// skipped, never fatal to discovery.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices = Vec::new();
        for provider in &self.providers {
            devices.extend(provider.discover());
        }
        devices
    }

    /// Construct (but do not open) a backend for a descriptor
    pub fn open(&self, descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>> {
        for provider in &self.providers {
            if provider.kind() == descriptor.kind {
                return provider.open(descriptor);
            }
        }
        warn!(kind = %descriptor.kind, "no provider registered for backend kind");
        Err(CaptureError::Unsupported(format!(
            "no provider for backend kind '{}'",
            descriptor.kind
        )))
    }
}
