// SPDX-License-Identifier: GPL-3.0-only

//! Machine-vision camera backend
//!
//! Drives GenICam-style cameras through their node-map parameter registry.
//! The vendor SDK sits behind the [`VisionRuntime`] / [`VisionCamera`]
//! seams; everything above those seams — the gate-ordered configure
//! sequence, clamp write-back, the stop/apply/resume reconfigure dance —
//! lives here and is backend policy, not SDK glue.
//!
//! Configure order matters on these devices: auto-function gates must be
//! switched off before their manual values become writable, selector nodes
//! must be positioned before the selected value is written, and enable
//! gates must be raised before their dependent node accepts a value.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ParameterStore;
use crate::constants::{defaults, keys};
use crate::errors::{CaptureError, CaptureResult, ParameterResult, PullError};
use crate::params::{ParamValue, ParameterRegistry};

use super::types::{BackendKind, DeviceDescriptor, Frame, PixelLayout};
use super::{BackendProvider, CaptureBackend};

/// An enumerated vision camera
#[derive(Debug, Clone)]
pub struct VisionDeviceInfo {
    pub serial: String,
    pub model: String,
}

/// Vendor SDK entry point: enumeration and opening
pub trait VisionRuntime: Send + Sync {
    /// All reachable cameras; an unreachable transport yields an empty list
    fn devices(&self) -> Vec<VisionDeviceInfo>;

    fn open_by_serial(&self, serial: &str) -> CaptureResult<Box<dyn VisionCamera>>;
}

/// One opened vision camera
pub trait VisionCamera: Send {
    fn init(&mut self) -> CaptureResult<()>;
    fn deinit(&mut self);
    fn begin_acquisition(&mut self) -> CaptureResult<()>;
    fn end_acquisition(&mut self);
    fn is_acquiring(&self) -> bool;
    fn node_map(&mut self) -> &mut dyn ParameterRegistry;
    /// Bounded wait for the next image. A transport-flagged incomplete
    /// image surfaces as `PullError::Incomplete`.
    fn next_image(&mut self, timeout: Duration) -> Result<RawImage, PullError>;
}

/// Image as handed over by the transport, already in a deliverable layout
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub data: Vec<u8>,
}

/// Provider wrapping a vision runtime
pub struct VisionProvider {
    runtime: Arc<dyn VisionRuntime>,
}

impl VisionProvider {
    pub fn new(runtime: Arc<dyn VisionRuntime>) -> Self {
        Self { runtime }
    }
}

impl BackendProvider for VisionProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Vision
    }

    fn discover(&self) -> Vec<DeviceDescriptor> {
        self.runtime
            .devices()
            .into_iter()
            .map(|dev| DeviceDescriptor {
                kind: BackendKind::Vision,
                id: dev.serial,
                label: dev.model,
            })
            .collect()
    }

    fn open(&self, _descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>> {
        Ok(Box::new(VisionBackend::new(self.runtime.clone())))
    }
}

pub struct VisionBackend {
    runtime: Arc<dyn VisionRuntime>,
    camera: Option<Box<dyn VisionCamera>>,
    serial: Option<String>,
    sequence: u64,
}

impl VisionBackend {
    pub fn new(runtime: Arc<dyn VisionRuntime>) -> Self {
        Self {
            runtime,
            camera: None,
            serial: None,
            sequence: 0,
        }
    }
}

impl CaptureBackend for VisionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vision
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> CaptureResult<()> {
        let mut camera = self.runtime.open_by_serial(&descriptor.id)?;
        camera.init()?;
        info!(serial = %descriptor.id, label = %descriptor.label, "opened vision camera");
        self.camera = Some(camera);
        self.serial = Some(descriptor.id.clone());
        Ok(())
    }

    fn configure(&mut self, store: &mut ParameterStore) -> CaptureResult<()> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;
        apply_node_map(camera.node_map(), store);
        Ok(())
    }

    fn start_streaming(&mut self) -> CaptureResult<()> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;
        if camera.is_acquiring() {
            return Ok(());
        }
        camera.begin_acquisition()
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError> {
        let Some(camera) = self.camera.as_mut() else {
            return Err(PullError::Device("backend not open".into()));
        };
        let image = camera.next_image(timeout)?;
        let mut frame = Frame::new(image.width, image.height, image.layout, image.data);
        frame.sequence = self.sequence;
        self.sequence += 1;
        Ok(frame)
    }

    fn stop_streaming(&mut self) {
        if let Some(camera) = self.camera.as_mut()
            && camera.is_acquiring()
        {
            camera.end_acquisition();
        }
    }

    fn close(&mut self) {
        self.stop_streaming();
        if let Some(mut camera) = self.camera.take() {
            camera.deinit();
        }
        if let Some(serial) = self.serial.take() {
            info!(serial = %serial, "closed vision camera");
        }
    }

    fn is_streaming(&self) -> bool {
        self.camera
            .as_ref()
            .map(|c| c.is_acquiring())
            .unwrap_or(false)
    }

    fn registry(&mut self) -> Option<&mut dyn ParameterRegistry> {
        self.camera.as_mut().map(|c| c.node_map())
    }

    fn write_parameter(
        &mut self,
        name: &str,
        value: ParamValue,
        store: &mut ParameterStore,
    ) -> CaptureResult<()> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;

        // Node writes are rejected mid-acquisition; stop, apply, resume
        let was_acquiring = camera.is_acquiring();
        if was_acquiring {
            camera.end_acquisition();
        }

        let write_result = apply_single(camera.node_map(), store, name, value);

        if was_acquiring {
            // A failed restart must leave the device cleanly stopped, so
            // the restart error takes precedence over a parameter error
            camera.begin_acquisition()?;
        }

        write_result.map_err(CaptureError::from)
    }
}

impl Drop for VisionBackend {
    fn drop(&mut self) {
        self.close();
    }
}

// ===== Node map application =====

/// Mapped value nodes: store key, node name, auto-function or enable gate
/// that must be positioned before the write, and the documented default.
struct NodeMapping {
    key: &'static str,
    node: &'static str,
    /// `(gate node, entry)` written immediately before the value
    gate: Option<(&'static str, ParamValue)>,
    default: ParamValue,
}

fn node_table() -> Vec<NodeMapping> {
    vec![
        NodeMapping {
            key: keys::HEIGHT,
            node: "Height",
            gate: None,
            default: ParamValue::Integer(defaults::HEIGHT),
        },
        NodeMapping {
            key: keys::WIDTH,
            node: "Width",
            gate: None,
            default: ParamValue::Integer(defaults::WIDTH),
        },
        NodeMapping {
            key: keys::OFFSET_X,
            node: "OffsetX",
            gate: None,
            default: ParamValue::Integer(defaults::OFFSET_X),
        },
        NodeMapping {
            key: keys::OFFSET_Y,
            node: "OffsetY",
            gate: None,
            default: ParamValue::Integer(defaults::OFFSET_Y),
        },
        NodeMapping {
            key: keys::GAIN,
            node: "Gain",
            gate: None,
            default: ParamValue::Float(defaults::GAIN),
        },
        NodeMapping {
            key: keys::BLACK_LEVEL,
            node: "BlackLevel",
            gate: None,
            default: ParamValue::Float(defaults::BLACK_LEVEL),
        },
        NodeMapping {
            key: keys::FRAME_RATE,
            node: "AcquisitionFrameRate",
            gate: Some(("AcquisitionFrameRateEnable", ParamValue::Boolean(true))),
            default: ParamValue::Float(defaults::FRAME_RATE),
        },
        NodeMapping {
            key: keys::GAMMA,
            node: "Gamma",
            gate: Some(("GammaEnable", ParamValue::Boolean(true))),
            default: ParamValue::Float(defaults::GAMMA),
        },
        NodeMapping {
            key: keys::SATURATION,
            node: "Saturation",
            gate: Some(("SaturationEnable", ParamValue::Boolean(true))),
            default: ParamValue::Float(defaults::SATURATION),
        },
        NodeMapping {
            key: keys::SHARPENING,
            node: "Sharpening",
            gate: Some(("SharpeningEnable", ParamValue::Boolean(true))),
            default: ParamValue::Float(defaults::SHARPENING),
        },
    ]
}

/// Push every stored parameter onto the node map in gate order.
///
/// Any gate or value failure is logged, the corresponding store key is
/// reset to its documented default, and application continues with the
/// next step. Startup never aborts on a parameter failure.
pub fn apply_node_map(registry: &mut dyn ParameterRegistry, store: &mut ParameterStore) {
    // Auto-function gates first: their state decides which manual nodes
    // are writable at all
    if let Err(err) = registry.write("ExposureAuto", ParamValue::Text("Off".into())) {
        warn!(error = %err, "could not disable auto exposure, resetting exposure default");
        store.reset(keys::EXPOSURE_TIME, ParamValue::Float(defaults::EXPOSURE_TIME));
    }
    if let Err(err) = registry.write("GainAuto", ParamValue::Text("Off".into())) {
        warn!(error = %err, "could not disable auto gain, resetting gain default");
        store.reset(keys::GAIN, ParamValue::Float(defaults::GAIN));
    }
    let balance_manual = match registry.write("BalanceWhiteAuto", ParamValue::Text("Off".into())) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "could not disable auto white balance, resetting balance defaults");
            store.reset(keys::BALANCE_RED, ParamValue::Float(defaults::BALANCE_RED));
            store.reset(keys::BALANCE_BLUE, ParamValue::Float(defaults::BALANCE_BLUE));
            false
        }
    };
    if let Err(err) = registry.write("AcquisitionMode", ParamValue::Text("Continuous".into())) {
        warn!(error = %err, "could not set continuous acquisition mode");
    }

    // White balance ratios go through the selector node
    if balance_manual {
        apply_balance_ratio(registry, store, "Red", keys::BALANCE_RED, defaults::BALANCE_RED);
        apply_balance_ratio(registry, store, "Blue", keys::BALANCE_BLUE, defaults::BALANCE_BLUE);
    }

    // Geometry and analog chain; enable-gated nodes come after exposure
    for mapping in node_table() {
        if mapping.gate.is_some() {
            continue;
        }
        apply_value(registry, store, &mapping);
    }

    apply_exposure_time(registry, store);

    for mapping in node_table() {
        if mapping.gate.is_some() {
            apply_value(registry, store, &mapping);
        }
    }
}

fn apply_balance_ratio(
    registry: &mut dyn ParameterRegistry,
    store: &mut ParameterStore,
    channel: &str,
    key: &str,
    default: f64,
) {
    let value = store.get_f64(key, default);
    let result = registry
        .write("BalanceRatioSelector", ParamValue::Text(channel.into()))
        .and_then(|_| registry.write("BalanceRatio", ParamValue::Float(value)));
    if let Err(err) = result {
        warn!(channel, error = %err, "balance ratio write failed, resetting default");
        store.reset(key, ParamValue::Float(default));
    }
}

fn apply_value(
    registry: &mut dyn ParameterRegistry,
    store: &mut ParameterStore,
    mapping: &NodeMapping,
) {
    let stored = store.get_or(mapping.key, mapping.default.clone());

    if let Some((gate_node, gate_value)) = &mapping.gate
        && let Err(err) = registry.write(gate_node, gate_value.clone())
    {
        warn!(node = gate_node, error = %err, "gate write failed, resetting dependent default");
        store.reset(mapping.key, mapping.default.clone());
        return;
    }

    if let Err(err) = registry.write(mapping.node, stored) {
        warn!(node = mapping.node, error = %err, "node write failed, resetting default");
        store.reset(mapping.key, mapping.default.clone());
    }
}

/// Exposure time carries an extra rule: the stored value is clamped to the
/// node's current limits and the clamped value is persisted, so the store
/// converges on what the device actually runs with.
fn apply_exposure_time(registry: &mut dyn ParameterRegistry, store: &mut ParameterStore) {
    let stored = store.get_f64(keys::EXPOSURE_TIME, defaults::EXPOSURE_TIME);

    let result = registry.descriptor("ExposureTime").and_then(|desc| {
        let clamped = stored.clamp(desc.min, desc.max);
        registry
            .write("ExposureTime", ParamValue::Float(clamped))
            .map(|_| clamped)
    });

    match result {
        Ok(clamped) => {
            if (clamped - stored).abs() > f64::EPSILON {
                info!(
                    requested = stored,
                    applied = clamped,
                    "exposure time clamped to device limits"
                );
            }
            store.set(keys::EXPOSURE_TIME, ParamValue::Float(clamped));
        }
        Err(err) => {
            warn!(error = %err, "exposure time write failed, resetting default");
            store.reset(keys::EXPOSURE_TIME, ParamValue::Float(defaults::EXPOSURE_TIME));
        }
    }
}

/// Live write of one parameter via its node mapping
fn apply_single(
    registry: &mut dyn ParameterRegistry,
    store: &mut ParameterStore,
    name: &str,
    value: ParamValue,
) -> ParameterResult<()> {
    if name == keys::EXPOSURE_TIME {
        let requested = value.as_f64().ok_or(crate::errors::ParameterError::Type {
            name: name.to_string(),
            expected: "number",
        })?;
        let desc = registry.descriptor("ExposureTime")?;
        let clamped = requested.clamp(desc.min, desc.max);
        registry.write("ExposureTime", ParamValue::Float(clamped))?;
        store.set(keys::EXPOSURE_TIME, ParamValue::Float(clamped));
        return Ok(());
    }

    if name == keys::BALANCE_RED || name == keys::BALANCE_BLUE {
        let channel = if name == keys::BALANCE_RED { "Red" } else { "Blue" };
        let result = registry
            .write("BalanceRatioSelector", ParamValue::Text(channel.into()))
            .and_then(|_| registry.write("BalanceRatio", value.clone()));
        return match result {
            Ok(()) => {
                store.set(name, value);
                Ok(())
            }
            Err(err) => {
                let default = if name == keys::BALANCE_RED {
                    defaults::BALANCE_RED
                } else {
                    defaults::BALANCE_BLUE
                };
                store.reset(name, ParamValue::Float(default));
                Err(err)
            }
        };
    }

    let table = node_table();
    let Some(mapping) = table.iter().find(|m| m.key == name) else {
        return Err(crate::errors::ParameterError::NotFound(name.to_string()));
    };

    if let Some((gate_node, gate_value)) = &mapping.gate {
        registry.write(gate_node, gate_value.clone())?;
    }

    match registry.write(mapping.node, value.clone()) {
        Ok(()) => {
            store.set(name, value);
            Ok(())
        }
        Err(err) => {
            store.reset(name, mapping.default.clone());
            Err(err)
        }
    }
}
