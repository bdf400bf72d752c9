// SPDX-License-Identifier: GPL-3.0-only

//! Structured-light depth sensor backend
//!
//! These sensors run in software-trigger mode: every pull issues an
//! explicit trigger and then waits for the resulting frame, so the pattern
//! projector and the capture stay in lockstep. The vendor service sits
//! behind the [`DepthRuntime`] / [`DepthSensor`] seams.
//!
//! The delivered image is the sensor's single-channel intensity map,
//! normalized with a fixed range (see `constants::DEPTH_INTENSITY_MAX`).
//! Adaptive per-frame scaling is deliberately not implemented: pattern
//! decoding compares brightness across frames.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ParameterStore;
use crate::constants::{DEPTH_INTENSITY_MAX, DEPTH_INTENSITY_MIN};
use crate::convert::intensity_to_gray8;
use crate::errors::{CaptureError, CaptureResult, ParameterError, PullError};
use crate::params::{ParamValue, ParameterRegistry};

use super::types::{BackendKind, DeviceDescriptor, Frame, PixelLayout};
use super::{BackendProvider, CaptureBackend};

/// An enumerated depth sensor
#[derive(Debug, Clone)]
pub struct DepthDeviceInfo {
    pub id: String,
    pub name: String,
}

/// Vendor service entry point
pub trait DepthRuntime: Send + Sync {
    /// Whether the vendor control service is reachable at all
    fn is_service_running(&self) -> bool;

    fn devices(&self) -> Vec<DepthDeviceInfo>;

    fn connect(&self, id: &str) -> CaptureResult<Box<dyn DepthSensor>>;
}

/// One connected depth sensor
pub trait DepthSensor: Send {
    fn set_software_trigger(&mut self) -> CaptureResult<()>;
    fn clear_buffer(&mut self) -> CaptureResult<()>;
    fn start_acquisition(&mut self) -> CaptureResult<()>;
    fn stop_acquisition(&mut self);
    fn is_acquiring(&self) -> bool;
    /// Issue a software trigger; the returned frame id is negative when the
    /// sensor rejected the trigger
    fn trigger_frame(&mut self) -> CaptureResult<i64>;
    fn wait_frame(&mut self, timeout: Duration) -> Result<IntensityFrame, PullError>;
    fn disconnect(&mut self);
}

/// Raw single-channel intensity map from the sensor
#[derive(Debug, Clone)]
pub struct IntensityFrame {
    pub width: u32,
    pub height: u32,
    pub intensity: Vec<f32>,
}

/// Provider wrapping a depth runtime
pub struct DepthProvider {
    runtime: Arc<dyn DepthRuntime>,
}

impl DepthProvider {
    pub fn new(runtime: Arc<dyn DepthRuntime>) -> Self {
        Self { runtime }
    }
}

impl BackendProvider for DepthProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Depth
    }

    fn discover(&self) -> Vec<DeviceDescriptor> {
        if !self.runtime.is_service_running() {
            return Vec::new();
        }
        self.runtime
            .devices()
            .into_iter()
            .map(|dev| DeviceDescriptor {
                kind: BackendKind::Depth,
                id: dev.id,
                label: dev.name,
            })
            .collect()
    }

    fn open(&self, _descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>> {
        Ok(Box::new(DepthBackend::new(self.runtime.clone())))
    }
}

pub struct DepthBackend {
    runtime: Arc<dyn DepthRuntime>,
    sensor: Option<Box<dyn DepthSensor>>,
    id: Option<String>,
    sequence: u64,
}

impl DepthBackend {
    pub fn new(runtime: Arc<dyn DepthRuntime>) -> Self {
        Self {
            runtime,
            sensor: None,
            id: None,
            sequence: 0,
        }
    }
}

impl CaptureBackend for DepthBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Depth
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> CaptureResult<()> {
        if !self.runtime.is_service_running() {
            return Err(CaptureError::Device(
                "depth sensor control service is not running".into(),
            ));
        }
        let sensor = self.runtime.connect(&descriptor.id)?;
        info!(sensor = %descriptor.id, label = %descriptor.label, "connected depth sensor");
        self.sensor = Some(sensor);
        self.id = Some(descriptor.id.clone());
        Ok(())
    }

    fn configure(&mut self, _store: &mut ParameterStore) -> CaptureResult<()> {
        let sensor = self
            .sensor
            .as_mut()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;

        // Trigger mode and a clean buffer are preconditions for streaming;
        // failures here are device-level and abort startup
        sensor.set_software_trigger()?;
        sensor.clear_buffer()?;
        Ok(())
    }

    fn start_streaming(&mut self) -> CaptureResult<()> {
        let sensor = self
            .sensor
            .as_mut()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;
        if sensor.is_acquiring() {
            return Ok(());
        }
        sensor.start_acquisition()
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError> {
        let Some(sensor) = self.sensor.as_mut() else {
            return Err(PullError::Device("backend not open".into()));
        };

        let frame_id = sensor
            .trigger_frame()
            .map_err(|e| PullError::Device(e.to_string()))?;
        if frame_id < 0 {
            // A rejected trigger means the sensor is unhealthy, not slow
            warn!(frame_id, "software trigger rejected by sensor");
            return Err(PullError::Device(format!(
                "software trigger rejected (id {})",
                frame_id
            )));
        }

        let raw = sensor.wait_frame(timeout)?;
        let gray = intensity_to_gray8(&raw.intensity, DEPTH_INTENSITY_MIN, DEPTH_INTENSITY_MAX);

        let mut frame = Frame::new(raw.width, raw.height, PixelLayout::Gray8, gray);
        frame.sequence = self.sequence;
        self.sequence += 1;
        Ok(frame)
    }

    fn stop_streaming(&mut self) {
        if let Some(sensor) = self.sensor.as_mut()
            && sensor.is_acquiring()
        {
            sensor.stop_acquisition();
        }
    }

    fn close(&mut self) {
        self.stop_streaming();
        if let Some(mut sensor) = self.sensor.take() {
            sensor.disconnect();
        }
        if let Some(id) = self.id.take() {
            info!(sensor = %id, "disconnected depth sensor");
        }
    }

    fn is_streaming(&self) -> bool {
        self.sensor
            .as_ref()
            .map(|s| s.is_acquiring())
            .unwrap_or(false)
    }

    fn registry(&mut self) -> Option<&mut dyn ParameterRegistry> {
        // Exposure and pattern settings live in the vendor's own tooling
        None
    }

    fn write_parameter(
        &mut self,
        name: &str,
        _value: ParamValue,
        _store: &mut ParameterStore,
    ) -> CaptureResult<()> {
        Err(ParameterError::NotFound(name.to_string()).into())
    }
}

impl Drop for DepthBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SimSensorState {
        triggers: u32,
        reject_trigger: bool,
        fail_trigger: bool,
        stops: u32,
    }

    struct SimSensor {
        acquiring: bool,
        state: Arc<Mutex<SimSensorState>>,
    }

    impl DepthSensor for SimSensor {
        fn set_software_trigger(&mut self) -> CaptureResult<()> {
            Ok(())
        }
        fn clear_buffer(&mut self) -> CaptureResult<()> {
            Ok(())
        }
        fn start_acquisition(&mut self) -> CaptureResult<()> {
            self.acquiring = true;
            Ok(())
        }
        fn stop_acquisition(&mut self) {
            self.state.lock().unwrap().stops += 1;
            self.acquiring = false;
        }
        fn is_acquiring(&self) -> bool {
            self.acquiring
        }
        fn trigger_frame(&mut self) -> CaptureResult<i64> {
            let mut state = self.state.lock().unwrap();
            state.triggers += 1;
            if state.fail_trigger {
                return Err(CaptureError::Device("trigger transport failed".into()));
            }
            if state.reject_trigger {
                return Ok(-1);
            }
            Ok(state.triggers as i64)
        }
        fn wait_frame(&mut self, _timeout: Duration) -> Result<IntensityFrame, PullError> {
            Ok(IntensityFrame {
                width: 2,
                height: 2,
                intensity: vec![0.0, 256.0, 512.0, 1024.0],
            })
        }
        fn disconnect(&mut self) {}
    }

    struct SimDepthRuntime {
        running: bool,
        state: Arc<Mutex<SimSensorState>>,
    }

    impl DepthRuntime for SimDepthRuntime {
        fn is_service_running(&self) -> bool {
            self.running
        }
        fn devices(&self) -> Vec<DepthDeviceInfo> {
            vec![DepthDeviceInfo {
                id: "depth-0".into(),
                name: "Sim Depth".into(),
            }]
        }
        fn connect(&self, _id: &str) -> CaptureResult<Box<dyn DepthSensor>> {
            Ok(Box::new(SimSensor {
                acquiring: false,
                state: self.state.clone(),
            }))
        }
    }

    fn open_backend(state: Arc<Mutex<SimSensorState>>) -> DepthBackend {
        let runtime = Arc::new(SimDepthRuntime {
            running: true,
            state,
        });
        let descriptor = DeviceDescriptor {
            kind: BackendKind::Depth,
            id: "depth-0".into(),
            label: "Sim Depth".into(),
        };
        let mut backend = DepthBackend::new(runtime);
        backend.open(&descriptor).unwrap();
        let mut store = ParameterStore::in_memory();
        backend.configure(&mut store).unwrap();
        backend.start_streaming().unwrap();
        backend
    }

    #[test]
    fn test_pull_normalizes_with_fixed_range() {
        let state = Arc::new(Mutex::new(SimSensorState::default()));
        let mut backend = open_backend(state);

        let frame = backend.pull_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(frame.layout, PixelLayout::Gray8);
        // 0, 256, 512, 1024 against the fixed 0..1024 range
        assert_eq!(frame.data, vec![0, 63, 127, 255]);
    }

    #[test]
    fn test_sequence_advances_per_pull() {
        let state = Arc::new(Mutex::new(SimSensorState::default()));
        let mut backend = open_backend(state.clone());

        let first = backend.pull_frame(Duration::from_millis(100)).unwrap();
        let second = backend.pull_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(state.lock().unwrap().triggers, 2, "one trigger per pull");
    }

    #[test]
    fn test_rejected_trigger_is_device_error_not_timeout() {
        let state = Arc::new(Mutex::new(SimSensorState {
            reject_trigger: true,
            ..Default::default()
        }));
        let mut backend = open_backend(state);

        match backend.pull_frame(Duration::from_millis(100)) {
            Err(PullError::Device(msg)) => assert!(msg.contains("trigger")),
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_and_close_idempotent() {
        let state = Arc::new(Mutex::new(SimSensorState::default()));
        let mut backend = open_backend(state.clone());

        backend.stop_streaming();
        backend.stop_streaming();
        backend.close();
        backend.close();

        assert_eq!(
            state.lock().unwrap().stops,
            1,
            "acquisition stops exactly once"
        );
        assert!(!backend.is_streaming());
    }

    #[test]
    fn test_discovery_empty_without_service() {
        let runtime = Arc::new(SimDepthRuntime {
            running: false,
            state: Arc::new(Mutex::new(SimSensorState::default())),
        });
        let provider = DepthProvider::new(runtime);
        assert!(provider.discover().is_empty());
    }
}
