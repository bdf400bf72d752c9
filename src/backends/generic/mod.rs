// SPDX-License-Identifier: GPL-3.0-only

//! Generic webcam backend (V4L2)
//!
//! Streams from OS-level video devices. A dedicated capture thread owns the
//! memory-mapped stream and pushes converted frames into a bounded channel;
//! `pull_frame` is a bounded receive on that channel. Native YUYV/UYVY is
//! converted to RGB, GREY passes through, MJPG is decoded.

pub mod controls;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use crate::config::ParameterStore;
use crate::constants::{CAPTURE_BUFFER_COUNT, MAX_GENERIC_DEVICES, defaults, keys};
use crate::convert::{uyvy_to_rgb, yuyv_to_rgb};
use crate::errors::{CaptureError, CaptureResult, ParameterError, PullError};
use crate::params::{ParamValue, ParameterRegistry};

use super::types::{BackendKind, DeviceDescriptor, Frame, PixelLayout};
use super::{BackendProvider, CaptureBackend};

use controls::ControlRegistry;

/// How long `start_streaming` waits for the capture thread to report that
/// the stream is up
const STREAM_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fourcc codes the conversion path understands, in preference order
const SUPPORTED_FOURCC: [&[u8; 4]; 4] = [b"YUYV", b"UYVY", b"GREY", b"MJPG"];

/// Provider for OS-level webcams
pub struct GenericProvider;

impl BackendProvider for GenericProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn discover(&self) -> Vec<DeviceDescriptor> {
        discover()
    }

    fn open(&self, _descriptor: &DeviceDescriptor) -> CaptureResult<Box<dyn CaptureBackend>> {
        Ok(Box::new(GenericBackend::new()))
    }
}

/// Scan /dev/video0..N for capture-capable devices
///
/// Metadata nodes (no capture formats) are skipped. Probe failures on one
/// node never abort the scan.
pub fn discover() -> Vec<DeviceDescriptor> {
    let mut devices = Vec::new();

    for index in 0..MAX_GENERIC_DEVICES {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        let has_capture_formats = dev.enum_formats().map(|f| !f.is_empty()).unwrap_or(false);
        if !has_capture_formats {
            debug!(path, "skipping device without capture formats");
            continue;
        }

        info!(path, card = %caps.card, "found generic capture device");
        devices.push(DeviceDescriptor {
            kind: BackendKind::Generic,
            id: path,
            label: caps.card,
        });
    }

    devices
}

/// Negotiated capture geometry for the stream thread
#[derive(Debug, Clone, Copy)]
struct StreamFormat {
    width: u32,
    height: u32,
    fourcc: FourCC,
}

pub struct GenericBackend {
    path: Option<String>,
    registry: Option<ControlRegistry>,
    format: Option<StreamFormat>,
    capture_thread: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    frame_rx: Option<Receiver<Result<Frame, PullError>>>,
}

impl GenericBackend {
    pub fn new() -> Self {
        Self {
            path: None,
            registry: None,
            format: None,
            capture_thread: None,
            stop_signal: Arc::new(AtomicBool::new(false)),
            frame_rx: None,
        }
    }

    /// Try the supported fourcc codes until the driver accepts one.
    /// The driver may answer with a nearby resolution; the achieved format
    /// is what we stream with.
    fn negotiate_format(dev: &Device, width: u32, height: u32) -> CaptureResult<StreamFormat> {
        for code in SUPPORTED_FOURCC {
            let requested = v4l::Format::new(width, height, FourCC::new(code));
            let Ok(actual) = dev.set_format(&requested) else {
                continue;
            };
            if SUPPORTED_FOURCC.iter().any(|c| actual.fourcc == FourCC::new(c)) {
                return Ok(StreamFormat {
                    width: actual.width,
                    height: actual.height,
                    fourcc: actual.fourcc,
                });
            }
        }
        Err(CaptureError::Unsupported(
            "no negotiable pixel format on device".into(),
        ))
    }

    /// Negotiate a capture format for the given geometry and make it the
    /// active stream format. The store is not touched; callers persist the
    /// achieved geometry themselves.
    fn negotiate_with(&mut self, want_width: u32, want_height: u32) -> CaptureResult<StreamFormat> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;

        let dev = Device::with_path(&path).map_err(map_open_error(&path))?;
        let achieved = Self::negotiate_format(&dev, want_width, want_height)?;

        if achieved.width != want_width || achieved.height != want_height {
            info!(
                requested_width = want_width,
                requested_height = want_height,
                width = achieved.width,
                height = achieved.height,
                "driver adjusted capture resolution"
            );
        }

        self.format = Some(achieved);
        Ok(achieved)
    }

    fn apply_format_from_store(&mut self, store: &mut ParameterStore) -> CaptureResult<()> {
        let want_width = store.get_i64(keys::WIDTH, defaults::WIDTH) as u32;
        let want_height = store.get_i64(keys::HEIGHT, defaults::HEIGHT) as u32;

        let achieved = self.negotiate_with(want_width, want_height)?;
        if achieved.width != want_width || achieved.height != want_height {
            store.set(keys::WIDTH, ParamValue::Integer(achieved.width as i64));
            store.set(keys::HEIGHT, ParamValue::Integer(achieved.height as i64));
        }
        Ok(())
    }

    fn restart_stream(&mut self) -> CaptureResult<()> {
        self.stop_stream_thread();
        self.start_streaming()
    }

    fn stop_stream_thread(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        self.stop_signal.store(false, Ordering::SeqCst);
        self.frame_rx = None;
    }
}

impl Default for GenericBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn map_open_error(path: &str) -> impl Fn(std::io::Error) -> CaptureError + '_ {
    move |err| {
        if err.raw_os_error() == Some(libc::EBUSY) {
            CaptureError::DeviceBusy(path.to_string())
        } else if err.kind() == std::io::ErrorKind::NotFound {
            CaptureError::DeviceNotFound(path.to_string())
        } else {
            CaptureError::Device(err.to_string())
        }
    }
}

impl CaptureBackend for GenericBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> CaptureResult<()> {
        if !Path::new(&descriptor.id).exists() {
            return Err(CaptureError::DeviceNotFound(descriptor.id.clone()));
        }
        // Probe the handle once so busy/permission failures surface here
        // instead of inside the capture thread
        Device::with_path(&descriptor.id).map_err(map_open_error(&descriptor.id))?;

        info!(device = %descriptor.id, label = %descriptor.label, "opened generic device");
        self.registry = Some(ControlRegistry::new(&descriptor.id));
        self.path = Some(descriptor.id.clone());
        Ok(())
    }

    fn configure(&mut self, store: &mut ParameterStore) -> CaptureResult<()> {
        self.apply_format_from_store(store)?;

        let Some(registry) = self.registry.as_mut() else {
            return Err(CaptureError::State("backend not open".into()));
        };

        // Gate first (exposure auto), then the value controls. A rejected
        // value falls back to its documented default in the store and
        // configuration continues.
        for (key, default) in ControlRegistry::configure_order() {
            let Some(stored) = store.get(key).cloned() else {
                continue;
            };
            if let Err(err) = registry.write(key, stored) {
                warn!(param = key, error = %err, "device rejected stored value, resetting default");
                store.reset(key, default);
            }
        }

        Ok(())
    }

    fn start_streaming(&mut self) -> CaptureResult<()> {
        if self.capture_thread.is_some() {
            return Ok(());
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| CaptureError::State("backend not open".into()))?;
        let format = self
            .format
            .ok_or_else(|| CaptureError::State("backend not configured".into()))?;

        let stop_signal = self.stop_signal.clone();
        let (frame_tx, frame_rx) = mpsc::sync_channel(CAPTURE_BUFFER_COUNT as usize);
        let (init_tx, init_rx) = mpsc::channel::<Result<(), String>>();

        let handle = thread::spawn(move || {
            capture_loop(&path, format, stop_signal, frame_tx, init_tx);
        });

        // Wait for the thread to report that the stream is up
        match init_rx.recv_timeout(STREAM_INIT_TIMEOUT) {
            Ok(Ok(())) => {
                self.capture_thread = Some(handle);
                self.frame_rx = Some(frame_rx);
                Ok(())
            }
            Ok(Err(msg)) => {
                let _ = handle.join();
                if msg.contains("busy") {
                    Err(CaptureError::DeviceBusy(msg))
                } else {
                    Err(CaptureError::Device(msg))
                }
            }
            Err(_) => {
                self.stop_signal.store(true, Ordering::SeqCst);
                let _ = handle.join();
                self.stop_signal.store(false, Ordering::SeqCst);
                Err(CaptureError::Device("capture thread did not start".into()))
            }
        }
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, PullError> {
        let Some(rx) = self.frame_rx.as_ref() else {
            return Err(PullError::Device("not streaming".into()));
        };
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PullError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PullError::Device("capture thread exited".into()))
            }
        }
    }

    fn stop_streaming(&mut self) {
        self.stop_stream_thread();
    }

    fn close(&mut self) {
        self.stop_stream_thread();
        self.registry = None;
        self.format = None;
        if let Some(path) = self.path.take() {
            info!(device = %path, "closed generic device");
        }
    }

    fn is_streaming(&self) -> bool {
        self.capture_thread.is_some()
    }

    fn registry(&mut self) -> Option<&mut dyn ParameterRegistry> {
        self.registry
            .as_mut()
            .map(|r| r as &mut dyn ParameterRegistry)
    }

    fn write_parameter(
        &mut self,
        name: &str,
        value: ParamValue,
        store: &mut ParameterStore,
    ) -> CaptureResult<()> {
        // Resolution changes need the stream torn down and rebuilt. The
        // store is updated only once negotiation succeeded; a failed
        // negotiation keeps the previous working geometry.
        if name == keys::WIDTH || name == keys::HEIGHT {
            let requested = value.as_i64().ok_or(CaptureError::Parameter(
                ParameterError::Type {
                    name: name.to_string(),
                    expected: "integer",
                },
            ))? as u32;
            let mut want_width = store.get_i64(keys::WIDTH, defaults::WIDTH) as u32;
            let mut want_height = store.get_i64(keys::HEIGHT, defaults::HEIGHT) as u32;
            if name == keys::WIDTH {
                want_width = requested;
            } else {
                want_height = requested;
            }

            let was_streaming = self.is_streaming();
            if was_streaming {
                self.stop_stream_thread();
            }
            let achieved = self.negotiate_with(want_width, want_height)?;
            store.set(keys::WIDTH, ParamValue::Integer(achieved.width as i64));
            store.set(keys::HEIGHT, ParamValue::Integer(achieved.height as i64));
            if was_streaming {
                self.start_streaming()?;
            }
            return Ok(());
        }

        let Some(registry) = self.registry.as_mut() else {
            return Err(CaptureError::State("backend not open".into()));
        };

        match registry.write(name, value) {
            Ok(()) => {
                // Store what the driver actually applied, not what was asked
                if let Ok(actual) = registry.read(name) {
                    store.set(name, actual);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(default) = default_for(name) {
                    store.reset(name, default);
                }
                Err(err.into())
            }
        }
    }
}

impl Drop for GenericBackend {
    fn drop(&mut self) {
        self.stop_stream_thread();
    }
}

/// Documented default for a mapped store key
fn default_for(name: &str) -> Option<ParamValue> {
    ControlRegistry::configure_order()
        .find(|(key, _)| *key == name)
        .map(|(_, default)| default)
}

/// Capture thread body: owns the device handle and the mmap stream for the
/// lifetime of the session
fn capture_loop(
    path: &str,
    format: StreamFormat,
    stop_signal: Arc<AtomicBool>,
    frame_tx: SyncSender<Result<Frame, PullError>>,
    init_tx: mpsc::Sender<Result<(), String>>,
) {
    let dev = match Device::with_path(path) {
        Ok(d) => d,
        Err(e) => {
            let _ = init_tx.send(Err(format!("failed to open device: {}", e)));
            return;
        }
    };

    let requested = v4l::Format::new(format.width, format.height, format.fourcc);
    if let Err(e) = dev.set_format(&requested) {
        let _ = init_tx.send(Err(format!("failed to set format: {}", e)));
        return;
    }

    let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, CAPTURE_BUFFER_COUNT) {
        Ok(s) => s,
        Err(e) => {
            let _ = init_tx.send(Err(format!("failed to create stream: {}", e)));
            return;
        }
    };

    let _ = init_tx.send(Ok(()));
    info!(
        path,
        width = format.width,
        height = format.height,
        fourcc = ?format.fourcc,
        "capture stream started"
    );

    let mut sequence: u64 = 0;

    while !stop_signal.load(Ordering::SeqCst) {
        let result = match stream.next() {
            Ok((buf, meta)) => {
                let used = meta.bytesused as usize;
                let data = if used > 0 && used <= buf.len() {
                    &buf[..used]
                } else {
                    buf
                };
                convert_frame(data, format).map(|mut frame| {
                    frame.sequence = sequence;
                    sequence += 1;
                    frame
                })
            }
            Err(e) => Err(PullError::Device(format!("dequeue failed: {}", e))),
        };

        // Bounded channel: when the consumer lags, drop the new frame
        // rather than block the driver queue
        match frame_tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("frame channel full, dropping frame"),
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    info!(path, "capture stream stopped");
}

/// Convert a raw capture buffer into a delivered frame
fn convert_frame(data: &[u8], format: StreamFormat) -> Result<Frame, PullError> {
    let width = format.width;
    let height = format.height;
    let pixels = width as usize * height as usize;

    if format.fourcc == FourCC::new(b"YUYV") {
        if data.len() < pixels * 2 {
            return Err(PullError::Incomplete(format!(
                "short YUYV buffer: {} of {} bytes",
                data.len(),
                pixels * 2
            )));
        }
        Ok(Frame::new(
            width,
            height,
            PixelLayout::Rgb8,
            yuyv_to_rgb(data, width, height),
        ))
    } else if format.fourcc == FourCC::new(b"UYVY") {
        if data.len() < pixels * 2 {
            return Err(PullError::Incomplete(format!(
                "short UYVY buffer: {} of {} bytes",
                data.len(),
                pixels * 2
            )));
        }
        Ok(Frame::new(
            width,
            height,
            PixelLayout::Rgb8,
            uyvy_to_rgb(data, width, height),
        ))
    } else if format.fourcc == FourCC::new(b"GREY") {
        if data.len() < pixels {
            return Err(PullError::Incomplete(format!(
                "short GREY buffer: {} of {} bytes",
                data.len(),
                pixels
            )));
        }
        Ok(Frame::new(
            width,
            height,
            PixelLayout::Gray8,
            data[..pixels].to_vec(),
        ))
    } else if format.fourcc == FourCC::new(b"MJPG") {
        let decoded = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
            .map_err(|e| PullError::Incomplete(format!("MJPG decode failed: {}", e)))?;
        let rgb = decoded.to_rgb8();
        Ok(Frame::new(
            rgb.width(),
            rgb.height(),
            PixelLayout::Rgb8,
            rgb.into_raw(),
        ))
    } else {
        Err(PullError::Device(format!(
            "unsupported pixel format {:?}",
            format.fourcc
        )))
    }
}
