// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for acquisition operations
//!
//! Provides command-line functionality for:
//! - Listing available capture devices
//! - Inspecting a device's parameter registry
//! - Streaming frames (optionally saving them as PNG)

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use tracing::warn;

use scancap::backends::{BackendRegistry, DeviceDescriptor, PixelLayout};
use scancap::config::ParameterStore;
use scancap::engine::{AcquisitionEngine, ChannelSink, EngineConfig, SinkEvent};

/// List all discoverable capture devices
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let registry = BackendRegistry::with_defaults();
    let devices = registry.list_devices();

    if devices.is_empty() {
        println!("No capture devices found.");
        return Ok(());
    }

    println!("Available devices:");
    println!();
    for (index, device) in devices.iter().enumerate() {
        println!("  [{}] {} ({}) - {}", index, device.id, device.kind, device.label);
    }

    Ok(())
}

/// Print the parameter registry of a device
pub fn show_params(device: &str) -> Result<(), Box<dyn std::error::Error>> {
    let registry = BackendRegistry::with_defaults();
    let descriptor = resolve_device(&registry, device)?;

    let mut backend = registry.open(&descriptor)?;
    backend.open(&descriptor)?;

    let Some(params) = backend.registry() else {
        println!("Device exposes no parameter registry.");
        return Ok(());
    };

    println!("Parameters of {}:", descriptor.id);
    println!();
    for name in params.names() {
        match params.descriptor(&name) {
            Ok(desc) => {
                let current = params
                    .read(&name)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "-".into());
                let access = match (desc.readable, desc.writable) {
                    (true, true) => "rw",
                    (true, false) => "r-",
                    (false, true) => "-w",
                    (false, false) => "--",
                };
                println!(
                    "  {:<28} {:?} [{}] range {}..{} current {}",
                    name, desc.kind, access, desc.min, desc.max, current
                );
            }
            Err(err) => println!("  {:<28} unavailable ({})", name, err),
        }
    }

    backend.close();
    Ok(())
}

/// Stream frames from a device until `count` frames arrived or Ctrl-C
pub fn stream(
    device: &str,
    count: u64,
    save_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = BackendRegistry::with_defaults();
    let descriptor = resolve_device(&registry, device)?;

    if let Some(dir) = &save_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut engine = AcquisitionEngine::new(registry, EngineConfig::default(), ParameterStore::load());
    let (sink, events) = ChannelSink::new();

    let stop_requested = Arc::new(AtomicBool::new(false));
    {
        let stop_requested = stop_requested.clone();
        ctrlc::set_handler(move || {
            stop_requested.store(true, Ordering::SeqCst);
        })?;
    }

    println!("Streaming from {} (Ctrl-C to stop)...", descriptor.id);
    engine.select(&descriptor, Box::new(sink))?;

    let session = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let mut delivered: u64 = 0;

    loop {
        if stop_requested.load(Ordering::SeqCst) {
            engine.stop();
            engine.wait_until_stopped();
            break;
        }

        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(SinkEvent::Frame(frame)) => {
                delivered += 1;
                println!(
                    "frame {:>6}  {}x{} {}  ({} bytes)",
                    frame.sequence,
                    frame.width,
                    frame.height,
                    frame.layout,
                    frame.data.len()
                );

                if let Some(dir) = &save_dir
                    && let Err(err) = save_frame(dir, &session, &frame)
                {
                    warn!(error = %err, "failed to save frame");
                }

                if count > 0 && delivered >= count {
                    engine.stop();
                    engine.wait_until_stopped();
                    break;
                }
            }
            Ok(SinkEvent::Terminated(reason)) => {
                engine.wait_until_stopped();
                return Err(format!("session ended: {}", reason).into());
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("Delivered {} frames.", delivered);
    Ok(())
}

fn save_frame(
    dir: &PathBuf,
    session: &str,
    frame: &scancap::backends::Frame,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = dir.join(format!("{}_{:06}.png", session, frame.sequence));
    match frame.layout {
        PixelLayout::Rgb8 => {
            let img = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or("frame buffer does not match geometry")?;
            img.save(&path)?;
        }
        PixelLayout::Gray8 => {
            let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or("frame buffer does not match geometry")?;
            img.save(&path)?;
        }
    }
    Ok(())
}

/// Resolve a device argument: a list index or a device id
fn resolve_device(
    registry: &BackendRegistry,
    device: &str,
) -> Result<DeviceDescriptor, Box<dyn std::error::Error>> {
    let devices = registry.list_devices();
    if devices.is_empty() {
        return Err("No capture devices found".into());
    }

    if let Ok(index) = device.parse::<usize>() {
        return devices
            .get(index)
            .cloned()
            .ok_or_else(|| format!("Device index {} out of range (0-{})", index, devices.len() - 1).into());
    }

    devices
        .iter()
        .find(|d| d.id == device)
        .cloned()
        .ok_or_else(|| format!("No device with id '{}'", device).into())
}
