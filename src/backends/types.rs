// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for capture backends

use std::fmt;
use std::time::Instant;

/// Pixel layout of a delivered frame
///
/// Backends normalize their native formats to one of these before delivery;
/// scan pattern decoding only ever sees these two layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 8-bit RGB, 3 bytes per pixel
    Rgb8,
    /// 8-bit grayscale, 1 byte per pixel
    Gray8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Rgb8 => 3,
            PixelLayout::Gray8 => 1,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Rgb8 => write!(f, "RGB8"),
            PixelLayout::Gray8 => write!(f, "GRAY8"),
        }
    }
}

/// One captured frame
///
/// The pixel buffer is owned; delivery to the frame sink moves the whole
/// frame, the engine never retains it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub data: Vec<u8>,
    /// Capture instant on the monotonic clock
    pub captured_at: Instant,
    /// Monotonic per-session frame counter
    pub sequence: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, layout: PixelLayout, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            layout,
            data,
            captured_at: Instant::now(),
            sequence: 0,
        }
    }

    /// Byte length a complete frame of this geometry must have
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }
}

/// Which backend class serves a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// OS-level webcam (V4L2)
    Generic,
    /// Machine-vision camera driven through a node map
    Vision,
    /// Software-triggered structured-light depth sensor
    Depth,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Generic => write!(f, "generic"),
            BackendKind::Vision => write!(f, "vision"),
            BackendKind::Depth => write!(f, "depth"),
        }
    }
}

/// A discoverable capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: BackendKind,
    /// OS path for generic devices, serial for vision/depth devices
    pub id: String,
    /// Human-readable name for listings
    pub label: String,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.kind, self.label)
    }
}
