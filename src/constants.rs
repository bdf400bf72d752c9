// SPDX-License-Identifier: GPL-3.0-only

//! Engine constants, well-known parameter keys, and documented defaults

use std::time::Duration;

/// Bounded wait for a single frame pull
pub const PULL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Consecutive failed pulls before the engine tears the session down
pub const FAILURE_CEILING: u32 = 10;

/// Settling window after streaming starts during which failed pulls are
/// logged but do not advance the failure counter (auto-exposure and driver
/// pipelines need a few seconds to stabilize)
pub const WARMUP_WINDOW: Duration = Duration::from_secs(10);

/// Highest /dev/videoN index probed during discovery
pub const MAX_GENERIC_DEVICES: usize = 8;

/// How long a caller waits for the streaming loop to acknowledge a
/// reconfigure command
pub const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of mmap buffers for the V4L2 capture stream
pub const CAPTURE_BUFFER_COUNT: u32 = 4;

/// Fixed intensity normalization range for depth sensors
///
/// The raw single-channel intensity map is mapped from this range to 0-255.
/// The range is fixed so projector brightness stays comparable across
/// frames; per-frame adaptive scaling would break pattern decoding.
pub const DEPTH_INTENSITY_MIN: f64 = 0.0;
pub const DEPTH_INTENSITY_MAX: f64 = 1024.0;

/// Store keys for acquisition parameters
pub mod keys {
    pub const EXPOSURE_AUTO: &str = "camera/exposure_auto";
    pub const EXPOSURE_TIME: &str = "camera/exposure_time";
    pub const GAIN: &str = "camera/gain";
    pub const BLACK_LEVEL: &str = "camera/black_level";
    pub const BALANCE_RED: &str = "camera/balance_red";
    pub const BALANCE_BLUE: &str = "camera/balance_blue";
    pub const WIDTH: &str = "camera/width";
    pub const HEIGHT: &str = "camera/height";
    pub const OFFSET_X: &str = "camera/offset_x";
    pub const OFFSET_Y: &str = "camera/offset_y";
    pub const FRAME_RATE: &str = "camera/frame_rate";
    pub const GAMMA: &str = "camera/gamma";
    pub const SATURATION: &str = "camera/saturation";
    pub const SHARPENING: &str = "camera/sharpening";
    pub const BRIGHTNESS: &str = "camera/brightness";
    pub const WB_TEMPERATURE: &str = "camera/wb_temperature";
}

/// Documented defaults written back by the store-reset fallback when a
/// device rejects a stored value
pub mod defaults {
    pub const EXPOSURE_AUTO: bool = false;
    /// Microseconds, one 60 Hz projector period
    pub const EXPOSURE_TIME: f64 = 16_666.0;
    /// dB
    pub const GAIN: f64 = 0.0;
    pub const BLACK_LEVEL: f64 = 0.0;
    pub const BALANCE_RED: f64 = 1.4;
    pub const BALANCE_BLUE: f64 = 1.9;
    pub const WIDTH: i64 = 1920;
    pub const HEIGHT: i64 = 1080;
    pub const OFFSET_X: i64 = 0;
    pub const OFFSET_Y: i64 = 0;
    pub const FRAME_RATE: f64 = 30.0;
    pub const GAMMA: f64 = 1.0;
    pub const SATURATION: f64 = 100.0;
    pub const SHARPENING: f64 = 2.0;
    pub const BRIGHTNESS: f64 = 128.0;
    /// Kelvin
    pub const WB_TEMPERATURE: f64 = 4600.0;
}
