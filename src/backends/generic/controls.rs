// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 control access for the generic backend
//!
//! Raw ioctl access to the control interface (query/get/set/menu), plus a
//! [`ParameterRegistry`] that maps the store's parameter keys onto V4L2
//! control IDs.
//!
//! Inspired by [cameractrls](https://github.com/soyersoyer/cameractrls).

use std::fs::File;
use std::os::unix::io::AsRawFd;

use tracing::{debug, warn};

use crate::constants::{defaults, keys};
use crate::errors::{ParameterError, ParameterResult};
use crate::params::{ParamDescriptor, ParamKind, ParamValue, ParameterRegistry, validate_write};

// ===== V4L2 Control Class Bases =====
const V4L2_CTRL_CLASS_USER: u32 = 0x00980000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== V4L2 Control IDs =====

pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE + 0;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
pub const V4L2_CID_GAMMA: u32 = V4L2_CID_BASE + 16;
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
pub const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;

/// Exposure mode: Auto, Manual, Shutter Priority, Aperture Priority
pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
/// Absolute exposure time in 100µs units
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;

// ===== V4L2 Exposure Auto Menu Values =====

pub const V4L2_EXPOSURE_MANUAL: i32 = 1;
/// UVC cameras expose their "auto" mode as aperture priority
pub const V4L2_EXPOSURE_APERTURE_PRIORITY: i32 = 3;

// ===== V4L2 Control Types =====
const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
const V4L2_CTRL_TYPE_BOOLEAN: u32 = 2;
const V4L2_CTRL_TYPE_MENU: u32 = 3;

// ===== V4L2 Control Flags =====
const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;
const V4L2_CTRL_FLAG_INACTIVE: u32 = 0x0010;

// ===== V4L2 ioctl Numbers =====
// Calculated as: (dir << 30) | (size << 16) | ('V' << 8) | nr

/// Get control value (v4l2_control: 8 bytes)
const VIDIOC_G_CTRL: libc::c_ulong = 0xC008561B;
/// Set control value (v4l2_control: 8 bytes)
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008561C;
/// Query control info (v4l2_queryctrl: 68 bytes)
const VIDIOC_QUERYCTRL: libc::c_ulong = 0xC0445624;

// ===== V4L2 ioctl Structures =====

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
struct V4l2Queryctrl {
    id: u32,
    ctrl_type: u32,
    name: [u8; 32],
    minimum: i32,
    maximum: i32,
    step: i32,
    default_value: i32,
    flags: u32,
    reserved: [u32; 2],
}

/// Information about a V4L2 control
#[derive(Debug, Clone)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub ctrl_type: ControlType,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Integer,
    Boolean,
    Menu,
    Unknown(u32),
}

impl From<u32> for ControlType {
    fn from(value: u32) -> Self {
        match value {
            V4L2_CTRL_TYPE_INTEGER => ControlType::Integer,
            V4L2_CTRL_TYPE_BOOLEAN => ControlType::Boolean,
            V4L2_CTRL_TYPE_MENU => ControlType::Menu,
            other => ControlType::Unknown(other),
        }
    }
}

impl ControlInfo {
    pub fn is_disabled(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_DISABLED != 0
    }

    /// Inactive controls exist but cannot currently be changed (e.g.
    /// exposure time while auto-exposure is on)
    pub fn is_inactive(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_INACTIVE != 0
    }
}

fn extract_name(bytes: &[u8; 32]) -> String {
    let name_len = bytes.iter().position(|&c| c == 0).unwrap_or(32);
    String::from_utf8_lossy(&bytes[..name_len]).to_string()
}

/// Query if a control exists and get its information
pub fn query_control(device_path: &str, control_id: u32) -> Option<ControlInfo> {
    let file = File::open(device_path).ok()?;
    let fd = file.as_raw_fd();

    let mut qctrl = V4l2Queryctrl {
        id: control_id,
        ctrl_type: 0,
        name: [0; 32],
        minimum: 0,
        maximum: 0,
        step: 0,
        default_value: 0,
        flags: 0,
        reserved: [0; 2],
    };

    let result = unsafe { libc::ioctl(fd, VIDIOC_QUERYCTRL, &mut qctrl as *mut V4l2Queryctrl) };

    if result < 0 {
        return None;
    }

    Some(ControlInfo {
        id: qctrl.id,
        name: extract_name(&qctrl.name),
        ctrl_type: qctrl.ctrl_type.into(),
        minimum: qctrl.minimum,
        maximum: qctrl.maximum,
        step: qctrl.step,
        default_value: qctrl.default_value,
        flags: qctrl.flags,
    })
}

/// Get current value of a control
pub fn get_control(device_path: &str, control_id: u32) -> Option<i32> {
    let file = File::open(device_path).ok()?;
    let fd = file.as_raw_fd();

    let mut ctrl = V4l2Control {
        id: control_id,
        value: 0,
    };

    let result = unsafe { libc::ioctl(fd, VIDIOC_G_CTRL, &mut ctrl as *mut V4l2Control) };

    if result < 0 {
        debug!(device_path, control_id, "Failed to get V4L2 control");
        return None;
    }

    Some(ctrl.value)
}

/// Set value of a control. Returns the value the driver actually applied.
pub fn set_control(device_path: &str, control_id: u32, value: i32) -> Result<i32, String> {
    let file = File::open(device_path).map_err(|e| format!("Failed to open device: {}", e))?;
    let fd = file.as_raw_fd();

    let mut ctrl = V4l2Control {
        id: control_id,
        value,
    };

    let result = unsafe { libc::ioctl(fd, VIDIOC_S_CTRL, &mut ctrl as *mut V4l2Control) };

    if result < 0 {
        let errno = std::io::Error::last_os_error();
        warn!(
            device_path,
            control_id,
            value,
            ?errno,
            "Failed to set V4L2 control"
        );
        return Err(format!("Failed to set control: {}", errno));
    }

    if ctrl.value != value {
        debug!(
            device_path,
            control_id,
            requested = value,
            actual = ctrl.value,
            "V4L2 control value was clamped by the driver"
        );
    }

    Ok(ctrl.value)
}

/// Check if a control is available on the device
pub fn has_control(device_path: &str, control_id: u32) -> bool {
    query_control(device_path, control_id)
        .map(|info| !info.is_disabled())
        .unwrap_or(false)
}

/// One mapped parameter: store key, control ID, and the unit conversion
/// between store values and driver values
#[derive(Debug, Clone, Copy)]
struct ControlMapping {
    key: &'static str,
    cid: u32,
    /// store value = driver value * factor
    factor: f64,
    default: f64,
}

/// Store keys the generic backend can map onto V4L2 controls, in the order
/// they are applied during configure. The exposure-auto gate comes first:
/// its value decides whether the exposure-time write below can land.
const CONTROL_TABLE: &[ControlMapping] = &[
    ControlMapping {
        key: keys::EXPOSURE_TIME,
        cid: V4L2_CID_EXPOSURE_ABSOLUTE,
        // V4L2 exposure is in 100µs units, the store carries µs
        factor: 100.0,
        default: defaults::EXPOSURE_TIME,
    },
    ControlMapping {
        key: keys::GAIN,
        cid: V4L2_CID_GAIN,
        factor: 1.0,
        default: defaults::GAIN,
    },
    ControlMapping {
        key: keys::BRIGHTNESS,
        cid: V4L2_CID_BRIGHTNESS,
        factor: 1.0,
        default: defaults::BRIGHTNESS,
    },
    ControlMapping {
        key: keys::WB_TEMPERATURE,
        cid: V4L2_CID_WHITE_BALANCE_TEMPERATURE,
        factor: 1.0,
        default: defaults::WB_TEMPERATURE,
    },
    ControlMapping {
        key: keys::GAMMA,
        cid: V4L2_CID_GAMMA,
        factor: 1.0,
        default: defaults::GAMMA,
    },
    ControlMapping {
        key: keys::SATURATION,
        cid: V4L2_CID_SATURATION,
        factor: 1.0,
        default: defaults::SATURATION,
    },
    ControlMapping {
        key: keys::SHARPENING,
        cid: V4L2_CID_SHARPNESS,
        factor: 1.0,
        default: defaults::SHARPENING,
    },
];

fn mapping_for(name: &str) -> Option<&'static ControlMapping> {
    CONTROL_TABLE.iter().find(|m| m.key == name)
}

/// [`ParameterRegistry`] over a device's V4L2 controls
///
/// Descriptors are queried live on every call so the INACTIVE flag tracks
/// gate state (manual exposure time goes writable only once auto-exposure
/// is off).
pub struct ControlRegistry {
    device_path: String,
}

impl ControlRegistry {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
        }
    }

    /// Ordered list of mapped parameters, gate first
    pub fn configure_order() -> impl Iterator<Item = (&'static str, ParamValue)> {
        std::iter::once((
            keys::EXPOSURE_AUTO,
            ParamValue::Boolean(defaults::EXPOSURE_AUTO),
        ))
        .chain(
            CONTROL_TABLE
                .iter()
                .map(|m| (m.key, ParamValue::Float(m.default))),
        )
    }

    fn info(&self, cid: u32, name: &str) -> ParameterResult<ControlInfo> {
        let info = query_control(&self.device_path, cid)
            .ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        if info.is_disabled() {
            return Err(ParameterError::NotFound(name.to_string()));
        }
        Ok(info)
    }
}

impl ParameterRegistry for ControlRegistry {
    fn descriptor(&self, name: &str) -> ParameterResult<ParamDescriptor> {
        if name == keys::EXPOSURE_AUTO {
            let info = self.info(V4L2_CID_EXPOSURE_AUTO, name)?;
            return Ok(ParamDescriptor {
                name: name.to_string(),
                kind: ParamKind::Boolean,
                readable: true,
                writable: !info.is_inactive(),
                min: 0.0,
                max: 1.0,
                step: 1.0,
                entries: Vec::new(),
                default: ParamValue::Boolean(defaults::EXPOSURE_AUTO),
            });
        }

        let mapping = mapping_for(name).ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        let info = self.info(mapping.cid, name)?;
        Ok(ParamDescriptor {
            name: name.to_string(),
            kind: ParamKind::Float,
            readable: true,
            writable: !info.is_inactive(),
            min: info.minimum as f64 * mapping.factor,
            max: info.maximum as f64 * mapping.factor,
            step: info.step as f64 * mapping.factor,
            entries: Vec::new(),
            default: ParamValue::Float(mapping.default),
        })
    }

    fn read(&mut self, name: &str) -> ParameterResult<ParamValue> {
        if name == keys::EXPOSURE_AUTO {
            let value = get_control(&self.device_path, V4L2_CID_EXPOSURE_AUTO)
                .ok_or_else(|| ParameterError::NotReadable(name.to_string()))?;
            return Ok(ParamValue::Boolean(value != V4L2_EXPOSURE_MANUAL));
        }

        let mapping = mapping_for(name).ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        let value = get_control(&self.device_path, mapping.cid)
            .ok_or_else(|| ParameterError::NotReadable(name.to_string()))?;
        Ok(ParamValue::Float(value as f64 * mapping.factor))
    }

    fn write(&mut self, name: &str, value: ParamValue) -> ParameterResult<()> {
        if name == keys::EXPOSURE_AUTO {
            let auto = value
                .as_bool()
                .ok_or(ParameterError::Type {
                    name: name.to_string(),
                    expected: "boolean",
                })?;
            let mode = if auto {
                V4L2_EXPOSURE_APERTURE_PRIORITY
            } else {
                V4L2_EXPOSURE_MANUAL
            };
            set_control(&self.device_path, V4L2_CID_EXPOSURE_AUTO, mode)
                .map_err(|_| ParameterError::NotWritable(name.to_string()))?;
            return Ok(());
        }

        let mapping = mapping_for(name).ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        let desc = self.descriptor(name)?;
        let validated = validate_write(&desc, value)?;
        let driver_value = (validated
            .as_f64()
            .ok_or(ParameterError::Type {
                name: name.to_string(),
                expected: "number",
            })?
            / mapping.factor)
            .round() as i32;

        set_control(&self.device_path, mapping.cid, driver_value)
            .map_err(|_| ParameterError::NotWritable(name.to_string()))?;
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if has_control(&self.device_path, V4L2_CID_EXPOSURE_AUTO) {
            names.push(keys::EXPOSURE_AUTO.to_string());
        }
        for mapping in CONTROL_TABLE {
            if has_control(&self.device_path, mapping.cid) {
                names.push(mapping.key.to_string());
            }
        }
        names
    }
}
