// SPDX-License-Identifier: GPL-3.0-only

//! Parameter model shared by all capture backends
//!
//! Every backend exposes its tunable state through [`ParameterRegistry`]:
//! V4L2 controls for webcams, the GenICam node map for machine-vision
//! cameras. Descriptors reflect the *current* device state — gate
//! parameters (e.g. auto-exposure) flip the writability of the parameters
//! they control, so callers must re-check `writable` after toggling a gate.

use serde::{Deserialize, Serialize};

use crate::errors::{ParameterError, ParameterResult};

/// A typed parameter value
///
/// Enum entries travel as `Text` carrying the symbolic entry name.
/// Untagged serde representation keeps the store file plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(v) => Some(*v),
            ParamValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Boolean(v) => write!(f, "{}", v),
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// What kind of node a parameter is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Integer,
    Float,
    Boolean,
    /// Symbolic entry set; writes carry the entry name as `Text`
    Enum,
    /// Side-effect node, triggered via [`ParameterRegistry::execute`]
    Command,
}

/// Description of one parameter as the device reports it right now
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub readable: bool,
    pub writable: bool,
    /// Range bounds, meaningful for `Integer`/`Float`
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Valid entries, meaningful for `Enum`
    pub entries: Vec<String>,
    pub default: ParamValue,
}

impl ParamDescriptor {
    /// Convenience constructor for a writable numeric parameter
    pub fn numeric(name: &str, kind: ParamKind, min: f64, max: f64, default: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            kind,
            readable: true,
            writable: true,
            min,
            max,
            step: 0.0,
            entries: Vec::new(),
            default,
        }
    }
}

/// Uniform access to a device's tunable parameters
pub trait ParameterRegistry: Send {
    /// Current descriptor for `name`, or `NotFound`
    fn descriptor(&self, name: &str) -> ParameterResult<ParamDescriptor>;

    fn read(&mut self, name: &str) -> ParameterResult<ParamValue>;

    /// Write `value`, applying the shared validation rules (numeric clamp,
    /// enum reject). Implementations route through [`validate_write`].
    fn write(&mut self, name: &str, value: ParamValue) -> ParameterResult<()>;

    /// Trigger a command node
    fn execute(&mut self, name: &str) -> ParameterResult<()> {
        Err(ParameterError::NotFound(name.to_string()))
    }

    /// Names of all parameters the device currently exposes
    fn names(&self) -> Vec<String>;
}

/// Validate a write against a descriptor and return the value that should
/// actually reach the device.
///
/// Numeric writes are clamped into `[min, max]` — the clamped value is what
/// gets written, and callers that persist parameters must store the clamped
/// value, not the requested one. Enum writes with an unknown entry are
/// rejected outright; enum values are never coerced.
pub fn validate_write(desc: &ParamDescriptor, value: ParamValue) -> ParameterResult<ParamValue> {
    if !desc.writable {
        return Err(ParameterError::NotWritable(desc.name.clone()));
    }

    match desc.kind {
        ParamKind::Integer | ParamKind::Float => {
            let v = value.as_f64().ok_or(ParameterError::Type {
                name: desc.name.clone(),
                expected: "number",
            })?;
            let clamped = v.clamp(desc.min, desc.max);
            match desc.kind {
                ParamKind::Integer => Ok(ParamValue::Integer(clamped.round() as i64)),
                _ => Ok(ParamValue::Float(clamped)),
            }
        }
        ParamKind::Boolean => match value {
            ParamValue::Boolean(_) => Ok(value),
            _ => Err(ParameterError::Type {
                name: desc.name.clone(),
                expected: "boolean",
            }),
        },
        ParamKind::Enum => {
            let entry = value.as_text().ok_or(ParameterError::Type {
                name: desc.name.clone(),
                expected: "enum entry",
            })?;
            if desc.entries.iter().any(|e| e == entry) {
                Ok(value.clone())
            } else {
                Err(ParameterError::Rejected {
                    name: desc.name.clone(),
                    value: entry.to_string(),
                })
            }
        }
        ParamKind::Command => Err(ParameterError::NotWritable(desc.name.clone())),
    }
}
