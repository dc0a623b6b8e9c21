//! OCPP-J message model.
//!
//! - `frame`: Call / CallResult / CallError codec
//! - `action`: action names
//!
//! [`Direction`] and [`Side`] live here too since every layer above the codec
//! talks about which way a frame travels.

pub mod action;
pub mod frame;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use action::Action;
pub use frame::{Call, CallError, CallErrorCode, CallResult, CorrelationId, DecodeError, Frame, MessageType};

/// One end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Device,
    Backend,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Backend => "backend",
        }
    }
}

/// The way a frame travels through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    DeviceToBackend,
    BackendToDevice,
}

impl Direction {
    /// Side the frame was read from.
    pub fn source(self) -> Side {
        match self {
            Self::DeviceToBackend => Side::Device,
            Self::BackendToDevice => Side::Backend,
        }
    }

    /// Side the frame is forwarded to.
    pub fn destination(self) -> Side {
        match self {
            Self::DeviceToBackend => Side::Backend,
            Self::BackendToDevice => Side::Device,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Self::DeviceToBackend => Self::BackendToDevice,
            Self::BackendToDevice => Self::DeviceToBackend,
        }
    }

    /// Direction of frames sent *to* `side`.
    pub fn towards(side: Side) -> Self {
        match side {
            Side::Backend => Self::DeviceToBackend,
            Side::Device => Self::BackendToDevice,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceToBackend => "device->backend",
            Self::BackendToDevice => "backend->device",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
