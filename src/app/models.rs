use serde::{Deserialize, Serialize};

/// An online device as handed to us by the inventory listener. Only the serial matters here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub serial: String,
}

impl DeviceHandle {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayBounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Turn auto-rotate off.
    Lock,
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryMode {
    Unplug,
    Reset,
}

/// Messages delivered to a remote viewer, discriminated by `msg` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum ViewerMessage {
    #[serde(rename = "size")]
    Size { width: u32, height: u32 },
    #[serde(rename = "support")]
    Support { text: String },
    #[serde(rename = "perfDetail")]
    PerfDetail { detail: serde_json::Value },
    #[serde(rename = "sas")]
    Sas {
        #[serde(rename = "isEnable")]
        is_enable: bool,
        port: u16,
    },
}
