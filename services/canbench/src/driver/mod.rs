//! Adapter driver boundary
//!
//! The [`AdapterDriver`] trait mirrors the vendor C API closely: calls return
//! raw status words and handles, and interpretation of those values belongs
//! to the session. Two backends exist:
//!
//! - [`zlg::ZlgDriver`]: the ZLG `zlgcan` shared library, bound at runtime
//! - [`loopback::LoopbackDriver`]: in-process echo adapter for tests and dry runs

pub mod loopback;
pub mod zlg;

use std::fmt;
use std::str::FromStr;

use errors::{CanError, Result};
use serde::{Deserialize, Serialize};

use crate::frame::CanFrame;

pub use loopback::LoopbackDriver;
pub use zlg::ZlgDriver;

/// Status word the driver returns on success
pub const STATUS_OK: u32 = 1;

/// Largest batch drained by one receive call
pub const MAX_RECEIVE_BATCH: u32 = 100;

// ============================================================================
// Handles
// ============================================================================

/// Opaque device handle (0 is invalid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceHandle(pub usize);

impl DeviceHandle {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Opaque channel handle (0 is invalid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelHandle(pub usize);

impl ChannelHandle {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

// ============================================================================
// Device and channel parameters
// ============================================================================

/// Supported adapter models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceModel {
    #[serde(rename = "usbcanfd-200u", alias = "USBCANFD_200U")]
    UsbCanFd200U,
    #[serde(rename = "usbcanfd-100u", alias = "USBCANFD_100U")]
    UsbCanFd100U,
    #[serde(rename = "usbcanfd-mini", alias = "USBCANFD_MINI")]
    UsbCanFdMini,
}

impl DeviceModel {
    /// Device type code passed to `OpenDevice`
    pub fn type_code(self) -> u32 {
        match self {
            DeviceModel::UsbCanFd200U => 41,
            DeviceModel::UsbCanFd100U => 42,
            DeviceModel::UsbCanFdMini => 43,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceModel::UsbCanFd200U => "usbcanfd-200u",
            DeviceModel::UsbCanFd100U => "usbcanfd-100u",
            DeviceModel::UsbCanFdMini => "usbcanfd-mini",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceModel {
    type Err = CanError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "usbcanfd-200u" | "200u" | "41" => Ok(DeviceModel::UsbCanFd200U),
            "usbcanfd-100u" | "100u" | "42" => Ok(DeviceModel::UsbCanFd100U),
            "usbcanfd-mini" | "mini" | "43" => Ok(DeviceModel::UsbCanFdMini),
            _ => Err(CanError::config(format!("unknown device model '{}'", s))),
        }
    }
}

/// Channel protocol mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Classic,
    #[default]
    Fd,
}

impl ChannelMode {
    /// `can_type` field of the channel init block
    pub fn can_type(self) -> u32 {
        match self {
            ChannelMode::Classic => 0,
            ChannelMode::Fd => 1,
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Classic => write!(f, "CAN"),
            ChannelMode::Fd => write!(f, "CAN FD"),
        }
    }
}

/// SJA1000 bus timing registers for a classic bit rate
pub fn sja1000_timing(bitrate: u32) -> Option<(u8, u8)> {
    match bitrate {
        1_000_000 => Some((0x00, 0x14)),
        800_000 => Some((0x00, 0x16)),
        500_000 => Some((0x00, 0x1C)),
        250_000 => Some((0x01, 0x1C)),
        125_000 => Some((0x03, 0x1C)),
        100_000 => Some((0x04, 0x1C)),
        50_000 => Some((0x09, 0x1C)),
        20_000 => Some((0x18, 0x1C)),
        10_000 => Some((0x31, 0x1C)),
        _ => None,
    }
}

/// Data phase bit rates the FD adapters accept
pub const FD_DATA_BITRATES: [u32; 5] = [1_000_000, 2_000_000, 4_000_000, 5_000_000, 8_000_000];

/// Channel initialisation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel index on the device
    pub index: u32,
    pub mode: ChannelMode,
    /// Nominal (arbitration phase) bit rate in bit/s
    pub arbitration_bitrate: u32,
    /// FD data phase bit rate in bit/s
    pub data_bitrate: u32,
    /// Acceptance filter code
    pub acc_code: u32,
    /// Acceptance filter mask (all ones accepts everything)
    pub acc_mask: u32,
    pub listen_only: bool,
    /// Built-in 120 ohm terminal resistor
    pub terminal_resistor: bool,
    /// Send FD frames with bit rate switching
    pub bit_rate_switch: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            index: 0,
            mode: ChannelMode::Fd,
            arbitration_bitrate: 500_000,
            data_bitrate: 2_000_000,
            acc_code: 0,
            acc_mask: 0xFFFF_FFFF,
            listen_only: false,
            terminal_resistor: true,
            bit_rate_switch: false,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if sja1000_timing(self.arbitration_bitrate).is_none() {
            return Err(CanError::config(format!(
                "unsupported arbitration bit rate {}",
                self.arbitration_bitrate
            )));
        }
        if self.mode == ChannelMode::Fd && !FD_DATA_BITRATES.contains(&self.data_bitrate) {
            return Err(CanError::config(format!(
                "unsupported FD data bit rate {}",
                self.data_bitrate
            )));
        }
        if self.mode == ChannelMode::Classic && self.bit_rate_switch {
            return Err(CanError::config(
                "bit rate switching requires FD mode".to_string(),
            ));
        }
        Ok(())
    }

    /// `mode` field of the channel init block
    pub fn work_mode(&self) -> u8 {
        u8::from(self.listen_only)
    }
}

/// Versions and identity reported by the adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hardware_version: String,
    pub firmware_version: String,
    pub driver_version: String,
    pub interface_version: String,
    pub channel_count: u8,
    pub serial_number: String,
    pub hardware_type: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (SN {}) HW {} FW {} DRV {} API {} channels {}",
            self.hardware_type,
            self.serial_number,
            self.hardware_version,
            self.firmware_version,
            self.driver_version,
            self.interface_version,
            self.channel_count
        )
    }
}

/// Render a BCD-ish version word (0x0102 -> "V1.02")
pub fn format_version(raw: u16) -> String {
    format!("V{:x}.{:02x}", raw >> 8, raw & 0xFF)
}

// ============================================================================
// Driver trait
// ============================================================================

/// Raw adapter operations
///
/// Implementations are called with the session lock held and never from two
/// threads at once.
pub trait AdapterDriver: Send {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    fn open_device(&mut self, model: DeviceModel, index: u32) -> DeviceHandle;

    fn close_device(&mut self, device: DeviceHandle) -> u32;

    fn device_info(&mut self, device: DeviceHandle) -> Option<DeviceInfo>;

    /// Write a `"<channel>/<key>"` device property
    fn set_value(&mut self, device: DeviceHandle, path: &str, value: &str) -> u32;

    fn init_channel(&mut self, device: DeviceHandle, config: &ChannelConfig) -> ChannelHandle;

    fn start_channel(&mut self, channel: ChannelHandle) -> u32;

    fn reset_channel(&mut self, channel: ChannelHandle) -> u32;

    /// Queue one frame; returns the number of frames accepted
    fn transmit(&mut self, channel: ChannelHandle, frame: &CanFrame) -> u32;

    /// Frames waiting in the classic (`fd == false`) or FD receive queue
    fn receive_count(&mut self, channel: ChannelHandle, fd: bool) -> u32;

    /// Drain up to `max` frames from one receive queue
    fn receive(&mut self, channel: ChannelHandle, fd: bool, max: u32, wait_ms: i32)
        -> Vec<CanFrame>;
}
