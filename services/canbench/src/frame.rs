//! CAN / CAN FD frames
//!
//! Frames are validated on construction: identifiers fit 29 bits, classic
//! payloads are at most 8 bytes, FD payloads are padded with zeros up to the
//! next length a DLC can express.

use std::fmt;

use common::hex;
use errors::{CanError, Result};
use serde::{Deserialize, Serialize};
use signal_db::{Message, CANFD_MAX_DLEN, CAN_MAX_DLEN, MAX_EXTENDED_ID, MAX_STANDARD_ID};

/// Payload lengths a CAN FD DLC can express, indexed by DLC
pub const FD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Smallest legal FD payload length holding `len` bytes
pub fn fd_padded_len(len: usize) -> Option<usize> {
    FD_LENGTHS.iter().copied().find(|&l| l >= len)
}

/// DLC code for a legal payload length
pub fn len_to_dlc(len: usize) -> Option<u8> {
    FD_LENGTHS.iter().position(|&l| l == len).map(|i| i as u8)
}

/// Payload length for a DLC code (values past 15 saturate to 64)
pub fn dlc_to_len(dlc: u8) -> usize {
    FD_LENGTHS[usize::from(dlc.min(15))]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Identifier without flag bits
    pub id: u32,
    pub data: Vec<u8>,
    pub is_fd: bool,
    /// FD only: data phase at the higher bit rate
    pub bit_rate_switch: bool,
    pub direction: Direction,
    /// Driver timestamp in microseconds (0 for frames built locally)
    pub timestamp_us: u64,
}

impl CanFrame {
    /// Classic CAN frame (up to 8 bytes)
    pub fn new_classic(id: u32, data: Vec<u8>) -> Result<Self> {
        validate_id(id)?;
        if data.len() > CAN_MAX_DLEN {
            return Err(CanError::invalid_frame(format!(
                "classic frame payload is {} bytes (max {})",
                data.len(),
                CAN_MAX_DLEN
            )));
        }

        Ok(Self {
            id,
            data,
            is_fd: false,
            bit_rate_switch: false,
            direction: Direction::Tx,
            timestamp_us: 0,
        })
    }

    /// CAN FD frame; the payload is zero padded to a legal DLC length
    pub fn new_fd(id: u32, mut data: Vec<u8>, bit_rate_switch: bool) -> Result<Self> {
        validate_id(id)?;
        let padded = fd_padded_len(data.len()).ok_or_else(|| {
            CanError::invalid_frame(format!(
                "FD frame payload is {} bytes (max {})",
                data.len(),
                CANFD_MAX_DLEN
            ))
        })?;
        data.resize(padded, 0);

        Ok(Self {
            id,
            data,
            is_fd: true,
            bit_rate_switch,
            direction: Direction::Tx,
            timestamp_us: 0,
        })
    }

    /// Frame carrying an encoded message payload
    ///
    /// Payloads longer than 8 bytes, or `fd` requested, produce an FD frame.
    pub fn for_message(message: &Message, data: Vec<u8>, fd: bool, brs: bool) -> Result<Self> {
        if fd || data.len() > CAN_MAX_DLEN {
            Self::new_fd(message.frame_id, data, brs)
        } else {
            Self::new_classic(message.frame_id, data)
        }
    }

    /// Re-check a frame that may not have come from a constructor
    pub fn validate(&self) -> Result<()> {
        validate_id(self.id)?;
        if self.is_fd {
            if len_to_dlc(self.data.len()).is_none() {
                return Err(CanError::invalid_frame(format!(
                    "FD frame payload of {} bytes has no DLC",
                    self.data.len()
                )));
            }
        } else {
            if self.data.len() > CAN_MAX_DLEN {
                return Err(CanError::invalid_frame(format!(
                    "classic frame payload is {} bytes (max {})",
                    self.data.len(),
                    CAN_MAX_DLEN
                )));
            }
            if self.bit_rate_switch {
                return Err(CanError::invalid_frame("bit rate switch set on a classic frame"));
            }
        }
        Ok(())
    }

    /// A received frame
    pub fn received(mut self, timestamp_us: u64) -> Self {
        self.direction = Direction::Rx;
        self.timestamp_us = timestamp_us;
        self
    }

    /// Extended (29-bit) iff the id does not fit 11 bits
    pub fn is_extended(&self) -> bool {
        self.id > MAX_STANDARD_ID
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dlc(&self) -> u8 {
        len_to_dlc(self.data.len()).unwrap_or(15)
    }

    pub fn id_hex(&self) -> String {
        hex::format_id(self.id, self.is_extended())
    }

    pub fn data_hex(&self) -> String {
        hex::encode_spaced(&self.data)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{} [{}] {}",
            self.direction,
            self.id_hex(),
            if self.is_fd { " FD" } else { "" },
            self.len(),
            self.data_hex()
        )
    }
}

fn validate_id(id: u32) -> Result<()> {
    if id > MAX_EXTENDED_ID {
        return Err(CanError::invalid_frame(format!(
            "identifier 0x{:X} exceeds 29 bits",
            id
        )));
    }
    Ok(())
}
