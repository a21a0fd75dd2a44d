//! Signal database model
//!
//! Messages and signals are created once when a database is loaded and are
//! read-only afterwards. A [`Database`] owns its messages and keeps name and
//! frame-id indexes over them.

use std::collections::{BTreeMap, HashMap};

use errors::{CanError, Result};
use serde::Serialize;
use tracing::debug;

use crate::bits::{self, Saturation, SignalLayout};

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest extended (29-bit) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit
pub const CAN_MAX_DLEN: usize = 8;
/// CAN FD payload limit
pub const CANFD_MAX_DLEN: usize = 64;

/// Bit numbering of a signal within the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel: start bit is the LSB, bits grow toward higher addresses
    LittleEndian,
    /// Motorola: start bit is the MSB, counting down then into the next byte
    BigEndian,
}

/// How the raw bits of a signal are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Unsigned,
    Signed,
    /// IEEE-754 single (32 bits) or double (64 bits)
    Float,
}

/// Multiplexing role of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplex {
    /// Ordinary signal
    Plain,
    /// The multiplexer switch itself
    Multiplexor,
    /// Present only when the switch equals the value
    Multiplexed(u64),
}

/// One named bit field within a message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub name: String,
    pub start_bit: u16,
    pub bit_length: u8,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    pub scale: f64,
    pub offset: f64,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    /// Physical default used when no value is supplied
    pub initial: Option<f64>,
    pub unit: String,
    /// Raw integer -> label
    pub enumeration: BTreeMap<i64, String>,
    pub comment: Option<String>,
    pub receivers: Vec<String>,
    pub multiplex: Multiplex,
}

impl Signal {
    /// A plain little-endian unsigned signal with identity scaling
    pub fn new(name: impl Into<String>, start_bit: u16, bit_length: u8) -> Self {
        Self {
            name: name.into(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            scale: 1.0,
            offset: 0.0,
            minimum: None,
            maximum: None,
            initial: None,
            unit: String::new(),
            enumeration: BTreeMap::new(),
            comment: None,
            receivers: Vec::new(),
            multiplex: Multiplex::Plain,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    pub fn with_initial(mut self, initial: f64) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_label(mut self, raw: i64, label: impl Into<String>) -> Self {
        self.enumeration.insert(raw, label.into());
        self
    }

    /// Byte spans the signal occupies
    pub fn layout(&self) -> SignalLayout {
        SignalLayout::new(self.start_bit, self.bit_length, self.byte_order)
    }

    pub fn is_float(&self) -> bool {
        self.value_type == ValueType::Float
    }

    /// Value used by `encode` when the caller supplies none:
    /// initial, then minimum, then zero
    pub fn default_value(&self) -> f64 {
        self.initial.or(self.minimum).unwrap_or(0.0)
    }

    /// Label for a raw integer, if the signal has one
    pub fn label(&self, raw: i64) -> Option<&str> {
        self.enumeration.get(&raw).map(String::as_str)
    }

    /// Raw integer for a label (exact match)
    pub fn raw_for_label(&self, label: &str) -> Option<i64> {
        self.enumeration
            .iter()
            .find(|(_, l)| l.as_str() == label)
            .map(|(raw, _)| *raw)
    }

    /// Render a raw integer for display: its label, or the number itself
    pub fn display_raw(&self, raw: i64) -> String {
        self.label(raw)
            .map(str::to_string)
            .unwrap_or_else(|| raw.to_string())
    }

    /// Physical value -> raw bit pattern
    pub fn encode_raw(&self, physical: f64, saturation: Saturation) -> Result<u64> {
        bits::encode_raw(physical, self, saturation)
    }

    /// Raw bit pattern -> physical value
    pub fn decode_raw(&self, raw: u64) -> f64 {
        bits::decode_raw(raw, self)
    }

    /// Physical range a UI control should offer
    pub fn physical_bounds(&self) -> (f64, f64) {
        bits::physical_bounds(self)
    }

    /// Smallest physical increment
    pub fn step(&self) -> f64 {
        bits::step(self)
    }
}

/// One decoded signal with display metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSignal {
    pub name: String,
    pub value: f64,
    /// Raw integer (sign extended); float signals carry their truncated value
    pub raw: i64,
    pub unit: String,
    pub label: Option<String>,
}

impl std::fmt::Display for DecodedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} = {} ({})", self.name, label, self.raw),
            None if self.unit.is_empty() => write!(f, "{} = {}", self.name, self.value),
            None => write!(f, "{} = {} {}", self.name, self.value, self.unit),
        }
    }
}

/// A CAN frame template
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub name: String,
    /// Identifier without any extended flag bit
    pub frame_id: u32,
    pub byte_length: usize,
    pub signals: Vec<Signal>,
    pub comment: Option<String>,
    pub sender: Option<String>,
    /// Cycle time in milliseconds, from the `GenMsgCycleTime` attribute
    pub cycle_time: Option<u32>,
}

impl Message {
    pub fn new(name: impl Into<String>, frame_id: u32, byte_length: usize) -> Self {
        Self {
            name: name.into(),
            frame_id,
            byte_length,
            signals: Vec::new(),
            comment: None,
            sender: None,
            cycle_time: None,
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }

    /// Extended (29-bit) iff the identifier does not fit 11 bits
    pub fn is_extended(&self) -> bool {
        self.frame_id > MAX_STANDARD_ID
    }

    /// Payload only fits a CAN FD frame
    pub fn is_fd(&self) -> bool {
        self.byte_length > CAN_MAX_DLEN
    }

    pub fn signal(&self, name: &str) -> Result<&Signal> {
        self.signals
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CanError::not_found(format!("signal '{}' in {}", name, self.name)))
    }

    /// Every signal at its default value
    pub fn default_values(&self) -> HashMap<String, f64> {
        self.signals
            .iter()
            .map(|s| (s.name.clone(), s.default_value()))
            .collect()
    }

    /// Encode physical values into a payload of `byte_length` bytes
    ///
    /// Signals missing from `values` take their default value. Names that
    /// match no signal are ignored.
    pub fn encode(&self, values: &HashMap<String, f64>) -> Result<Vec<u8>> {
        self.encode_with(values, Saturation::Error)
    }

    /// Encode, clamping out-of-range values when `saturation` asks for it
    pub fn encode_with(
        &self,
        values: &HashMap<String, f64>,
        saturation: Saturation,
    ) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.byte_length];

        for signal in &self.signals {
            let physical = values
                .get(&signal.name)
                .copied()
                .unwrap_or_else(|| signal.default_value());

            let raw = signal
                .encode_raw(physical, saturation)
                .map_err(|e| CanError::encode(&signal.name, reason(&e)))?;
            bits::pack(raw, signal, &mut buffer)
                .map_err(|e| CanError::encode(&signal.name, reason(&e)))?;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            for name in values.keys() {
                if !self.signals.iter().any(|s| &s.name == name) {
                    debug!("Ignoring value for unknown signal {}.{}", self.name, name);
                }
            }
        }

        Ok(buffer)
    }

    /// Decode every signal from `data`
    ///
    /// Fails only when `data` is shorter than `byte_length`; longer buffers
    /// (padded FD frames) are accepted.
    pub fn decode(&self, data: &[u8]) -> Result<HashMap<String, f64>> {
        self.check_length(data)?;
        let mut values = HashMap::with_capacity(self.signals.len());
        for signal in &self.signals {
            let raw = bits::unpack(data, signal)?;
            values.insert(signal.name.clone(), signal.decode_raw(raw));
        }
        Ok(values)
    }

    /// Decode in signal order, attaching units and enumeration labels
    pub fn decode_labeled(&self, data: &[u8]) -> Result<Vec<DecodedSignal>> {
        self.check_length(data)?;
        self.signals
            .iter()
            .map(|signal| {
                let bits_value = bits::unpack(data, signal)?;
                let value = signal.decode_raw(bits_value);
                let raw = if signal.is_float() {
                    value as i64
                } else {
                    bits::raw_integer(bits_value, signal)
                };
                Ok(DecodedSignal {
                    name: signal.name.clone(),
                    value,
                    raw,
                    unit: signal.unit.clone(),
                    label: signal.label(raw).map(str::to_string),
                })
            })
            .collect()
    }

    fn check_length(&self, data: &[u8]) -> Result<()> {
        if data.len() < self.byte_length {
            return Err(CanError::TruncatedFrame {
                expected: self.byte_length,
                actual: data.len(),
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.byte_length > CANFD_MAX_DLEN {
            return Err(CanError::parse(format!(
                "message {} declares {} bytes (max {})",
                self.name, self.byte_length, CANFD_MAX_DLEN
            )));
        }
        if self.frame_id > MAX_EXTENDED_ID {
            return Err(CanError::parse(format!(
                "message {} has identifier 0x{:X} beyond 29 bits",
                self.name, self.frame_id
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for signal in &self.signals {
            if !seen.insert(signal.name.as_str()) {
                return Err(CanError::parse(format!(
                    "duplicate signal {} in message {}",
                    signal.name, self.name
                )));
            }
            self.validate_signal(signal)?;
        }
        Ok(())
    }

    fn validate_signal(&self, signal: &Signal) -> Result<()> {
        let fail = |what: String| {
            Err(CanError::parse(format!(
                "signal {}.{}: {}",
                self.name, signal.name, what
            )))
        };

        if signal.bit_length == 0 || signal.bit_length > 64 {
            return fail(format!("bit length {} outside 1..64", signal.bit_length));
        }
        if signal.is_float() && signal.bit_length != 32 && signal.bit_length != 64 {
            return fail(format!(
                "float signal must be 32 or 64 bits, got {}",
                signal.bit_length
            ));
        }
        if signal.scale == 0.0 || !signal.scale.is_finite() {
            return fail(format!("invalid scale {}", signal.scale));
        }
        if !signal.offset.is_finite() {
            return fail(format!("invalid offset {}", signal.offset));
        }
        if !signal.layout().fits(self.byte_length) {
            return fail(format!(
                "bits {}+{} do not fit {} bytes",
                signal.start_bit, signal.bit_length, self.byte_length
            ));
        }
        Ok(())
    }
}

fn reason(err: &CanError) -> String {
    match err {
        CanError::OutOfRange(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// A loaded signal database
///
/// Built in one piece and never mutated; reloading produces a new value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Database {
    pub version: String,
    pub nodes: Vec<String>,
    messages: Vec<Message>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    #[serde(skip)]
    by_id: HashMap<u32, usize>,
}

impl Database {
    /// Validate and index a set of messages
    pub fn new(version: String, nodes: Vec<String>, messages: Vec<Message>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(messages.len());
        let mut by_id = HashMap::with_capacity(messages.len());

        for (index, message) in messages.iter().enumerate() {
            message.validate()?;
            if by_name.insert(message.name.clone(), index).is_some() {
                return Err(CanError::parse(format!(
                    "duplicate message name {}",
                    message.name
                )));
            }
            if let Some(previous) = by_id.insert(message.frame_id, index) {
                return Err(CanError::parse(format!(
                    "duplicate frame id 0x{:X} ({} and {})",
                    message.frame_id, messages[previous].name, message.name
                )));
            }
        }

        Ok(Self {
            version,
            nodes,
            messages,
            by_name,
            by_id,
        })
    }

    /// Messages in source order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get_message_by_name(&self, name: &str) -> Result<&Message> {
        self.by_name
            .get(name)
            .map(|&i| &self.messages[i])
            .ok_or_else(|| CanError::not_found(format!("message '{}'", name)))
    }

    pub fn get_message_by_id(&self, frame_id: u32) -> Result<&Message> {
        self.by_id
            .get(&frame_id)
            .map(|&i| &self.messages[i])
            .ok_or_else(|| CanError::not_found(format!("message with id 0x{:X}", frame_id)))
    }

    /// Encode a message looked up by name
    pub fn encode_message(&self, name: &str, values: &HashMap<String, f64>) -> Result<Vec<u8>> {
        self.get_message_by_name(name)?.encode(values)
    }

    /// Decode a payload looked up by frame id
    pub fn decode_message(&self, frame_id: u32, data: &[u8]) -> Result<HashMap<String, f64>> {
        self.get_message_by_id(frame_id)?.decode(data)
    }

    /// Decode with labels, for display
    pub fn decode_message_labeled(&self, frame_id: u32, data: &[u8]) -> Result<Vec<DecodedSignal>> {
        self.get_message_by_id(frame_id)?.decode_labeled(data)
    }
}
