//! Bit-field codec
//!
//! Converts between physical values and the raw bit patterns stored in a
//! payload. Integer packing works on `u64` with mask and shift only; the
//! affine transform (`physical = raw * scale + offset`) is the only place
//! floating point is involved, and IEEE-float signals skip it entirely.
//!
//! Bit numbering follows DBC conventions:
//! - little endian (Intel): `start_bit` is the LSB, bits continue upward and
//!   into the next byte at bit 0
//! - big endian (Motorola): `start_bit` is the MSB, bits continue downward
//!   and into the next byte at bit 7

use errors::{CanError, Result};
use serde::{Deserialize, Serialize};

use crate::model::{ByteOrder, Signal, ValueType};

/// A 64-bit field touches at most nine bytes
const MAX_SPANS: usize = 9;

/// What `encode_raw` does with a value that does not fit the field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Saturation {
    /// Fail with `OutOfRange`
    #[default]
    Error,
    /// Clamp into the representable range
    Clamp,
}

/// One contiguous run of bits inside a single payload byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit position within the byte (0..=7)
    pub bit_offset: u8,
    /// Bits in this run (1..=8)
    pub num_bits: u8,
    /// Position of the run's lowest bit in the raw value
    pub value_shift: u8,
}

impl BitSpan {
    #[inline]
    fn mask(&self) -> u8 {
        ((1u16 << self.num_bits) - 1) as u8
    }
}

/// Byte spans covered by one signal
///
/// `pack` and `unpack` walk the same spans, so one is the inverse of the
/// other for every start bit, length and byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalLayout {
    spans: [BitSpan; MAX_SPANS],
    len: usize,
    bit_length: u8,
}

impl SignalLayout {
    pub fn new(start_bit: u16, bit_length: u8, byte_order: ByteOrder) -> Self {
        let mut spans = [BitSpan::default(); MAX_SPANS];
        let mut len = 0;
        let mut byte_index = usize::from(start_bit / 8);
        let mut bit_index = (start_bit % 8) as u8;
        let mut remaining = bit_length.min(64);

        match byte_order {
            ByteOrder::BigEndian => {
                // MSB first: the first run lands at the top of the raw value
                while remaining > 0 && len < MAX_SPANS {
                    let num_bits = (bit_index + 1).min(remaining);
                    remaining -= num_bits;
                    spans[len] = BitSpan {
                        byte_index,
                        bit_offset: bit_index + 1 - num_bits,
                        num_bits,
                        value_shift: remaining,
                    };
                    len += 1;
                    byte_index += 1;
                    bit_index = 7;
                }
            },
            ByteOrder::LittleEndian => {
                let mut value_shift = 0u8;
                while remaining > 0 && len < MAX_SPANS {
                    let num_bits = (8 - bit_index).min(remaining);
                    spans[len] = BitSpan {
                        byte_index,
                        bit_offset: bit_index,
                        num_bits,
                        value_shift,
                    };
                    len += 1;
                    value_shift += num_bits;
                    remaining -= num_bits;
                    byte_index += 1;
                    bit_index = 0;
                }
            },
        }

        Self {
            spans,
            len,
            bit_length,
        }
    }

    pub fn spans(&self) -> &[BitSpan] {
        &self.spans[..self.len]
    }

    /// Last payload byte the field touches
    pub fn last_byte(&self) -> Option<usize> {
        self.spans().iter().map(|s| s.byte_index).max()
    }

    /// Whether the field lies inside a payload of `byte_length` bytes
    pub fn fits(&self, byte_length: usize) -> bool {
        (1..=64).contains(&self.bit_length)
            && self.last_byte().is_some_and(|last| last < byte_length)
    }

    /// Read the raw bits; `data` must be long enough (see [`fits`](Self::fits))
    pub fn extract(&self, data: &[u8]) -> u64 {
        self.spans().iter().fold(0u64, |acc, span| {
            let bits = (data[span.byte_index] >> span.bit_offset) & span.mask();
            acc | (u64::from(bits) << span.value_shift)
        })
    }

    /// Write the raw bits, leaving every other bit of `data` untouched
    pub fn insert(&self, data: &mut [u8], raw: u64) {
        for span in self.spans() {
            let mask = span.mask();
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
    }
}

/// All-ones mask for an `n`-bit field
#[inline]
pub fn field_mask(bit_length: u8) -> u64 {
    if bit_length >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_length) - 1
    }
}

/// Sign extend the low `bit_length` bits of `raw`
#[inline]
pub fn sign_extend(raw: u64, bit_length: u8) -> i64 {
    let shift = 64 - u32::from(bit_length.clamp(1, 64));
    ((raw << shift) as i64) >> shift
}

/// Representable raw range of an integer signal; `None` for floats
pub fn raw_bounds(signal: &Signal) -> Option<(i128, i128)> {
    let n = u32::from(signal.bit_length.clamp(1, 64));
    match signal.value_type {
        ValueType::Float => None,
        ValueType::Unsigned => Some((0, (1i128 << n) - 1)),
        ValueType::Signed => Some((-(1i128 << (n - 1)), (1i128 << (n - 1)) - 1)),
    }
}

/// Physical value -> raw bit pattern (masked to `bit_length`)
///
/// `raw = round((physical - offset) / scale)`. Non-finite input is always
/// rejected; values past the field are rejected or clamped per `saturation`.
pub fn encode_raw(physical: f64, signal: &Signal, saturation: Saturation) -> Result<u64> {
    if !physical.is_finite() {
        return Err(CanError::out_of_range(format!(
            "{} is not a finite value",
            physical
        )));
    }

    let Some((min, max)) = raw_bounds(signal) else {
        return encode_float(physical, signal, saturation);
    };

    let scaled = ((physical - signal.offset) / signal.scale).round();
    if !scaled.is_finite() {
        return Err(CanError::out_of_range(format!(
            "{} overflows after scaling",
            physical
        )));
    }

    // float -> int casts saturate, so huge values still compare correctly
    let mut raw = scaled as i128;
    if raw < min || raw > max {
        match saturation {
            Saturation::Clamp => raw = raw.clamp(min, max),
            Saturation::Error => {
                return Err(CanError::out_of_range(format!(
                    "raw value {} outside {}..={} for {} bits",
                    raw, min, max, signal.bit_length
                )));
            },
        }
    }

    Ok((raw as u64) & field_mask(signal.bit_length))
}

fn encode_float(physical: f64, signal: &Signal, saturation: Saturation) -> Result<u64> {
    if signal.bit_length == 64 {
        return Ok(physical.to_bits());
    }

    let limit = f64::from(f32::MAX);
    let value = if physical.abs() > limit {
        match saturation {
            Saturation::Clamp => f32::MAX.copysign(physical as f32),
            Saturation::Error => {
                return Err(CanError::out_of_range(format!(
                    "{} exceeds single precision range",
                    physical
                )));
            },
        }
    } else {
        physical as f32
    };
    Ok(u64::from(value.to_bits()))
}

/// Raw bit pattern -> physical value
pub fn decode_raw(raw: u64, signal: &Signal) -> f64 {
    match signal.value_type {
        ValueType::Float if signal.bit_length == 64 => f64::from_bits(raw),
        ValueType::Float => f64::from(f32::from_bits(raw as u32)),
        ValueType::Signed => {
            sign_extend(raw, signal.bit_length) as f64 * signal.scale + signal.offset
        },
        ValueType::Unsigned => {
            (raw & field_mask(signal.bit_length)) as f64 * signal.scale + signal.offset
        },
    }
}

/// Raw bits as an integer, sign extended for signed signals
pub fn raw_integer(raw: u64, signal: &Signal) -> i64 {
    match signal.value_type {
        ValueType::Signed => sign_extend(raw, signal.bit_length),
        _ => (raw & field_mask(signal.bit_length)) as i64,
    }
}

/// Write a raw value into `data` at the signal's position
pub fn pack(raw: u64, signal: &Signal, data: &mut [u8]) -> Result<()> {
    let layout = signal.layout();
    if !layout.fits(data.len()) {
        return Err(out_of_buffer(signal, data.len()));
    }
    layout.insert(data, raw);
    Ok(())
}

/// Read a signal's raw value from `data`
pub fn unpack(data: &[u8], signal: &Signal) -> Result<u64> {
    let layout = signal.layout();
    if !layout.fits(data.len()) {
        return Err(out_of_buffer(signal, data.len()));
    }
    Ok(layout.extract(data))
}

fn out_of_buffer(signal: &Signal, len: usize) -> CanError {
    CanError::out_of_range(format!(
        "bits {}+{} of {} do not fit a {} byte buffer",
        signal.start_bit, signal.bit_length, signal.name, len
    ))
}

/// Physical range for UI controls
///
/// The declared minimum/maximum when present and meaningful, narrowed to
/// what the field can represent.
pub fn physical_bounds(signal: &Signal) -> (f64, f64) {
    let (lo, hi) = match raw_bounds(signal) {
        Some((min, max)) => {
            let a = min as f64 * signal.scale + signal.offset;
            let b = max as f64 * signal.scale + signal.offset;
            (a.min(b), a.max(b))
        },
        None if signal.bit_length == 32 => (f64::from(f32::MIN), f64::from(f32::MAX)),
        None => (f64::MIN, f64::MAX),
    };

    match (signal.minimum, signal.maximum) {
        (Some(min), Some(max)) if min < max => {
            let (min, max) = (min.max(lo), max.min(hi));
            if min <= max {
                (min, max)
            } else {
                (lo, hi)
            }
        },
        _ => (lo, hi),
    }
}

/// Quantization step of the physical value; zero for float signals
pub fn step(signal: &Signal) -> f64 {
    if signal.is_float() {
        0.0
    } else {
        signal.scale.abs()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // Motorola reference frame: 1F0#A5B6D90000000000
    const MOTOHAWK: [u8; 8] = [0xA5, 0xB6, 0xD9, 0, 0, 0, 0, 0];

    #[test]
    fn test_little_endian_spans_cross_bytes() {
        let layout = SignalLayout::new(4, 12, ByteOrder::LittleEndian);
        assert_eq!(layout.spans().len(), 2);
        assert_eq!(layout.spans()[0].num_bits, 4);
        assert_eq!(layout.spans()[1].value_shift, 4);
        assert_eq!(layout.last_byte(), Some(1));
    }

    #[test]
    fn test_full_width_layout_uses_nine_spans() {
        let le = SignalLayout::new(7, 64, ByteOrder::LittleEndian);
        assert_eq!(le.spans().len(), 9);
        assert!(le.fits(9));
        assert!(!le.fits(8));

        let be = SignalLayout::new(0, 64, ByteOrder::BigEndian);
        assert_eq!(be.spans().len(), 9);
    }

    #[test]
    fn test_big_endian_motohawk_fields() {
        let temperature = Signal::new("Temperature", 0, 12)
            .with_byte_order(ByteOrder::BigEndian)
            .with_value_type(ValueType::Signed)
            .with_scaling(0.01, 250.0);
        let raw = unpack(&MOTOHAWK, &temperature).unwrap();
        assert_eq!(raw, 0xDB6);
        assert!((decode_raw(raw, &temperature) - 244.14).abs() < 1e-9);

        let radius = Signal::new("AverageRadius", 6, 6)
            .with_byte_order(ByteOrder::BigEndian)
            .with_scaling(0.1, 0.0);
        assert_eq!(unpack(&MOTOHAWK, &radius).unwrap(), 18);

        let enable = Signal::new("Enable", 7, 1).with_byte_order(ByteOrder::BigEndian);
        assert_eq!(unpack(&MOTOHAWK, &enable).unwrap(), 1);
    }

    #[test]
    fn test_big_endian_pack_matches_reference() {
        let temperature = Signal::new("Temperature", 0, 12)
            .with_byte_order(ByteOrder::BigEndian)
            .with_value_type(ValueType::Signed)
            .with_scaling(0.01, 250.0);
        let mut data = MOTOHAWK;
        data[0] &= !0x01;
        data[1] = 0;
        data[2] &= 0x1F;

        let raw = encode_raw(244.14, &temperature, Saturation::Error).unwrap();
        pack(raw, &temperature, &mut data).unwrap();
        assert_eq!(data, MOTOHAWK);
    }

    #[test]
    fn test_sign_extension() {
        assert_eq!(sign_extend(0xF, 4), -1);
        assert_eq!(sign_extend(0x7, 4), 7);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }

    #[test]
    fn test_encode_rejects_and_clamps() {
        let signal = Signal::new("U8", 0, 8);
        assert_eq!(encode_raw(255.0, &signal, Saturation::Error).unwrap(), 255);
        assert!(encode_raw(256.0, &signal, Saturation::Error).is_err());
        assert!(encode_raw(-1.0, &signal, Saturation::Error).is_err());
        assert_eq!(encode_raw(256.0, &signal, Saturation::Clamp).unwrap(), 255);
        assert_eq!(encode_raw(-1.0, &signal, Saturation::Clamp).unwrap(), 0);

        let signed = Signal::new("I8", 0, 8).with_value_type(ValueType::Signed);
        assert_eq!(encode_raw(-1.0, &signed, Saturation::Error).unwrap(), 0xFF);
        assert_eq!(encode_raw(-200.0, &signed, Saturation::Clamp).unwrap(), 0x80);
    }

    #[test]
    fn test_non_finite_is_out_of_range() {
        let signal = Signal::new("U8", 0, 8);
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = encode_raw(value, &signal, Saturation::Clamp).unwrap_err();
            assert_eq!(err.error_code(), "OUT_OF_RANGE");
        }
    }

    #[test]
    fn test_float_signals_bypass_scaling() {
        let single = Signal::new("F32", 0, 32)
            .with_value_type(ValueType::Float)
            .with_scaling(10.0, 5.0);
        let raw = encode_raw(1.5, &single, Saturation::Error).unwrap();
        assert_eq!(raw, u64::from(1.5f32.to_bits()));
        assert_eq!(decode_raw(raw, &single), 1.5);
        assert!(encode_raw(1e300, &single, Saturation::Error).is_err());

        let double = Signal::new("F64", 0, 64).with_value_type(ValueType::Float);
        let raw = encode_raw(-2.25e100, &double, Saturation::Error).unwrap();
        assert_eq!(decode_raw(raw, &double), -2.25e100);
    }

    #[test]
    fn test_unsigned_64_bit_extremes() {
        let signal = Signal::new("U64", 0, 64);
        assert_eq!(raw_bounds(&signal), Some((0, u64::MAX as i128)));
        assert!(encode_raw(1e20, &signal, Saturation::Error).is_err());
        assert_eq!(encode_raw(1e20, &signal, Saturation::Clamp).unwrap(), u64::MAX);
    }

    #[test]
    fn test_pack_outside_buffer() {
        let signal = Signal::new("Late", 60, 8);
        let mut data = [0u8; 8];
        assert!(pack(1, &signal, &mut data).is_err());
        assert!(unpack(&data, &signal).is_err());
    }

    #[test]
    fn test_physical_bounds_and_step() {
        let signal = Signal::new("Speed", 0, 8)
            .with_scaling(0.5, 0.0)
            .with_range(0.0, 100.0);
        assert_eq!(physical_bounds(&signal), (0.0, 100.0));
        assert_eq!(step(&signal), 0.5);

        let undeclared = Signal::new("Temp", 0, 8)
            .with_value_type(ValueType::Signed)
            .with_scaling(-1.0, 40.0);
        assert_eq!(physical_bounds(&undeclared), (-87.0, 168.0));
        assert_eq!(step(&undeclared), 1.0);
    }
}
