//! Codec property tests
//!
//! - physical -> raw -> physical stays within one quantization step
//! - pack never disturbs bits outside the signal
//! - unpack followed by pack reproduces the buffer
//! - overlapping signals pack independently

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use signal_db::bits::{self, Saturation};
use signal_db::{ByteOrder, Signal, ValueType};

const LENGTHS: [u8; 6] = [1, 8, 16, 24, 32, 64];
const ORDERS: [ByteOrder; 2] = [ByteOrder::LittleEndian, ByteOrder::BigEndian];

/// A start bit that keeps the field inside 8 bytes
fn start_bit(order: ByteOrder, length: u8) -> u16 {
    match order {
        ByteOrder::LittleEndian if length > 56 => 0,
        ByteOrder::LittleEndian => 3,
        ByteOrder::BigEndian if length > 56 => 7,
        ByteOrder::BigEndian => 5,
    }
}

fn shapes() -> Vec<Signal> {
    let mut shapes = Vec::new();
    for order in ORDERS {
        for length in LENGTHS {
            let start = start_bit(order, length);
            for value_type in [ValueType::Unsigned, ValueType::Signed, ValueType::Float] {
                if value_type == ValueType::Float && length != 32 && length != 64 {
                    continue;
                }
                // power-of-two scale keeps wide fields exact in f64
                let (scale, offset) = if length > 32 { (0.5, 0.0) } else { (0.1, -5.0) };
                let name = format!("{order:?}_{length}_{value_type:?}");
                let signal = Signal::new(name, start, length)
                    .with_byte_order(order)
                    .with_value_type(value_type)
                    .with_scaling(scale, offset);
                shapes.push(signal);
            }
        }
    }
    shapes
}

fn random_physical(rng: &mut StdRng, signal: &Signal) -> f64 {
    match bits::raw_bounds(signal) {
        Some((min, max)) => {
            // stay inside the range f64 represents exactly
            let limit = 1i128 << 51;
            let raw = rng.gen_range(min.max(-limit)..=max.min(limit)) as f64;
            raw * signal.scale + signal.offset
        },
        None if signal.bit_length == 32 => f64::from(rng.gen_range(-1.0e6f32..1.0e6f32)),
        None => rng.gen_range(-1.0e12..1.0e12),
    }
}

#[test]
fn test_raw_round_trip_within_one_step() {
    let mut rng = StdRng::seed_from_u64(0x0CA1);

    for signal in shapes() {
        let (lo, hi) = signal.physical_bounds();
        // extreme bounds of fields wider than f64's mantissa round past the field
        let mut samples = if signal.is_float() || signal.bit_length <= 52 {
            vec![lo, hi]
        } else {
            Vec::new()
        };
        samples.extend((0..200).map(|_| random_physical(&mut rng, &signal)));

        for x in samples {
            if !(lo..=hi).contains(&x) {
                continue;
            }
            let raw = bits::encode_raw(x, &signal, Saturation::Error)
                .unwrap_or_else(|e| panic!("{}: encode {} failed: {}", signal.name, x, e));
            let back = bits::decode_raw(raw, &signal);

            let tolerance = if signal.is_float() {
                x.abs() * f64::from(f32::EPSILON)
            } else {
                signal.step()
            };
            assert!(
                (back - x).abs() <= tolerance,
                "{}: {} -> {:#x} -> {}",
                signal.name,
                x,
                raw,
                back
            );
        }
    }
}

#[test]
fn test_pack_leaves_other_bits_untouched() {
    let mut rng = StdRng::seed_from_u64(0xB175);

    for signal in shapes() {
        let mut field = [0u8; 8];
        bits::pack(u64::MAX, &signal, &mut field).unwrap();

        for _ in 0..100 {
            let original: [u8; 8] = rng.gen();
            let mut packed = original;
            bits::pack(rng.gen(), &signal, &mut packed).unwrap();

            for i in 0..8 {
                assert_eq!(
                    (original[i] ^ packed[i]) & !field[i],
                    0,
                    "{} changed bits outside the field in byte {}",
                    signal.name,
                    i
                );
            }
        }
    }
}

#[test]
fn test_unpack_then_pack_is_identity() {
    let mut rng = StdRng::seed_from_u64(0x5EED);

    for signal in shapes() {
        for _ in 0..100 {
            let buffer: [u8; 8] = rng.gen();
            let raw = bits::unpack(&buffer, &signal).unwrap();

            let mut rebuilt = buffer;
            bits::pack(raw, &signal, &mut rebuilt).unwrap();
            assert_eq!(rebuilt, buffer, "{}", signal.name);

            let mut cleared = [0u8; 8];
            bits::pack(raw, &signal, &mut cleared).unwrap();
            assert_eq!(bits::unpack(&cleared, &signal).unwrap(), raw);
        }
    }
}

#[test]
fn test_fd_payload_fields() {
    let signal = Signal::new("Deep", 500, 12);
    let mut data = [0u8; 64];
    bits::pack(0xABC, &signal, &mut data).unwrap();
    assert_eq!(bits::unpack(&data, &signal).unwrap(), 0xABC);
    assert_eq!(data[62], 0xC0);
    assert_eq!(data[63], 0xAB);
}

#[test]
fn test_overlapping_signals_last_write_wins() {
    let wide = Signal::new("Wide", 0, 16);
    let narrow = Signal::new("Narrow", 8, 8);

    let mut data = [0u8; 2];
    bits::pack(0x1234, &wide, &mut data).unwrap();
    bits::pack(0xAB, &narrow, &mut data).unwrap();

    assert_eq!(bits::unpack(&data, &narrow).unwrap(), 0xAB);
    // shared high byte now belongs to the later write, low byte is intact
    assert_eq!(bits::unpack(&data, &wide).unwrap(), 0xAB34);
}
