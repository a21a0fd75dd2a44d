//! CAN signal database
//!
//! Parses DBC schemas into an immutable [`Database`] of [`Message`]s and
//! [`Signal`]s, and converts between physical signal values and payload
//! bytes.
//!
//! ```ignore
//! let db = signal_db::Database::load_file("vehicle.dbc")?;
//! let speed = db.get_message_by_name("VehicleSpeed")?;
//! let payload = speed.encode(&values)?;
//! ```

pub mod bits;
pub mod dbc;
pub mod model;
pub mod source;

pub use bits::{Saturation, SignalLayout};
pub use model::{
    ByteOrder, Database, DecodedSignal, Message, Multiplex, Signal, ValueType, CANFD_MAX_DLEN,
    CAN_MAX_DLEN, MAX_EXTENDED_ID, MAX_STANDARD_ID,
};
