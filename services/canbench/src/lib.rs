//! canbench - CAN / CAN FD bench tester
//!
//! - `session`: adapter session state machine and the [`Transceiver`] capability
//! - `driver`: raw adapter backends (ZLG vendor library, loopback)
//! - `scheduler`: cyclic and sweep transmission jobs
//! - `monitor`: receive polling and fan-out
//! - `values`: live signal values shared with the scheduler
//! - `txlog`: bounded transmission log

pub mod cli;
pub mod config;
pub mod driver;
pub mod frame;
pub mod monitor;
pub mod scheduler;
pub mod session;
pub mod txlog;
pub mod values;

pub use config::CanBenchConfig;
pub use frame::{CanFrame, Direction};
pub use scheduler::{CyclicScheduler, JobStats, SweepPlan};
pub use session::{Delivery, SessionState, Transceiver, TransceiverSession};
pub use txlog::{LogEntry, TransmissionLog, TxOutcome};
pub use values::SignalValueStore;
