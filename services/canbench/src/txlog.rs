//! Bounded, newest-first transmission log

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use errors::{CanError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::frame::{CanFrame, Direction};

pub const DEFAULT_LOG_CAPACITY: usize = 1000;
pub const MAX_LOG_CAPACITY: usize = 100_000;

/// How a logged transmission ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TxOutcome {
    Ok,
    Failed { code: u32 },
    Offline,
}

impl fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOutcome::Ok => write!(f, "OK"),
            TxOutcome::Failed { code } => write!(f, "ERR({})", code),
            TxOutcome::Offline => write!(f, "OFFLINE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub direction: Direction,
    pub id: u32,
    pub extended: bool,
    /// Space separated upper-case hex payload
    pub payload: String,
    pub outcome: TxOutcome,
}

impl LogEntry {
    pub fn for_frame(frame: &CanFrame, direction: Direction, outcome: TxOutcome) -> Self {
        Self {
            timestamp: Local::now(),
            direction,
            id: frame.id,
            extended: frame.is_extended(),
            payload: frame.data_hex(),
            outcome,
        }
    }

    /// `HH:MM:SS.mmm`
    pub fn time_of_day(&self) -> String {
        self.timestamp.format("%H:%M:%S%.3f").to_string()
    }

    pub fn id_hex(&self) -> String {
        common::hex::format_id(self.id, self.extended)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}] {}",
            self.time_of_day(),
            self.direction,
            self.id_hex(),
            self.payload,
            self.outcome
        )
    }
}

/// Log shared by the session and its callers
#[derive(Debug)]
pub struct TransmissionLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for TransmissionLog {
    fn default() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(DEFAULT_LOG_CAPACITY)),
            capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl TransmissionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if !(1..=MAX_LOG_CAPACITY).contains(&capacity) {
            return Err(CanError::config(format!(
                "log capacity {} outside 1..={}",
                capacity, MAX_LOG_CAPACITY
            )));
        }
        Ok(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity,
        })
    }

    /// Insert at the front, evicting the oldest entry past capacity
    pub fn push(&self, entry: LogEntry) {
        debug!(id = entry.id, outcome = %entry.outcome, "{}", entry);
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    /// Snapshot, newest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<LogEntry> {
        self.entries.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn entry(id: u32, outcome: TxOutcome) -> LogEntry {
        let frame = CanFrame::new_classic(id, vec![0x01, 0xAB]).unwrap();
        LogEntry::for_frame(&frame, Direction::Tx, outcome)
    }

    #[test]
    fn test_newest_first_and_bounded() {
        let log = TransmissionLog::with_capacity(3).unwrap();
        for id in 1..=5 {
            log.push(entry(id, TxOutcome::Ok));
        }
        let ids: Vec<_> = log.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(log.latest().unwrap().id, 5);
    }

    #[test]
    #[traced_test]
    fn test_push_is_mirrored_to_tracing() {
        let log = TransmissionLog::new();
        log.push(entry(0x1A0, TxOutcome::Failed { code: 0 }));
        assert!(logs_contain("0x1A0 [01 AB] ERR(0)"));
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(TransmissionLog::with_capacity(0).is_err());
        assert!(TransmissionLog::with_capacity(MAX_LOG_CAPACITY + 1).is_err());
        assert_eq!(
            TransmissionLog::with_capacity(MAX_LOG_CAPACITY)
                .unwrap()
                .capacity(),
            MAX_LOG_CAPACITY
        );
        assert_eq!(TransmissionLog::new().capacity(), DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn test_clear() {
        let log = TransmissionLog::new();
        log.push(entry(1, TxOutcome::Ok));
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_outcome_rendering() {
        assert_eq!(TxOutcome::Ok.to_string(), "OK");
        assert_eq!(TxOutcome::Failed { code: 0 }.to_string(), "ERR(0)");
        assert_eq!(TxOutcome::Offline.to_string(), "OFFLINE");

        let e = entry(0x100, TxOutcome::Offline);
        let text = e.to_string();
        assert!(text.ends_with("TX 0x100 [01 AB] OFFLINE"), "{}", text);
        assert_eq!(e.time_of_day().len(), "12:34:56.789".len());
    }

    #[test]
    fn test_direction_comes_from_caller() {
        let frame = CanFrame::new_classic(0x100, vec![0x14]).unwrap().received(5);
        let e = LogEntry::for_frame(&frame, Direction::Rx, TxOutcome::Ok);
        assert_eq!(e.direction, Direction::Rx);
        assert!(e.to_string().ends_with("RX 0x100 [14] OK"));
    }

    #[test]
    fn test_serializes_outcome() {
        let json = serde_json::to_value(entry(0x800, TxOutcome::Failed { code: 7 })).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["code"], 7);
        assert_eq!(json["extended"], true);
    }
}
