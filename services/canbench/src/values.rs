//! Live signal values shared between the operator and the scheduler
//!
//! One record per message. Readers and writers copy whole records under a
//! single lock acquisition, so a reader never observes a half-applied update.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use signal_db::{Database, Message};

type Record = Arc<RwLock<HashMap<String, f64>>>;

#[derive(Debug, Default)]
pub struct SignalValueStore {
    records: RwLock<HashMap<String, Record>>,
}

impl SignalValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with every message's default values
    pub fn seeded(db: &Database) -> Self {
        let store = Self::new();
        for message in db.messages() {
            store.reset(message);
        }
        store
    }

    fn record(&self, message: &str) -> Record {
        if let Some(record) = self.records.read().get(message) {
            return Arc::clone(record);
        }
        Arc::clone(self.records.write().entry(message.to_string()).or_default())
    }

    /// Copy of one message's record (empty if never written)
    pub fn snapshot(&self, message: &str) -> HashMap<String, f64> {
        match self.records.read().get(message) {
            Some(record) => record.read().clone(),
            None => HashMap::new(),
        }
    }

    pub fn get(&self, message: &str, signal: &str) -> Option<f64> {
        self.records
            .read()
            .get(message)
            .and_then(|record| record.read().get(signal).copied())
    }

    pub fn set(&self, message: &str, signal: &str, value: f64) {
        self.record(message).write().insert(signal.to_string(), value);
    }

    /// Apply several values as one update
    pub fn set_many<I, K>(&self, message: &str, values: I)
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let record = self.record(message);
        let mut guard = record.write();
        for (signal, value) in values {
            guard.insert(signal.into(), value);
        }
    }

    /// Replace a record with the message's default values
    pub fn reset(&self, message: &Message) {
        let defaults = message.default_values();
        *self.record(&message.name).write() = defaults;
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn messages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.records.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use signal_db::Signal;
    use std::thread;

    #[test]
    fn test_set_and_snapshot() {
        let store = SignalValueStore::new();
        assert!(store.snapshot("M").is_empty());

        store.set("M", "S", 10.0);
        assert_eq!(store.get("M", "S"), Some(10.0));
        assert_eq!(store.snapshot("M"), HashMap::from([("S".to_string(), 10.0)]));
        assert_eq!(store.get("M", "Other"), None);
    }

    #[test]
    fn test_reset_to_defaults() {
        let message = Message::new("M", 0x100, 2)
            .with_signal(Signal::new("A", 0, 8).with_initial(3.0))
            .with_signal(Signal::new("B", 8, 8).with_range(1.0, 9.0));
        let store = SignalValueStore::new();
        store.set("M", "A", 99.0);
        store.reset(&message);

        let values = store.snapshot("M");
        assert_eq!(values["A"], 3.0);
        assert_eq!(values["B"], 1.0);
    }

    #[test]
    fn test_no_torn_records() {
        let store = Arc::new(SignalValueStore::new());
        store.set_many("M", [("A", 0.0), ("B", 0.0)]);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 1..2000 {
                    let v = f64::from(i);
                    store.set_many("M", [("A", v), ("B", v)]);
                }
            })
        };

        for _ in 0..2000 {
            let record = store.snapshot("M");
            assert_eq!(record["A"], record["B"]);
        }
        writer.join().unwrap();
    }
}
