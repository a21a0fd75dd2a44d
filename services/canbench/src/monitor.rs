//! Receive monitor
//!
//! Polls the transceiver on a fixed interval and fans received frames out
//! to any number of subscribers.

use std::sync::Arc;
use std::time::Duration;

use errors::{CanError, Result};
use parking_lot::Mutex;
use signal_db::{Database, DecodedSignal};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::CanFrame;
use crate::session::Transceiver;

pub struct ReceiveMonitor {
    sender: broadcast::Sender<CanFrame>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiveMonitor {
    /// Start polling `transceiver` every `interval`
    pub fn spawn(
        transceiver: Arc<dyn Transceiver>,
        interval: Duration,
        buffer: usize,
        token: CancellationToken,
    ) -> Result<Self> {
        if interval.is_zero() || buffer == 0 {
            return Err(CanError::config("monitor interval and buffer must be positive"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CanError::invalid_state("the receive monitor needs a Tokio runtime"))?;

        let (sender, _) = broadcast::channel(buffer);
        let task = runtime.spawn(poll_loop(transceiver, interval, sender.clone(), token.clone()));
        info!("Receive monitor started ({} ms)", interval.as_millis());

        Ok(Self {
            sender,
            token,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.sender.subscribe()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop polling and wait for the task to end
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Receive monitor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ReceiveMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn poll_loop(
    transceiver: Arc<dyn Transceiver>,
    interval: Duration,
    sender: broadcast::Sender<CanFrame>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        let polled = {
            let transceiver = Arc::clone(&transceiver);
            tokio::task::spawn_blocking(move || transceiver.poll_receive()).await
        };
        match polled {
            Ok(Ok(frames)) => {
                for frame in frames {
                    // no subscribers is not an error
                    let _ = sender.send(frame);
                }
            },
            Ok(Err(e)) => warn!("Receive poll failed: {}", e),
            Err(e) => error!("Receive poll task panicked: {}", e),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {},
        }
    }
    debug!("Receive monitor stopped");
}

/// Decode a received frame against the database, if its id is known
pub fn decode_frame(db: &Database, frame: &CanFrame) -> Option<Result<Vec<DecodedSignal>>> {
    db.get_message_by_id(frame.id)
        .ok()
        .map(|message| message.decode_labeled(&frame.data))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::driver::LoopbackDriver;
    use crate::session::TransceiverSession;
    use signal_db::{Message, Signal};

    #[tokio::test]
    async fn test_monitor_broadcasts_received_frames() {
        let driver = LoopbackDriver::new();
        let session = Arc::new(TransceiverSession::new(Box::new(driver.clone())));
        session.connect().unwrap();

        let monitor = ReceiveMonitor::spawn(
            session.clone(),
            Duration::from_millis(5),
            16,
            CancellationToken::new(),
        )
        .unwrap();
        let mut rx = monitor.subscribe();

        driver.inject(CanFrame::new_classic(0x321, vec![0xAA]).unwrap());
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.id, 0x321);
        assert_eq!(frame.data, vec![0xAA]);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_monitor_is_quiet() {
        let session = Arc::new(TransceiverSession::offline());
        let monitor =
            ReceiveMonitor::spawn(session, Duration::from_millis(5), 4, CancellationToken::new())
                .unwrap();
        let mut rx = monitor.subscribe();
        let waited = tokio::time::timeout(Duration::from_millis(30), rx.recv()).await;
        assert!(waited.is_err());
        monitor.shutdown().await;
    }

    #[test]
    fn test_decode_frame() {
        let db = Database::new(
            String::new(),
            Vec::new(),
            vec![Message::new("M", 0x100, 1)
                .with_signal(Signal::new("S", 0, 8).with_scaling(0.5, 0.0))],
        )
        .unwrap();

        let known = CanFrame::new_classic(0x100, vec![0x14]).unwrap();
        let decoded = decode_frame(&db, &known).unwrap().unwrap();
        assert_eq!(decoded[0].value, 10.0);

        let unknown = CanFrame::new_classic(0x101, vec![0x14]).unwrap();
        assert!(decode_frame(&db, &unknown).is_none());

        let short = CanFrame::new_classic(0x100, vec![]).unwrap();
        assert!(decode_frame(&db, &short).unwrap().is_err());
    }
}
