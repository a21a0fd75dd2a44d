//! Transceiver session
//!
//! Owns one adapter device and at most one active channel:
//!
//! ```text
//! Closed -> Opening -> Open -> ChannelActive -> Closed
//! ```
//!
//! Every driver call happens under the session lock. A failed transition is
//! rolled back completely: when a channel cannot be started the half-built
//! channel is reset and the device closed again. Steady-state failures
//! (`transmit`, `poll_receive`) never change state.
//!
//! A session built without a driver runs offline: opening reports
//! `DriverAbsent`, transmissions are logged as `OFFLINE` and succeed, and
//! receiving yields nothing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use errors::{CanError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{CanBenchConfig, DriverBackend};
use crate::driver::{
    AdapterDriver, ChannelConfig, ChannelHandle, ChannelMode, DeviceHandle, DeviceInfo,
    DeviceModel, LoopbackDriver, ZlgDriver, MAX_RECEIVE_BATCH, STATUS_OK,
};
use crate::frame::{CanFrame, Direction};
use crate::txlog::{LogEntry, TransmissionLog, TxOutcome};

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    ChannelActive,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "closed"),
            SessionState::Opening => write!(f, "opening"),
            SessionState::Open => write!(f, "open"),
            SessionState::ChannelActive => write!(f, "channel active"),
        }
    }
}

/// What happened to a frame handed to `transmit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the adapter
    Sent,
    /// No driver; logged only
    Offline,
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub tx_ok: u64,
    pub tx_failed: u64,
    pub tx_offline: u64,
    pub rx: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    tx_ok: AtomicU64,
    tx_failed: AtomicU64,
    tx_offline: AtomicU64,
    rx: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            tx_ok: self.tx_ok.load(Ordering::Relaxed),
            tx_failed: self.tx_failed.load(Ordering::Relaxed),
            tx_offline: self.tx_offline.load(Ordering::Relaxed),
            rx: self.rx.load(Ordering::Relaxed),
        }
    }
}

/// Capability used by the scheduler, the monitor and the CLI
pub trait Transceiver: Send + Sync {
    fn open(&self) -> Result<()>;

    fn start_channel(&self, index: u32, mode: ChannelMode) -> Result<()>;

    /// Send one frame synchronously
    fn transmit(&self, frame: &CanFrame) -> Result<Delivery>;

    /// Drain whatever is queued without waiting
    fn poll_receive(&self) -> Result<Vec<CanFrame>>;

    /// Release the device; safe to call in any state
    fn close(&self) -> Result<()>;

    fn state(&self) -> SessionState;

    fn is_offline(&self) -> bool;
}

// ============================================================================
// Session
// ============================================================================

struct SessionInner {
    driver: Option<Box<dyn AdapterDriver>>,
    state: SessionState,
    device: DeviceHandle,
    channel: ChannelHandle,
    mode: ChannelMode,
    device_info: Option<DeviceInfo>,
}

pub struct TransceiverSession {
    inner: Mutex<SessionInner>,
    backend: &'static str,
    model: DeviceModel,
    device_index: u32,
    channel_config: ChannelConfig,
    log: Arc<TransmissionLog>,
    stats: StatsCounters,
}

impl fmt::Debug for TransceiverSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransceiverSession")
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("state", &self.state())
            .finish()
    }
}

impl TransceiverSession {
    fn build(driver: Option<Box<dyn AdapterDriver>>) -> Self {
        let backend = driver.as_ref().map_or("offline", |d| d.name());
        Self {
            inner: Mutex::new(SessionInner {
                driver,
                state: SessionState::Closed,
                device: DeviceHandle::INVALID,
                channel: ChannelHandle::INVALID,
                mode: ChannelMode::Fd,
                device_info: None,
            }),
            backend,
            model: DeviceModel::UsbCanFd200U,
            device_index: 0,
            channel_config: ChannelConfig::default(),
            log: Arc::new(TransmissionLog::new()),
            stats: StatsCounters::default(),
        }
    }

    /// Session on top of an adapter driver
    pub fn new(driver: Box<dyn AdapterDriver>) -> Self {
        Self::build(Some(driver))
    }

    /// Session without a driver
    pub fn offline() -> Self {
        Self::build(None)
    }

    /// Session for a configuration
    ///
    /// A vendor library that cannot be loaded degrades the session to
    /// offline mode instead of failing.
    pub fn from_config(config: &CanBenchConfig) -> Result<Self> {
        let driver: Option<Box<dyn AdapterDriver>> = match config.driver.backend {
            DriverBackend::Offline => None,
            DriverBackend::Loopback => Some(Box::new(LoopbackDriver::new())),
            DriverBackend::Zlg => match ZlgDriver::load(
                config.driver.library_path.as_deref(),
                config.driver.working_dir.as_deref(),
            ) {
                Ok(driver) => Some(Box::new(driver)),
                Err(e) => {
                    warn!("Adapter driver unavailable, running offline: {}", e);
                    None
                },
            },
        };

        let log = TransmissionLog::with_capacity(config.log.capacity)?;
        Ok(Self::build(driver)
            .with_device(config.driver.device_model, config.driver.device_index)
            .with_channel_config(config.channel.clone())
            .with_log(Arc::new(log)))
    }

    pub fn with_device(mut self, model: DeviceModel, index: u32) -> Self {
        self.model = model;
        self.device_index = index;
        self
    }

    /// Template for channels started by this session (index and mode are
    /// taken from `start_channel`)
    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn with_log(mut self, log: Arc<TransmissionLog>) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> Arc<TransmissionLog> {
        Arc::clone(&self.log)
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn device_model(&self) -> DeviceModel {
        self.model
    }

    /// Identity read right after the device was opened
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner.lock().device_info.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    /// Open the device and start the configured channel
    pub fn connect(&self) -> Result<()> {
        self.open()?;
        self.start_channel(self.channel_config.index, self.channel_config.mode)
    }

    fn log_transmit(&self, frame: &CanFrame, outcome: TxOutcome) {
        self.log.push(LogEntry::for_frame(frame, Direction::Tx, outcome));
    }
}

/// Undo a partially started channel and close the device
fn rollback(driver: &mut dyn AdapterDriver, device: DeviceHandle, channel: ChannelHandle) {
    if channel.is_valid() {
        let status = driver.reset_channel(channel);
        if status != STATUS_OK {
            warn!(status, "Channel reset during rollback failed");
        }
    }
    let status = driver.close_device(device);
    if status != STATUS_OK {
        warn!(status, "Device close during rollback failed");
    }
}

impl Transceiver for TransceiverSession {
    fn open(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(driver) = inner.driver.as_mut() else {
            return Err(CanError::DriverAbsent);
        };
        if inner.state != SessionState::Closed {
            return Err(CanError::invalid_state(format!(
                "cannot open a session that is {}",
                inner.state
            )));
        }

        inner.state = SessionState::Opening;
        debug!("Opening {} #{} via {}", self.model, self.device_index, driver.name());
        let device = driver.open_device(self.model, self.device_index);
        if !device.is_valid() {
            inner.state = SessionState::Closed;
            error!("Failed to open {} #{}", self.model, self.device_index);
            return Err(CanError::DeviceUnavailable(format!(
                "{} #{} could not be opened",
                self.model, self.device_index
            )));
        }

        inner.device_info = driver.device_info(device);
        match &inner.device_info {
            Some(info) => info!("Adapter connected: {}", info),
            None => warn!("Adapter connected, but device info could not be read"),
        }

        inner.device = device;
        inner.state = SessionState::Open;
        Ok(())
    }

    fn start_channel(&self, index: u32, mode: ChannelMode) -> Result<()> {
        let config = ChannelConfig {
            index,
            mode,
            ..self.channel_config.clone()
        };
        config.validate()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(driver) = inner.driver.as_mut() else {
            return Err(CanError::DriverAbsent);
        };
        match inner.state {
            SessionState::Open => {},
            SessionState::ChannelActive => {
                return Err(CanError::invalid_state("a channel is already active"));
            },
            state => {
                return Err(CanError::invalid_state(format!(
                    "cannot start a channel while {}",
                    state
                )));
            },
        }

        let device = inner.device;
        let mut channel = ChannelHandle::INVALID;
        let failure = 'start: {
            let abit = driver.set_value(
                device,
                &format!("{}/canfd_abit_baud_rate", index),
                &config.arbitration_bitrate.to_string(),
            );
            if abit != STATUS_OK {
                break 'start Some(format!("arbitration bit rate rejected (status {})", abit));
            }
            if mode == ChannelMode::Fd {
                let dbit = driver.set_value(
                    device,
                    &format!("{}/canfd_dbit_baud_rate", index),
                    &config.data_bitrate.to_string(),
                );
                if dbit != STATUS_OK {
                    break 'start Some(format!("data bit rate rejected (status {})", dbit));
                }
            }

            channel = driver.init_channel(device, &config);
            if !channel.is_valid() {
                break 'start Some(format!("channel {} could not be initialised", index));
            }

            let resistor = driver.set_value(
                device,
                &format!("{}/initenal_resistance", index),
                if config.terminal_resistor { "1" } else { "0" },
            );
            if resistor != STATUS_OK {
                break 'start Some(format!("terminal resistor rejected (status {})", resistor));
            }

            let status = driver.start_channel(channel);
            if status != STATUS_OK {
                break 'start Some(format!("channel {} start returned status {}", index, status));
            }
            None
        };

        if let Some(reason) = failure {
            rollback(driver.as_mut(), device, channel);
            inner.state = SessionState::Closed;
            inner.device = DeviceHandle::INVALID;
            inner.channel = ChannelHandle::INVALID;
            inner.device_info = None;
            error!("Channel start failed, device closed: {}", reason);
            return Err(CanError::Start(reason));
        }

        inner.channel = channel;
        inner.mode = mode;
        inner.state = SessionState::ChannelActive;
        info!(
            "Channel {} started ({}, {} bit/s)",
            index, mode, config.arbitration_bitrate
        );
        Ok(())
    }

    fn transmit(&self, frame: &CanFrame) -> Result<Delivery> {
        frame.validate()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(driver) = inner.driver.as_mut() else {
            self.log_transmit(frame, TxOutcome::Offline);
            self.stats.tx_offline.fetch_add(1, Ordering::Relaxed);
            return Ok(Delivery::Offline);
        };
        if inner.state != SessionState::ChannelActive {
            return Err(CanError::invalid_state(format!(
                "cannot transmit while {}",
                inner.state
            )));
        }
        if frame.is_fd && inner.mode == ChannelMode::Classic {
            return Err(CanError::invalid_frame(
                "FD frame on a classic channel".to_string(),
            ));
        }

        debug!("Sending CAN frame: ID=0x{:X}", frame.id);
        let count = driver.transmit(inner.channel, frame);
        if count == 1 {
            self.log_transmit(frame, TxOutcome::Ok);
            self.stats.tx_ok.fetch_add(1, Ordering::Relaxed);
            Ok(Delivery::Sent)
        } else {
            self.log_transmit(frame, TxOutcome::Failed { code: count });
            self.stats.tx_failed.fetch_add(1, Ordering::Relaxed);
            warn!(id = frame.id, code = count, "Transmit failed");
            Err(CanError::Transmit { code: count })
        }
    }

    fn poll_receive(&self) -> Result<Vec<CanFrame>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(driver) = inner.driver.as_mut() else {
            return Ok(Vec::new());
        };
        if inner.state != SessionState::ChannelActive {
            return Ok(Vec::new());
        }

        let queues: &[bool] = match inner.mode {
            ChannelMode::Classic => &[false],
            ChannelMode::Fd => &[false, true],
        };

        let mut frames = Vec::new();
        for &fd in queues {
            let pending = driver.receive_count(inner.channel, fd);
            if pending == 0 {
                continue;
            }
            frames.extend(driver.receive(inner.channel, fd, pending.min(MAX_RECEIVE_BATCH), 0));
        }

        if !frames.is_empty() {
            for frame in &frames {
                self.log.push(LogEntry::for_frame(frame, Direction::Rx, TxOutcome::Ok));
            }
            self.stats.rx.fetch_add(frames.len() as u64, Ordering::Relaxed);
            debug!("Received {} frames", frames.len());
        }
        Ok(frames)
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(driver) = inner.driver.as_mut() else {
            return Ok(());
        };
        if inner.state == SessionState::Closed {
            return Ok(());
        }

        if inner.channel.is_valid() {
            let status = driver.reset_channel(inner.channel);
            if status != STATUS_OK {
                warn!(status, "Channel reset failed");
            }
        }
        if inner.device.is_valid() {
            let status = driver.close_device(inner.device);
            if status != STATUS_OK {
                warn!(status, "Device close failed");
            }
        }

        inner.state = SessionState::Closed;
        inner.device = DeviceHandle::INVALID;
        inner.channel = ChannelHandle::INVALID;
        inner.device_info = None;
        info!("Adapter disconnected");
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn is_offline(&self) -> bool {
        self.inner.lock().driver.is_none()
    }
}

impl Drop for TransceiverSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close session on drop: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn loopback_session() -> (LoopbackDriver, TransceiverSession) {
        let driver = LoopbackDriver::new();
        let session = TransceiverSession::new(Box::new(driver.clone()));
        (driver, session)
    }

    #[test]
    fn test_state_transitions() {
        let (_, session) = loopback_session();
        assert_eq!(session.state(), SessionState::Closed);

        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.device_info().unwrap().hardware_type, "Loopback");

        session.start_channel(0, ChannelMode::Fd).unwrap();
        assert_eq!(session.state(), SessionState::ChannelActive);

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.device_info().is_none());
        session.close().unwrap();
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let (_, session) = loopback_session();
        session.open().unwrap();
        assert_eq!(session.open().unwrap_err().error_code(), "INVALID_STATE");
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_open_failure() {
        let (driver, session) = loopback_session();
        driver.fail_open(true);
        let err = session.open().unwrap_err();
        assert_eq!(err.error_code(), "DEVICE_UNAVAILABLE");
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_start_requires_open_device() {
        let (_, session) = loopback_session();
        let err = session.start_channel(0, ChannelMode::Fd).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let (driver, session) = loopback_session();
        session.open().unwrap();
        driver.fail_start(true);

        let err = session.start_channel(0, ChannelMode::Fd).unwrap_err();
        assert_eq!(err.error_code(), "START_ERROR");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.resets(), 1);
        assert_eq!(driver.open_devices(), 0);

        driver.fail_start(false);
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::ChannelActive);
    }

    #[test]
    fn test_init_failure_rolls_back_without_reset() {
        let (driver, session) = loopback_session();
        session.open().unwrap();
        driver.fail_init(true);

        assert!(session.start_channel(0, ChannelMode::Classic).is_err());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(driver.resets(), 0);
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn test_channel_properties() {
        let (driver, session) = loopback_session();
        session.open().unwrap();
        session.start_channel(1, ChannelMode::Fd).unwrap();

        let keys: Vec<_> = driver.properties().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                "1/canfd_abit_baud_rate",
                "1/canfd_dbit_baud_rate",
                "1/initenal_resistance"
            ]
        );
    }

    #[test]
    fn test_transmit_and_log() {
        let (driver, session) = loopback_session();
        session.connect().unwrap();

        let frame = CanFrame::new_classic(0x100, vec![0x14]).unwrap();
        assert_eq!(session.transmit(&frame).unwrap(), Delivery::Sent);
        assert_eq!(driver.sent(), vec![frame]);

        let entry = session.log().latest().unwrap();
        assert_eq!(entry.outcome, TxOutcome::Ok);
        assert_eq!(entry.payload, "14");
        assert_eq!(session.stats().tx_ok, 1);
    }

    #[test]
    fn test_transmit_failure_keeps_state() {
        let (driver, session) = loopback_session();
        session.connect().unwrap();
        driver.transmit_result(Some(0));

        let frame = CanFrame::new_classic(0x100, vec![0x14]).unwrap();
        let err = session.transmit(&frame).unwrap_err();
        assert!(matches!(err, CanError::Transmit { code: 0 }));
        assert_eq!(session.state(), SessionState::ChannelActive);
        assert_eq!(
            session.log().latest().unwrap().outcome,
            TxOutcome::Failed { code: 0 }
        );
        assert_eq!(session.stats().tx_failed, 1);
    }

    #[test]
    fn test_transmit_without_channel_is_not_logged() {
        let (_, session) = loopback_session();
        session.open().unwrap();
        let frame = CanFrame::new_classic(0x100, vec![]).unwrap();
        assert_eq!(session.transmit(&frame).unwrap_err().error_code(), "INVALID_STATE");
        assert!(session.log().is_empty());
    }

    #[test]
    fn test_fd_frame_on_classic_channel() {
        let (_, session) = loopback_session();
        session.open().unwrap();
        session.start_channel(0, ChannelMode::Classic).unwrap();
        let frame = CanFrame::new_fd(0x100, vec![0; 12], false).unwrap();
        assert_eq!(session.transmit(&frame).unwrap_err().error_code(), "INVALID_FRAME");
    }

    #[test]
    fn test_poll_receive_drains_both_queues() {
        let (driver, session) = loopback_session();
        assert!(session.poll_receive().unwrap().is_empty());
        session.connect().unwrap();

        driver.inject(CanFrame::new_classic(0x1, vec![1]).unwrap());
        driver.inject(CanFrame::new_fd(0x2, vec![2; 16], true).unwrap());

        let frames = session.poll_receive().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(session.poll_receive().unwrap().is_empty());
        assert_eq!(session.stats().rx, 2);

        let entries = session.log().entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.direction == Direction::Rx));
        assert_eq!(entries[0].id, 0x2);
        assert_eq!(entries[0].payload, vec!["02"; 16].join(" "));
    }

    #[test]
    fn test_invalid_frame_never_reaches_driver() {
        let (driver, session) = loopback_session();
        session.connect().unwrap();

        let mut oversized = CanFrame::new_classic(0x100, vec![0; 8]).unwrap();
        oversized.data.push(0);
        assert_eq!(session.transmit(&oversized).unwrap_err().error_code(), "INVALID_FRAME");

        let mut brs = CanFrame::new_classic(0x100, vec![]).unwrap();
        brs.bit_rate_switch = true;
        assert!(session.transmit(&brs).is_err());

        let mut odd_fd = CanFrame::new_fd(0x100, vec![0; 12], false).unwrap();
        odd_fd.data.truncate(10);
        assert!(session.transmit(&odd_fd).is_err());

        assert!(driver.sent().is_empty());
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[test]
    fn test_offline_session() {
        let session = TransceiverSession::offline();
        assert!(session.is_offline());
        assert!(session.open().unwrap_err().is_offline());
        assert!(session.start_channel(0, ChannelMode::Fd).unwrap_err().is_offline());

        let frame = CanFrame::new_classic(0x100, vec![0x14]).unwrap();
        assert_eq!(session.transmit(&frame).unwrap(), Delivery::Offline);
        assert_eq!(session.log().latest().unwrap().outcome, TxOutcome::Offline);
        assert!(session.poll_receive().unwrap().is_empty());
        session.close().unwrap();
        assert_eq!(session.stats().tx_offline, 1);
    }

    #[test]
    fn test_drop_closes_device() {
        let driver = LoopbackDriver::new();
        {
            let session = TransceiverSession::new(Box::new(driver.clone()));
            session.connect().unwrap();
            assert_eq!(driver.open_devices(), 1);
        }
        assert_eq!(driver.open_devices(), 0);
    }
}
