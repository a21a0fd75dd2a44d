//! Cyclic transmission scheduler
//!
//! Each job owns one message and repeats read -> encode -> transmit until
//! stopped. The wait before the next tick starts once the previous tick's
//! work is done, so a slow driver call stretches the period instead of
//! piling ticks up. Cancellation is observed at the top of a tick and while
//! waiting; a driver call in flight always runs to completion.
//!
//! A sweep job additionally writes the next value of one signal into the
//! shared value store before every tick and ends when the range is used up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errors::{CanError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use signal_db::{Message, Saturation};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::CanFrame;
use crate::session::{Delivery, Transceiver};
use crate::values::SignalValueStore;

// ============================================================================
// Sweep plan
// ============================================================================

/// Longest sweep a single plan may describe
pub const MAX_SWEEP_POINTS: u64 = 1_000_000;

/// Step one signal through a range, one value per tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPlan {
    pub signal: String,
    pub start: f64,
    pub end: f64,
    /// Positive step size; the direction follows `start` and `end`
    pub step: f64,
    /// Start over at `start` instead of finishing
    pub repeat: bool,
}

impl SweepPlan {
    pub fn new(signal: impl Into<String>, start: f64, end: f64, step: f64) -> Self {
        Self {
            signal: signal.into(),
            start,
            end,
            step,
            repeat: false,
        }
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    fn validate(&self, message: &Message) -> Result<()> {
        message.signal(&self.signal)?;
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(CanError::out_of_range("sweep bounds must be finite"));
        }
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(CanError::out_of_range(format!(
                "sweep step must be positive, got {}",
                self.step
            )));
        }
        let intervals = self.intervals();
        if intervals >= MAX_SWEEP_POINTS as f64 {
            return Err(CanError::out_of_range(format!(
                "sweep from {} to {} by {} exceeds {} points",
                self.start, self.end, self.step, MAX_SWEEP_POINTS
            )));
        }
        Ok(())
    }

    fn intervals(&self) -> f64 {
        ((self.end - self.start).abs() / self.step + 1e-9).floor()
    }

    /// Number of values in one pass, both ends included
    ///
    /// Saturates at `u64::MAX` on ranges too wide to count.
    pub fn points(&self) -> u64 {
        // float to int casts saturate, NaN becomes 0
        (self.intervals() as u64).saturating_add(1)
    }

    /// Value written before tick `tick`; `None` once a single pass is over
    pub fn value_at(&self, tick: u64) -> Option<f64> {
        let points = self.points();
        let index = if self.repeat {
            tick % points
        } else if tick < points {
            tick
        } else {
            return None;
        };
        let direction = if self.end >= self.start { 1.0 } else { -1.0 };
        Some(self.start + direction * self.step * index as f64)
    }
}

// ============================================================================
// Job statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub ticks: u64,
    pub sent: u64,
    pub offline: u64,
    pub encode_failures: u64,
    pub transmit_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct JobCounters {
    ticks: AtomicU64,
    sent: AtomicU64,
    offline: AtomicU64,
    encode_failures: AtomicU64,
    transmit_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl JobCounters {
    fn fail(&self, counter: &AtomicU64, error: String) {
        counter.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error);
    }

    fn snapshot(&self) -> JobStats {
        JobStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            transmit_failures: self.transmit_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

// ============================================================================
// Job
// ============================================================================

struct CyclicJob {
    message: Message,
    period: Duration,
    sweep: Option<SweepPlan>,
    transceiver: Arc<dyn Transceiver>,
    values: Arc<SignalValueStore>,
    saturation: Saturation,
    bit_rate_switch: bool,
    counters: Arc<JobCounters>,
}

impl CyclicJob {
    async fn run(self, token: CancellationToken) {
        info!(
            "Cyclic job {} started (0x{:X}, every {} ms)",
            self.message.name,
            self.message.frame_id,
            self.period.as_millis()
        );

        let mut tick: u64 = 0;
        loop {
            if token.is_cancelled() {
                break;
            }

            if let Some(sweep) = &self.sweep {
                match sweep.value_at(tick) {
                    Some(value) => {
                        debug!("Sweep {}.{} = {}", self.message.name, sweep.signal, value);
                        self.values.set(&self.message.name, &sweep.signal, value);
                    },
                    None => {
                        info!("Sweep of {}.{} finished", self.message.name, sweep.signal);
                        break;
                    },
                }
            }

            self.tick().await;
            tick += 1;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {},
            }
        }

        debug!("Cyclic job {} stopped after {} ticks", self.message.name, tick);
    }

    async fn tick(&self) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let values = self.values.snapshot(&self.message.name);
        let frame = match self
            .message
            .encode_with(&values, self.saturation)
            .and_then(|data| {
                CanFrame::for_message(&self.message, data, false, self.bit_rate_switch)
            })
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cyclic encode of {} failed: {}", self.message.name, e);
                self.counters.fail(&self.counters.encode_failures, e.to_string());
                return;
            },
        };

        let transceiver = Arc::clone(&self.transceiver);
        match tokio::task::spawn_blocking(move || transceiver.transmit(&frame)).await {
            Ok(Ok(Delivery::Sent)) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            },
            Ok(Ok(Delivery::Offline)) => {
                self.counters.offline.fetch_add(1, Ordering::Relaxed);
            },
            Ok(Err(e)) => {
                debug!("Cyclic transmit of {} failed: {}", self.message.name, e);
                self.counters.fail(&self.counters.transmit_failures, e.to_string());
            },
            Err(e) => {
                error!("Transmit task for {} panicked: {}", self.message.name, e);
                self.counters.fail(&self.counters.transmit_failures, e.to_string());
            },
        }
    }
}

struct JobHandle {
    token: CancellationToken,
    counters: Arc<JobCounters>,
    task: JoinHandle<()>,
    period: Duration,
    sweep: bool,
}

/// Summary of one scheduled job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub message: String,
    pub period_ms: u64,
    pub sweep: bool,
    pub running: bool,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runs at most one cyclic job per message
pub struct CyclicScheduler {
    transceiver: Arc<dyn Transceiver>,
    values: Arc<SignalValueStore>,
    saturation: Saturation,
    bit_rate_switch: bool,
    shutdown: CancellationToken,
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl CyclicScheduler {
    pub fn new(transceiver: Arc<dyn Transceiver>, values: Arc<SignalValueStore>) -> Self {
        Self {
            transceiver,
            values,
            saturation: Saturation::Error,
            bit_rate_switch: false,
            shutdown: CancellationToken::new(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_saturation(mut self, saturation: Saturation) -> Self {
        self.saturation = saturation;
        self
    }

    pub fn with_bit_rate_switch(mut self, bit_rate_switch: bool) -> Self {
        self.bit_rate_switch = bit_rate_switch;
        self
    }

    /// Jobs are children of `token`; cancelling it stops every job
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn values(&self) -> &Arc<SignalValueStore> {
        &self.values
    }

    /// Start transmitting `message` every `period`
    pub fn start(&self, message: &Message, period: Duration) -> Result<()> {
        self.spawn(message, period, None)
    }

    /// Start a sweep of one signal of `message`
    pub fn start_sweep(&self, message: &Message, period: Duration, plan: SweepPlan) -> Result<()> {
        plan.validate(message)?;
        self.spawn(message, period, Some(plan))
    }

    fn spawn(&self, message: &Message, period: Duration, sweep: Option<SweepPlan>) -> Result<()> {
        if period.is_zero() {
            return Err(CanError::out_of_range("cyclic period must be positive"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CanError::invalid_state("cyclic jobs need a Tokio runtime"))?;

        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get(&message.name) {
            if !existing.task.is_finished() {
                return Err(CanError::invalid_state(format!(
                    "{} is already being transmitted",
                    message.name
                )));
            }
        }

        let token = self.shutdown.child_token();
        let counters = Arc::new(JobCounters::default());
        let is_sweep = sweep.is_some();
        let job = CyclicJob {
            message: message.clone(),
            period,
            sweep,
            transceiver: Arc::clone(&self.transceiver),
            values: Arc::clone(&self.values),
            saturation: self.saturation,
            bit_rate_switch: self.bit_rate_switch,
            counters: Arc::clone(&counters),
        };
        let task = runtime.spawn(job.run(token.clone()));

        jobs.insert(
            message.name.clone(),
            JobHandle {
                token,
                counters,
                task,
                period,
                sweep: is_sweep,
            },
        );
        Ok(())
    }

    /// Stop one job; returns false if none was scheduled for `message`
    ///
    /// Returns without waiting; a transmit already in flight completes.
    pub fn stop(&self, message: &str) -> bool {
        match self.jobs.lock().remove(message) {
            Some(job) => {
                job.token.cancel();
                info!("Cyclic job {} stopping", message);
                true
            },
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain().collect();
        for (name, job) in jobs {
            job.token.cancel();
            debug!("Cyclic job {} stopping", name);
        }
    }

    /// Stop every job and wait for their tasks to end
    pub async fn shutdown(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain().collect();
        for (_, job) in &jobs {
            job.token.cancel();
        }
        for (name, job) in jobs {
            if let Err(e) = job.task.await {
                warn!("Cyclic job {} ended abnormally: {}", name, e);
            }
        }
    }

    /// Wait until a job ends by itself (finished sweeps) or is stopped
    pub async fn wait(&self, message: &str) {
        let token = match self.jobs.lock().get(message) {
            Some(job) => job.token.clone(),
            None => return,
        };
        loop {
            let finished = self
                .jobs
                .lock()
                .get(message)
                .map_or(true, |job| job.task.is_finished());
            if finished || token.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn is_running(&self, message: &str) -> bool {
        self.jobs
            .lock()
            .get(message)
            .is_some_and(|job| !job.task.is_finished())
    }

    pub fn stats(&self, message: &str) -> Option<JobStats> {
        self.jobs.lock().get(message).map(|job| job.counters.snapshot())
    }

    /// Scheduled jobs sorted by message name (finished sweeps included)
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut list: Vec<_> = self
            .jobs
            .lock()
            .iter()
            .map(|(name, job)| JobInfo {
                message: name.clone(),
                period_ms: job.period.as_millis() as u64,
                sweep: job.sweep,
                running: !job.task.is_finished(),
            })
            .collect();
        list.sort_by(|a, b| a.message.cmp(&b.message));
        list
    }
}

impl Drop for CyclicScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
