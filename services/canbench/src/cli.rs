//! Command line front end

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use errors::CanError;
use signal_db::{ByteOrder, Database, Message, Saturation, Signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CanBenchConfig;
use crate::frame::CanFrame;
use crate::monitor::{self, ReceiveMonitor};
use crate::scheduler::{CyclicScheduler, JobStats, SweepPlan};
use crate::session::{Delivery, Transceiver, TransceiverSession};
use crate::txlog::TxOutcome;
use crate::values::SignalValueStore;

#[derive(Parser, Debug)]
#[command(name = "canbench")]
#[command(about = "CAN / CAN FD bench tester")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long = "config", global = true, env = "CANBENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable coloured output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the messages and signals of a database
    Inspect {
        dbc: PathBuf,
    },

    /// Encode signal values into a payload
    Encode {
        dbc: PathBuf,
        message: String,
        /// SIGNAL=VALUE pairs; VALUE may be an enumeration label
        values: Vec<String>,
        /// Clamp out-of-range values instead of failing
        #[arg(long)]
        clamp: bool,
    },

    /// Decode a payload
    Decode {
        dbc: PathBuf,
        /// Message name or frame id (0x1A0, 1A0h)
        message: String,
        /// Payload in hex ("14 FF", "14FF")
        data: String,
    },

    /// Transmit one frame
    Send {
        dbc: PathBuf,
        message: String,
        values: Vec<String>,
    },

    /// Transmit a message periodically until stopped
    Cyclic {
        dbc: PathBuf,
        message: String,
        values: Vec<String>,
        /// Period in ms (defaults to the message cycle time)
        #[arg(long)]
        period_ms: Option<u64>,
        /// Stop after this many seconds
        #[arg(long)]
        duration_s: Option<f64>,
    },

    /// Step one signal through a range
    Sweep {
        dbc: PathBuf,
        message: String,
        signal: String,
        /// First value (defaults to the signal minimum)
        #[arg(long, allow_negative_numbers = true)]
        start: Option<f64>,
        /// Last value (defaults to the signal maximum)
        #[arg(long, allow_negative_numbers = true)]
        end: Option<f64>,
        #[arg(long, default_value_t = 1.0)]
        step: f64,
        #[arg(long, default_value_t = 50)]
        period_ms: u64,
        /// Start over when the end is reached
        #[arg(long)]
        repeat: bool,
    },

    /// Print received frames
    Monitor {
        /// Decode frames known to this database
        #[arg(long)]
        dbc: Option<PathBuf>,
        #[arg(long)]
        duration_s: Option<f64>,
    },

    /// Show adapter information
    Info,
}

// ============================================================================
// Helpers
// ============================================================================

/// Physical value for `text`: a number, or an enumeration label of `signal`
pub fn parse_value(signal: &Signal, text: &str) -> Result<f64, CanError> {
    if let Ok(value) = text.trim().parse::<f64>() {
        return Ok(value);
    }
    signal
        .raw_for_label(text.trim())
        .map(|raw| raw as f64 * signal.scale + signal.offset)
        .ok_or_else(|| {
            CanError::parse(format!(
                "'{}' is neither a number nor a label of {}",
                text, signal.name
            ))
        })
}

/// Parse `SIGNAL=VALUE` arguments against `message`
pub fn parse_assignments(
    message: &Message,
    args: &[String],
) -> Result<HashMap<String, f64>, CanError> {
    let mut values = HashMap::with_capacity(args.len());
    for arg in args {
        let (name, text) = arg
            .split_once('=')
            .ok_or_else(|| CanError::parse(format!("expected SIGNAL=VALUE, got '{}'", arg)))?;
        let signal = message.signal(name.trim())?;
        values.insert(signal.name.clone(), parse_value(signal, text)?);
    }
    Ok(values)
}

/// Find a message by name, falling back to a frame id
pub fn resolve_message<'a>(db: &'a Database, key: &str) -> Result<&'a Message, CanError> {
    match db.get_message_by_name(key) {
        Ok(message) => Ok(message),
        Err(not_found) => match common::hex::parse_id(key) {
            Ok(id) => db.get_message_by_id(id),
            Err(_) => Err(not_found),
        },
    }
}

fn load_db(path: &Path) -> Result<Database> {
    Database::load_file(path).with_context(|| format!("loading {}", path.display()))
}

fn duration_arg(seconds: Option<f64>) -> Result<Option<Duration>> {
    match seconds {
        Some(s) if !s.is_finite() || s <= 0.0 => bail!("duration must be positive, got {}", s),
        Some(s) => Ok(Some(Duration::from_secs_f64(s))),
        None => Ok(None),
    }
}

/// Session from configuration, connected when a driver is present
fn connect(config: &CanBenchConfig) -> Result<Arc<TransceiverSession>> {
    let session = TransceiverSession::from_config(config)?;
    match session.connect() {
        Ok(()) => {},
        Err(e) if e.is_offline() => {
            warn!("{}", e);
            println!("{}", "Adapter driver not available, running OFFLINE".yellow());
        },
        Err(e) => return Err(e.into()),
    }
    Ok(Arc::new(session))
}

/// Resolve when `duration` elapses, or on Ctrl+C / `token`
async fn run_until(duration: Option<Duration>, token: &CancellationToken) {
    match duration {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => {},
                _ = token.cancelled() => {},
            }
        },
        None => token.cancelled().await,
    }
}

fn print_payload(message: &Message, data: &[u8]) {
    println!(
        "{} {} [{}] {}",
        message.name.bold(),
        common::hex::format_id(message.frame_id, message.is_extended()).cyan(),
        data.len(),
        common::hex::encode_spaced(data)
    );
}

fn print_stats(name: &str, stats: &JobStats) {
    println!(
        "{}: {} ticks, {} sent, {} offline, {} encode failures, {} transmit failures",
        name.bold(),
        stats.ticks,
        stats.sent.to_string().green(),
        stats.offline,
        stats.encode_failures.to_string().red(),
        stats.transmit_failures.to_string().red()
    );
    if let Some(error) = &stats.last_error {
        println!("  last error: {}", error.red());
    }
}

fn describe_signal(signal: &Signal) -> String {
    let order = match signal.byte_order {
        ByteOrder::LittleEndian => "LE",
        ByteOrder::BigEndian => "BE",
    };
    let (lo, hi) = signal.physical_bounds();
    let mut text = format!(
        "{}|{}@{} x{} {:+} [{}..{}] {}",
        signal.start_bit, signal.bit_length, order, signal.scale, signal.offset, lo, hi, signal.unit
    );
    if !signal.enumeration.is_empty() {
        let labels: Vec<_> = signal
            .enumeration
            .iter()
            .map(|(raw, label)| format!("{}={}", raw, label))
            .collect();
        text.push_str(&format!(" {{{}}}", labels.join(", ")));
    }
    text
}

// ============================================================================
// Commands
// ============================================================================

pub async fn run(cli: Cli, config: CanBenchConfig) -> Result<()> {
    match cli.command {
        Commands::Inspect { dbc } => inspect(&load_db(&dbc)?),
        Commands::Encode {
            dbc,
            message,
            values,
            clamp,
        } => {
            let db = load_db(&dbc)?;
            let message = resolve_message(&db, &message)?;
            let values = parse_assignments(message, &values)?;
            let saturation = if clamp { Saturation::Clamp } else { Saturation::Error };
            let data = message.encode_with(&values, saturation)?;
            print_payload(message, &data);
            Ok(())
        },
        Commands::Decode { dbc, message, data } => {
            let db = load_db(&dbc)?;
            let message = resolve_message(&db, &message)?;
            let data = common::hex::decode(&data)?;
            for decoded in message.decode_labeled(&data)? {
                println!("  {}", decoded);
            }
            Ok(())
        },
        Commands::Send {
            dbc,
            message,
            values,
        } => {
            let db = load_db(&dbc)?;
            let message = resolve_message(&db, &message)?;
            let values = parse_assignments(message, &values)?;
            send(&config, message, &values)
        },
        Commands::Cyclic {
            dbc,
            message,
            values,
            period_ms,
            duration_s,
        } => {
            let db = load_db(&dbc)?;
            let message = resolve_message(&db, &message)?.clone();
            let values = parse_assignments(&message, &values)?;
            let period = period_ms
                .or(message.cycle_time.map(u64::from))
                .unwrap_or(config.cyclic.default_period_ms);
            cyclic(&config, &message, values, period, None, duration_arg(duration_s)?).await
        },
        Commands::Sweep {
            dbc,
            message,
            signal,
            start,
            end,
            step,
            period_ms,
            repeat,
        } => {
            let db = load_db(&dbc)?;
            let message = resolve_message(&db, &message)?.clone();
            let (lo, hi) = message.signal(&signal)?.physical_bounds();
            let mut plan = SweepPlan::new(signal, start.unwrap_or(lo), end.unwrap_or(hi), step);
            plan.repeat = repeat;
            cyclic(&config, &message, HashMap::new(), period_ms, Some(plan), None).await
        },
        Commands::Monitor { dbc, duration_s } => {
            let db = dbc.as_deref().map(load_db).transpose()?;
            monitor(&config, db, duration_arg(duration_s)?).await
        },
        Commands::Info => info_command(&config),
    }
}

fn inspect(db: &Database) -> Result<()> {
    if !db.version.is_empty() {
        println!("{} {}", "Version:".bright_cyan(), db.version);
    }
    if !db.nodes.is_empty() {
        println!("{} {}", "Nodes:".bright_cyan(), db.nodes.join(", "));
    }
    println!("{} {}", "Messages:".bright_cyan(), db.len());

    for message in db.messages() {
        let cycle = message
            .cycle_time
            .map(|ms| format!(" every {} ms", ms))
            .unwrap_or_default();
        println!(
            "\n{} {} [{}]{}{}",
            common::hex::format_id(message.frame_id, message.is_extended()).cyan(),
            message.name.bold(),
            message.byte_length,
            if message.is_fd() { " FD" } else { "" },
            cycle
        );
        if let Some(comment) = &message.comment {
            println!("  {}", comment.dimmed());
        }
        for signal in &message.signals {
            println!("  {:<24} {}", signal.name, describe_signal(signal));
        }
    }
    Ok(())
}

fn send(config: &CanBenchConfig, message: &Message, values: &HashMap<String, f64>) -> Result<()> {
    let data = message.encode_with(values, config.cyclic.saturation)?;
    let frame = CanFrame::for_message(message, data, false, config.channel.bit_rate_switch)?;
    let session = connect(config)?;

    let result = session.transmit(&frame);
    if let Some(entry) = session.log().latest() {
        let line = entry.to_string();
        match entry.outcome {
            TxOutcome::Ok => println!("{}", line.green()),
            TxOutcome::Failed { .. } => println!("{}", line.red()),
            TxOutcome::Offline => println!("{}", line.yellow()),
        }
    }
    session.close()?;

    match result? {
        Delivery::Sent => info!("Sent {}", message.name),
        Delivery::Offline => info!("Logged {} (offline)", message.name),
    }
    Ok(())
}

async fn cyclic(
    config: &CanBenchConfig,
    message: &Message,
    values: HashMap<String, f64>,
    period_ms: u64,
    sweep: Option<SweepPlan>,
    duration: Option<Duration>,
) -> Result<()> {
    if period_ms < config.cyclic.min_period_ms {
        bail!(
            "period {} ms is below the minimum of {} ms",
            period_ms,
            config.cyclic.min_period_ms
        );
    }

    let session = connect(config)?;
    let store = Arc::new(SignalValueStore::new());
    store.reset(message);
    store.set_many(&message.name, values);

    let token = common::shutdown::cancel_on_shutdown(CancellationToken::new());
    let scheduler = CyclicScheduler::new(session.clone(), store)
        .with_saturation(config.cyclic.saturation)
        .with_bit_rate_switch(config.channel.bit_rate_switch)
        .with_shutdown(token.clone());

    let period = Duration::from_millis(period_ms);
    let is_sweep = sweep.is_some();
    match sweep {
        Some(plan) => {
            println!(
                "Sweeping {}.{} from {} to {} by {} every {} ms",
                message.name, plan.signal, plan.start, plan.end, plan.step, period_ms
            );
            scheduler.start_sweep(message, period, plan)?;
        },
        None => {
            println!("Transmitting {} every {} ms (Ctrl+C to stop)", message.name, period_ms);
            scheduler.start(message, period)?;
        },
    }

    if is_sweep {
        tokio::select! {
            _ = scheduler.wait(&message.name) => {},
            _ = token.cancelled() => {},
        }
    } else {
        run_until(duration, &token).await;
    }

    let stats = scheduler
        .stats(&message.name)
        .ok_or_else(|| anyhow!("job for {} vanished", message.name))?;
    scheduler.shutdown().await;
    session.close()?;
    print_stats(&message.name, &stats);
    Ok(())
}

async fn monitor(
    config: &CanBenchConfig,
    db: Option<Database>,
    duration: Option<Duration>,
) -> Result<()> {
    let session = connect(config)?;
    let token = common::shutdown::cancel_on_shutdown(CancellationToken::new());
    let receiver = ReceiveMonitor::spawn(
        session.clone(),
        config.monitor.poll_interval(),
        config.monitor.buffer,
        token.clone(),
    )?;
    let mut frames = receiver.subscribe();

    let deadline = async {
        run_until(duration, &token).await;
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            received = frames.recv() => match received {
                Ok(frame) => {
                    println!("{}", frame.to_string().cyan());
                    if let Some(db) = &db {
                        match monitor::decode_frame(db, &frame) {
                            Some(Ok(signals)) => {
                                for signal in signals {
                                    println!("    {}", signal);
                                }
                            },
                            Some(Err(e)) => println!("    {}", e.to_string().red()),
                            None => {},
                        }
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Monitor output lagged, {} frames dropped", n);
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    receiver.shutdown().await;
    let stats = session.stats();
    session.close()?;
    println!("{} frames received", stats.rx);
    Ok(())
}

fn info_command(config: &CanBenchConfig) -> Result<()> {
    let session = connect(config)?;
    println!("{} {}", "Backend:".bright_cyan(), session.backend());
    println!("{} {}", "Model:".bright_cyan(), session.device_model());
    println!("{} {}", "State:".bright_cyan(), session.state());
    match session.device_info() {
        Some(info) => {
            println!("{} {}", "Type:".bright_cyan(), info.hardware_type);
            println!("{} {}", "Serial:".bright_cyan(), info.serial_number);
            println!("{} {}", "Hardware:".bright_cyan(), info.hardware_version);
            println!("{} {}", "Firmware:".bright_cyan(), info.firmware_version);
            println!("{} {}", "Driver:".bright_cyan(), info.driver_version);
            println!("{} {}", "Channels:".bright_cyan(), info.channel_count);
        },
        None if session.is_offline() => {},
        None => println!("{}", "Device information unavailable".yellow()),
    }
    session.close()?;
    Ok(())
}
