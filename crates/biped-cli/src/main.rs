//! `biped` – command-line entry point for the biped control stack.
//!
//! This binary:
//!
//! 1. Resolves the robot configuration (`~/.biped/config.toml`, `BIPED_*`
//!    env overrides, then flags).
//! 2. Opens the servo bus (simulated chain or a serial port), optionally behind
//!    a dedicated I/O thread.
//! 3. Builds the selected policy and starts the control loop on its own
//!    thread.
//! 4. Drops the operator into an **interactive REPL** (`/status`, `/faults`,
//!    `/reset`, …), or in `--headless` mode simply waits for the loop.
//! 5. Intercepts **Ctrl-C** and requests a shutdown, which passes through
//!    SAFE_STOP before the loop terminates.

mod config;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::{Parser, ValueEnum};
use colored::Colorize;
use tracing::{error, info, warn};

use biped_hal::{
    BusLink, BusTransport, BusWorker, ImuSource, ServoBus, ServoRegistry, SimBus, SimImu,
    TransportConfig,
};
use biped_kernel::FaultLog;
use biped_runtime::{
    ControlLoop, LearnedPolicy, LoopControl, MonotonicClock, Policy, ScriptedGait, TeleopRelay,
    TeleopSender, TelemetryWindow, TerminationReason, init_tracing,
};
use biped_types::{BipedError, RobotConfig, policy_io_schema};

/// Telemetry samples buffered between the loop and the window thread.
const TELEMETRY_QUEUE: usize = 256;
/// Pending teleop batches; the relay only ever acts on the newest.
const TELEOP_QUEUE: usize = 8;
/// Requests buffered ahead of the bus I/O thread.
const BUS_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process simulated servo chain and IMU.
    Sim,
    /// Half-duplex serial adapter (build with `--features serial`).
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyKind {
    /// Open-loop sinusoidal gait.
    Scripted,
    /// MLP loaded from a JSON artifact (`--model`).
    Learned,
    /// Joint targets typed at the REPL.
    Teleop,
}

#[derive(Parser, Debug)]
#[command(name = "biped", version, about = "Real-time control loop for a servo-driven biped")]
struct Args {
    /// Config file (defaults to ~/.biped/config.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,

    /// Serial device, overriding `bus.serial_port`.
    #[arg(long)]
    port: Option<String>,

    /// Feed the loop a simulated upright IMU.  Required with `--backend serial`,
    /// which has no IMU driver.
    #[arg(long)]
    sim_imu: bool,

    #[arg(long, value_enum, default_value_t = PolicyKind::Scripted)]
    policy: PolicyKind,

    /// Policy artifact for `--policy learned`.
    #[arg(long, required_if_eq("policy", "learned"))]
    model: Option<PathBuf>,

    /// Scripted gait steps per second.
    #[arg(long, default_value_t = 1.0)]
    gait_hz: f32,

    /// Scripted gait swing scale; 0 stands still.
    #[arg(long, default_value_t = 1.0)]
    gait_scale: f32,

    /// Run bus transactions on a dedicated I/O thread.
    #[arg(long)]
    io_worker: bool,

    /// No REPL; run until Ctrl-C or a terminal state.
    #[arg(long)]
    headless: bool,

    /// Print the policy observation/action schema as JSON and exit.
    #[arg(long)]
    print_schema: bool,

    /// Write the built-in defaults to ~/.biped/config.toml and exit.
    #[arg(long)]
    write_default_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_schema {
        return match serde_json::to_string_pretty(&policy_io_schema()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Schema error".red(), e);
                ExitCode::FAILURE
            }
        };
    }
    if args.write_default_config {
        return match config::save(&RobotConfig::default()) {
            Ok(path) => {
                println!(
                    "  {} Config saved to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    let _tracing = init_tracing("biped");
    print_banner();

    match run(args) {
        Ok(TerminationReason::Shutdown) => {
            println!("{}", "  ✓ Control loop terminated cleanly.".green());
            ExitCode::SUCCESS
        }
        Ok(reason) => {
            println!("{} {:?}", "  ✗ Control loop terminated:".red().bold(), reason);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "biped exited with an error");
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<TerminationReason, BipedError> {
    let mut cfg = config::resolve(args.config.as_deref()).map_err(BipedError::Config)?;
    if let Some(port) = &args.port {
        cfg.bus.serial_port = port.clone();
    }
    let registry = ServoRegistry::load(cfg.joints.clone())?;
    let imu = open_imu(&args)?;
    info!(joints = registry.len(), period_ms = cfg.timing.tick_period_ms, "configuration resolved");

    // ── Bus ───────────────────────────────────────────────────────────────
    let link = open_link(args.backend, &cfg, &registry)?;
    let transport = BusTransport::new(link, TransportConfig::new(&cfg.bus, cfg.timing.tick_period()));
    let (worker, bus): (Option<BusWorker>, Box<dyn ServoBus>) = if args.io_worker {
        let (worker, handle) = BusWorker::spawn(transport, BUS_QUEUE, cfg.timing.tick_period())?;
        (Some(worker), Box::new(handle))
    } else {
        (None, Box::new(transport))
    };

    // ── Policy ────────────────────────────────────────────────────────────
    let (policy, teleop) = build_policy(&args, &cfg, &registry)?;

    // ── Telemetry window ──────────────────────────────────────────────────
    let (telemetry_tx, telemetry_rx) = crossbeam_channel::bounded(TELEMETRY_QUEUE);
    let window = Arc::new(Mutex::new(TelemetryWindow::default()));
    let window_writer = Arc::clone(&window);
    let telemetry = thread::Builder::new()
        .name("biped-telemetry".into())
        .spawn(move || {
            // Ends once the loop drops its sender.
            while let Ok(sample) = telemetry_rx.recv() {
                if let Ok(mut w) = window_writer.lock() {
                    w.push(sample);
                }
            }
        })
        .map_err(|e| BipedError::Io(format!("failed to spawn telemetry thread: {e}")))?;

    // ── Control loop ──────────────────────────────────────────────────────
    let mut control_loop = ControlLoop::new(
        cfg,
        registry,
        bus,
        imu,
        policy,
        Arc::new(MonotonicClock::new()),
    )?
    .with_telemetry(telemetry_tx);

    let control = control_loop.control();
    let session = repl::Session {
        control: control.clone(),
        monitor: control_loop.monitor(),
        faults: control_loop.fault_log(),
        window,
        teleop,
    };
    install_ctrlc(control.clone());

    let handle = thread::Builder::new()
        .name("biped-control".into())
        .spawn(move || control_loop.run())
        .map_err(|e| BipedError::Io(format!("failed to spawn control thread: {e}")))?;

    if args.headless {
        println!("  Running headless.  Press {} to stop.\n", "Ctrl-C".bold());
    } else {
        println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
        repl::run(&session);
        control.request_shutdown();
    }

    let outcome = handle
        .join()
        .map_err(|_| BipedError::Io("control thread panicked".into()))?;
    if let Some(worker) = worker {
        worker.shutdown();
    }
    let _ = telemetry.join();
    report_unread_faults(&session.faults);
    outcome
}

fn open_link(
    backend: Backend,
    cfg: &RobotConfig,
    registry: &ServoRegistry,
) -> Result<Box<dyn BusLink>, BipedError> {
    match backend {
        Backend::Sim => {
            let sim = SimBus::for_registry(registry);
            Ok(Box::new(if cfg.bus.echo_suppression { sim.with_echo() } else { sim }))
        }
        Backend::Serial => open_serial(cfg),
    }
}

/// Only the simulated IMU exists; on real hardware it must be asked for.
fn open_imu(args: &Args) -> Result<Box<dyn ImuSource>, BipedError> {
    match (args.backend, args.sim_imu) {
        (Backend::Serial, false) => Err(BipedError::Config(
            "no IMU driver for the serial backend; pass --sim-imu to run with a simulated upright IMU"
                .into(),
        )),
        (Backend::Serial, true) => {
            warn!("serial backend with a simulated upright IMU; balance feedback is fake");
            Ok(Box::new(SimImu::upright()))
        }
        (Backend::Sim, _) => Ok(Box::new(SimImu::upright())),
    }
}

#[cfg(feature = "serial")]
fn open_serial(cfg: &RobotConfig) -> Result<Box<dyn BusLink>, BipedError> {
    info!(port = %cfg.bus.serial_port, baud = cfg.bus.baud_rate, "opening serial bus");
    Ok(Box::new(biped_hal::SerialLink::open(&cfg.bus.serial_port, cfg.bus.baud_rate)?))
}

#[cfg(not(feature = "serial"))]
fn open_serial(_cfg: &RobotConfig) -> Result<Box<dyn BusLink>, BipedError> {
    Err(BipedError::Config(
        "serial backend not compiled in; rebuild with `--features serial`".into(),
    ))
}

fn build_policy(
    args: &Args,
    cfg: &RobotConfig,
    registry: &ServoRegistry,
) -> Result<(Box<dyn Policy>, Option<TeleopSender>), BipedError> {
    Ok(match args.policy {
        PolicyKind::Scripted => {
            if !(args.gait_hz.is_finite() && args.gait_hz > 0.0) {
                return Err(BipedError::Config(format!(
                    "--gait-hz must be positive, got {}",
                    args.gait_hz
                )));
            }
            if !(args.gait_scale.is_finite() && args.gait_scale >= 0.0) {
                return Err(BipedError::Config(format!(
                    "--gait-scale must be non-negative, got {}",
                    args.gait_scale
                )));
            }
            let gait = ScriptedGait::new(registry.specs(), cfg.timing.tick_period())
                .with_frequency(args.gait_hz)
                .with_amplitude_scale(args.gait_scale);
            (Box::new(gait), None)
        }
        PolicyKind::Learned => {
            let path = args
                .model
                .as_ref()
                .ok_or_else(|| BipedError::Config("--policy learned needs --model".into()))?;
            (Box::new(LearnedPolicy::load(path, registry.specs())?), None)
        }
        PolicyKind::Teleop => {
            let (relay, sender) = TeleopRelay::channel(TELEOP_QUEUE);
            (Box::new(relay), Some(sender))
        }
    })
}

fn install_ctrlc(control: LoopControl) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – entering safe stop …".yellow().bold());
        control.request_shutdown();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; use /quit to stop");
    }
}

fn report_unread_faults(faults: &FaultLog) {
    let pending = faults.drain();
    if pending.is_empty() {
        return;
    }
    println!("{}", "Unread faults".bold().underline());
    for record in &pending {
        let line = record.to_string();
        if record.fatal {
            println!("  {}", line.red());
        } else {
            println!("  {}", line.yellow());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __   _             __"#.bold().cyan());
    println!("{}", r#"  / /  (_)__  ___ ___/ /"#.bold().cyan());
    println!("{}", r#" / _ \/ / _ \/ -_) _  / "#.bold().cyan());
    println!("{}", r#"/_.__/_/ .__/\__/\_,_/  "#.bold().cyan());
    println!("{}", r#"      /_/               "#.bold().cyan());
    println!(
        "  {} {}",
        "biped".bold(),
        env!("CARGO_PKG_VERSION").dimmed()
    );
    println!();
}
