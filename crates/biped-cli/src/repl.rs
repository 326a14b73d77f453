//! REPL – operator shell for a running control loop.
//!
//! Supported slash-commands:
//!   /status            – loop state, tick, last fault, IMU attitude
//!   /faults            – drain and print the fault log
//!   /stats             – tick timing and bus counters
//!   /telemetry         – one-second window: loop rate and joint tracking
//!   /reset             – leave SAFE_STOP and resume RUNNING
//!   /teleop <id> <rad> – send a position target (`--policy teleop` only)
//!   /json              – dump the latest status snapshot as JSON
//!   /help              – show this list
//!   /quit | /exit      – request shutdown and exit

use std::sync::{Arc, Mutex};

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use biped_kernel::FaultLog;
use biped_runtime::{LoopControl, LoopMonitor, LoopState, TeleopSender, TelemetryWindow};
use biped_types::{JointCommand, JointId};

/// Handles the REPL needs into the loop running on another thread.
pub struct Session {
    pub control: LoopControl,
    pub monitor: LoopMonitor,
    pub faults: FaultLog,
    pub window: Arc<Mutex<TelemetryWindow>>,
    pub teleop: Option<TeleopSender>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Faults,
    Stats,
    Telemetry,
    Reset,
    Teleop { joint: JointId, target_rad: f32 },
    Json,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let head = words.next().unwrap_or_default();
        let cmd = match head {
            "/status" => Command::Status,
            "/faults" => Command::Faults,
            "/stats" => Command::Stats,
            "/telemetry" => Command::Telemetry,
            "/reset" => Command::Reset,
            "/json" => Command::Json,
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            "/teleop" => {
                let usage = || "usage: /teleop <joint id> <target rad>".to_string();
                let joint = words
                    .next()
                    .and_then(|w| w.parse::<JointId>().ok())
                    .ok_or_else(usage)?;
                let target_rad = words
                    .next()
                    .and_then(|w| w.parse::<f32>().ok())
                    .filter(|v| v.is_finite())
                    .ok_or_else(usage)?;
                Command::Teleop { joint, target_rad }
            }
            other => return Err(format!("unknown command '{other}'")),
        };
        if words.next().is_some() {
            return Err(format!("'{head}' takes no further arguments"));
        }
        Ok(cmd)
    }
}

/// Run until `/quit`, Ctrl-C/Ctrl-D at the prompt, or the loop terminating.
pub fn run(session: &Session) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };

    loop {
        if session.monitor.status().state.is_terminated() {
            println!("{}", "Control loop has terminated.".yellow());
            break;
        }

        let line = match editor.readline("biped> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match Command::parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(cmd) => dispatch(session, cmd),
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e.yellow(),
                "/help".bold()
            ),
        }
    }
}

fn dispatch(session: &Session, cmd: Command) {
    match cmd {
        Command::Status => cmd_status(session),
        Command::Faults => cmd_faults(session),
        Command::Stats => cmd_stats(session),
        Command::Telemetry => cmd_telemetry(session),
        Command::Reset => cmd_reset(session),
        Command::Teleop { joint, target_rad } => cmd_teleop(session, joint, target_rad),
        Command::Json => cmd_json(session),
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "biped Commands".bold().underline());
    println!("  {}           – loop state and latest fault", "/status".bold().cyan());
    println!("  {}           – drain the fault log", "/faults".bold().cyan());
    println!("  {}            – tick timing and bus counters", "/stats".bold().cyan());
    println!("  {}        – 1 s window: rate and tracking", "/telemetry".bold().cyan());
    println!("  {}            – resume from SAFE_STOP", "/reset".bold().cyan());
    println!("  {} – send a position target", "/teleop <id> <rad>".bold().cyan());
    println!("  {}             – status snapshot as JSON", "/json".bold().cyan());
    println!("  {}      – stop the loop and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn paint_state(state: LoopState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        LoopState::Running => text.green().bold(),
        LoopState::Init => text.cyan().bold(),
        LoopState::SafeStop => text.yellow().bold(),
        LoopState::Terminated(_) => text.red().bold(),
    }
}

fn cmd_status(session: &Session) {
    let status = session.monitor.status();
    println!();
    println!("{}", "Loop Status".bold().underline());
    println!("  State  : {}", paint_state(status.state));
    println!("  Tick   : {}", status.tick);
    println!("  Policy : {}", status.policy.yellow());
    if let Some(robot) = &status.robot {
        let (roll, pitch, yaw) = robot.imu.orientation.to_euler();
        println!(
            "  Attitude (deg) : roll {:+.1}  pitch {:+.1}  yaw {:+.1}",
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        );
        let stale: Vec<String> = robot
            .joints
            .iter()
            .filter(|j| j.stale)
            .map(|j| j.id.to_string())
            .collect();
        if !stale.is_empty() {
            println!("  Stale joints   : {}", stale.join(", ").yellow());
        }
    }
    match &status.last_fault {
        Some(fault) => println!("  Last fault : {}", fault.to_string().red()),
        None => println!("  Last fault : {}", "none".dimmed()),
    }
    println!();
}

fn cmd_faults(session: &Session) {
    let records = session.faults.drain();
    println!();
    println!(
        "{} ({} total, {} overwritten)",
        "Fault Log".bold().underline(),
        session.faults.total(),
        session.faults.overwritten()
    );
    if records.is_empty() {
        println!("  {}", "no new faults".dimmed());
    }
    for record in &records {
        let line = record.to_string();
        if record.fatal {
            println!("  {}", line.red());
        } else {
            println!("  {}", line.yellow());
        }
    }
    println!();
}

fn cmd_stats(session: &Session) {
    let status = session.monitor.status();
    let s = &status.stats;
    println!();
    println!("{}", "Tick Statistics".bold().underline());
    println!("  Ticks       : {}", s.ticks);
    println!("  Overruns    : {}", s.overruns);
    println!(
        "  Duration ms : min {:.3}  mean {:.3}  max {:.3}",
        s.min_ms, s.mean_ms, s.max_ms
    );
    println!("  Achieved Hz : {:.1}", s.achieved_hz);
    println!("  Bus retries : {}", status.bus_retries);
    println!("  Bus timeouts: {}", status.bus_timeouts);
    println!();
}

fn cmd_telemetry(session: &Session) {
    let summary = match session.window.lock() {
        Ok(window) => window.summary(),
        Err(_) => {
            println!("{}", "Telemetry window unavailable.".red());
            return;
        }
    };
    println!();
    println!("{}", "Telemetry (last second)".bold().underline());
    println!(
        "  Samples {}  span {:.3} s  rate {:.1} Hz  (min {:.1} Hz)",
        summary.samples, summary.span_s, summary.frequency_hz, summary.min_frequency_hz
    );
    println!(
        "  {:>5} {:>9} {:>9} {:>9} {:>10} {:>10}",
        "joint", "pos", "target", "vel", "max err", "rms err"
    );
    for j in &summary.joints {
        let target = j
            .desired_rad
            .map(|d| format!("{d:+.3}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:>5} {:>+9.3} {:>9} {:>+9.3} {:>10.4} {:>10.4}",
            j.id,
            j.position_rad,
            target,
            j.velocity_rad_s,
            j.max_tracking_error_rad,
            j.rms_tracking_error_rad
        );
    }
    println!();
}

fn cmd_reset(session: &Session) {
    let state = session.monitor.status().state;
    if state != LoopState::SafeStop {
        println!(
            "{} reset is only valid in SAFE_STOP (currently {})",
            "✗".red(),
            paint_state(state)
        );
        return;
    }
    session.control.request_reset();
    println!("{}", "  ✓ Reset requested; takes effect next tick.".green());
}

fn cmd_teleop(session: &Session, joint: JointId, target_rad: f32) {
    let Some(sender) = &session.teleop else {
        println!("{}", "Teleop is only available with --policy teleop.".yellow());
        return;
    };
    if sender.send(vec![JointCommand::position(joint, target_rad)]) {
        println!("  {} joint {} → {:+.3} rad", "✓".green(), joint, target_rad);
    } else {
        println!("{}", "Teleop queue full or loop gone; target dropped.".red());
    }
}

fn cmd_json(session: &Session) {
    match serde_json::to_string_pretty(session.monitor.status().as_ref()) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{}: {}", "Serialize error".red(), e),
    }
}
