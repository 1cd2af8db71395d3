use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use haptic_trials::logging::init_rust_logging;
use haptic_trials::{
    ControllerEvent, ExperimentConfig, ExperimentController, PortBackend, SerialChannel, Stimulus,
    SystemPorts,
};

/// Host frame interval for the interactive session.
const FRAME: Duration = Duration::from_millis(16);

#[derive(Parser, Debug)]
#[command(name = "haptic-trials", version, about = "Run haptic timing trials")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the serial ports the OS exposes
    Ports,
    /// Find the actuator and send it one command line (e.g. "255 0")
    Send {
        message: String,
        /// Port to try before enumerating
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Run a session driven by commands on stdin
    ///
    /// Commands: start, move <value>, contact <tag>, next, send <message>,
    /// subject <id>, reset, quit
    Run {
        /// JSON experiment config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the subject id from the config
        #[arg(short, long)]
        subject: Option<String>,
    },
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Ports => {
            let ports = SystemPorts
                .list_candidate_ports()
                .context("Failed to enumerate serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{port}");
            }
            Ok(())
        }
        Command::Send { message, port } => {
            let mut channel = SerialChannel::system(port);
            if !channel.send(&message) {
                anyhow::bail!("No serial device accepted the handshake");
            }
            println!("Sent {:?} on {}", message, channel.port_name().unwrap_or("?"));
            Ok(())
        }
        Command::Run { config, subject } => {
            let mut config = match config {
                Some(path) => ExperimentConfig::load(path)?,
                None => ExperimentConfig::default(),
            };
            if let Some(subject) = subject {
                config.subject_id = subject;
            }
            session(&config)
        }
    }
}

enum Line {
    Stimulus(Stimulus),
    Subject(String),
    Reset,
    Quit,
}

fn parse_line(line: &str) -> Option<Line> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "start" => Some(Line::Stimulus(Stimulus::StartTrial)),
        "move" => rest
            .parse::<f64>()
            .ok()
            .map(|v| Line::Stimulus(Stimulus::SliderMoved(v))),
        "contact" if !rest.is_empty() => Some(Line::Stimulus(Stimulus::Contact(rest.into()))),
        "next" => Some(Line::Stimulus(Stimulus::ManualTrigger)),
        "send" if !rest.is_empty() => Some(Line::Stimulus(Stimulus::Toggle(rest.into()))),
        "subject" if !rest.is_empty() => Some(Line::Subject(rest.into())),
        "reset" => Some(Line::Reset),
        "quit" | "exit" => Some(Line::Quit),
        _ => None,
    }
}

fn session(config: &ExperimentConfig) -> Result<()> {
    let mut controller =
        ExperimentController::from_config(config).context("Failed to set up experiment")?;

    // stdin blocks, so it gets its own thread; the frame loop below never waits
    // longer than one frame.
    let (tx, rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to start input thread")?;

    info!("session started: subject={}", controller.subject_id());
    loop {
        match rx.recv_timeout(FRAME) {
            Ok(text) => match parse_line(&text) {
                Some(Line::Stimulus(stimulus)) => print_events(controller.handle(stimulus)),
                Some(Line::Subject(id)) => controller.set_subject_id(id),
                Some(Line::Reset) => controller.reset_block(),
                Some(Line::Quit) => break,
                None => warn!("unrecognised command: {:?}", text),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        print_events(controller.tick());
    }

    info!(
        "session finished: {} trial(s) recorded",
        controller.timing().total_recorded()
    );
    Ok(())
}

// A lost record is reported and the session goes on; the trial has ended.
fn print_events(result: haptic_trials::Result<Vec<ControllerEvent>>) {
    match result {
        Ok(events) => {
            for event in events {
                println!("{event}");
            }
        }
        Err(e) => error!("trial record not saved: {e}"),
    }
}
