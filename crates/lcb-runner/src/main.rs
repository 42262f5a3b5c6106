//! # lcbsim
//!
//! Runs OpenLCB CAN scenarios on a virtual bus.
//!
//! ```bash
//! # Run a scenario for its own duration and print the bus trace
//! lcbsim run scenarios/lookup.yaml
//!
//! # Stop after 500 ms of simulated time, report as JSON
//! lcbsim run scenarios/lookup.yaml --until-ms 500 --json
//!
//! # Check a scenario file without running it
//! lcbsim check scenarios/lookup.yaml
//!
//! # Explain GridConnect frames
//! lcbsim decode ":X1070133AN02010D000004;" ":X19488210N022A;"
//! ```
//!
//! Logging goes to stderr and follows `RUST_LOG` when set, `--log-level`
//! otherwise.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lcb_can::{CanFrame, FrameKind};
use lcb_runner::{load_scenario, run_scenario, RunnerError, RunnerResult};
use tracing_subscriber::EnvFilter;

/// Virtual CAN bus for the OpenLCB CAN stack.
#[derive(Parser, Debug)]
#[command(name = "lcbsim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario and print the frame trace and write outcomes
    Run {
        /// Scenario YAML file
        scenario: PathBuf,

        /// Simulated milliseconds to run (default: the scenario's duration)
        #[arg(long)]
        until_ms: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a scenario file without running it
    Check {
        /// Scenario YAML file
        scenario: PathBuf,
    },

    /// Decode GridConnect frames
    Decode {
        /// Frames such as ":X195B422AN0102030405060708;"
        #[arg(required = true)]
        frames: Vec<String>,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn describe(frame: &CanFrame) -> String {
    match frame.kind() {
        None => "standard frame".to_string(),
        Some(FrameKind::CheckId { seq, segment }) => {
            format!("CID{seq} segment {segment:03X} from alias {}", frame.source())
        }
        Some(FrameKind::Control(control)) => format!("{control:?} from alias {}", frame.source()),
        Some(FrameKind::Message { frame_type, mti }) => {
            format!("message type {frame_type} MTI {mti} from alias {}", frame.source())
        }
    }
}

fn run(cli: Cli) -> RunnerResult<()> {
    match cli.command {
        Commands::Run {
            scenario,
            until_ms,
            json,
        } => {
            let scenario = load_scenario(&scenario)?;
            let report = run_scenario(&scenario, until_ms.map(Duration::from_millis))?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{report}");
            }
        }
        Commands::Check { scenario } => {
            let path = scenario.display().to_string();
            let scenario = load_scenario(&scenario)?;
            let schedule = scenario.schedule()?;
            println!(
                "{path}: {} interfaces, {} events, {} ms",
                scenario.interfaces.len(),
                schedule.len(),
                scenario.duration_ms
            );
        }
        Commands::Decode { frames } => {
            for text in frames {
                let frame: CanFrame = text.parse().map_err(RunnerError::Frame)?;
                println!("{frame}  {}  data={}", describe(&frame), hex::encode_upper(frame.data()));
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    lcb_metrics::describe_metrics();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
