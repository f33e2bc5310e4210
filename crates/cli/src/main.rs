// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{bail, Context, Result};
use boardlink_config::BoardConfig;
use boardlink_core::loopback::LoopbackCore;
use boardlink_core::{Board, BoardError, EmulationCore, FlashImage, RunControl, RunOutcome};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info, warn};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

const MAX_FIRMWARE_FILES: usize = 1024;

/// SIGINT and SIGTERM stop the board, SIGHUP resets the core.
static RUN_CONTROL: RunControl = RunControl::new();

fn parse_u64_count(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex count '{}': {}", s, e))
    } else {
        u64::from_str(trimmed).map_err(|e| format!("Invalid count '{}': {}", s, e))
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "BoardLink emulated board host bridge",
    long_about = None
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Path to the board descriptor (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare program memory and load firmware without booting.
    Flash(FlashArgs),

    /// Load firmware, bridge every UART to a terminal and run the loopback core.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct FlashArgs {
    /// Programmable flash storage file (overrides the descriptor)
    #[arg(short = 'p', long)]
    pflash: Option<PathBuf>,

    /// Erase program memory before loading
    #[arg(short, long)]
    erase: bool,

    /// Intel HEX firmware file (repeatable, applied in order)
    #[arg(short = 'f', long = "firmware")]
    firmware: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    flash: FlashArgs,

    /// Stop after this many core steps (default: run until SIGINT/SIGTERM)
    #[arg(long, value_parser = parse_u64_count)]
    max_steps: Option<u64>,

    /// Print a JSON run report on stdout when the board stops
    #[arg(long)]
    json: bool,
}

/// Failure classes mapped onto exit codes.
#[derive(Debug)]
enum Failure {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

impl Failure {
    fn report(self) -> ExitCode {
        match self {
            Failure::Config(e) => {
                error!("{:#}", e);
                ExitCode::from(EXIT_CONFIG_ERROR)
            }
            Failure::Runtime(e) => {
                error!("{:#}", e);
                ExitCode::from(EXIT_RUNTIME_ERROR)
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::WARN,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Flash(args) => run_flash(cli.config, args),
        Commands::Run(args) => run_board(cli.config, args),
    };
    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(failure) => failure.report(),
    }
}

fn load_config(path: Option<PathBuf>, args: &FlashArgs) -> Result<BoardConfig> {
    let mut config = match path {
        Some(path) => BoardConfig::from_file(&path)?,
        None => BoardConfig::default(),
    };
    if let Some(pflash) = &args.pflash {
        config.flash.path = Some(pflash.clone());
    }
    if args.firmware.len() > MAX_FIRMWARE_FILES {
        bail!(
            "Unable to load more than {} firmware files",
            MAX_FIRMWARE_FILES
        );
    }
    config.validate()?;
    Ok(config)
}

/// Opens program memory and applies the requested erase and firmware files.
fn prepare_flash(config: &BoardConfig, args: &FlashArgs) -> Result<FlashImage> {
    let path = config.flash.resolve_path()?;
    let len = config.flash.size_bytes()?;
    println!("Programmable Flash Storage: {}", path.display());

    let mut flash = FlashImage::open_or_create(&path, len)?;
    if args.erase {
        info!("Erasing {} bytes of program memory", flash.len());
        flash.erase();
    }
    for file in &args.firmware {
        boardlink_loader::load(file, &mut flash)
            .with_context(|| format!("Failed to load {:?} into flash", file))?;
    }
    Ok(flash)
}

fn run_flash(config_path: Option<PathBuf>, args: FlashArgs) -> Result<(), Failure> {
    let config = load_config(config_path, &args).map_err(Failure::Config)?;
    let flash = prepare_flash(&config, &args).map_err(Failure::Runtime)?;

    match Board::check_boot_vector(&flash, config.boot_pc) {
        Ok(()) => info!("Boot vector {:#06x} is programmed", config.boot_pc),
        Err(e) => warn!("{}", e),
    }
    flash.close().map_err(|e| Failure::Runtime(e.into()))
}

fn run_board(config_path: Option<PathBuf>, args: RunArgs) -> Result<(), Failure> {
    let config = load_config(config_path, &args.flash).map_err(Failure::Config)?;
    let flash = prepare_flash(&config, &args.flash).map_err(Failure::Runtime)?;

    install_signal_handlers().map_err(Failure::Runtime)?;

    let mut board = Board::bring_up(&config, flash).map_err(|e| {
        let hint = matches!(e, BoardError::NoFirmware(_));
        let err = anyhow::Error::new(e).context("Unable to initialize requested board");
        if hint {
            error!("Try using '-f firmware.hex' to supply one");
        }
        Failure::Runtime(err)
    })?;

    for bridge in board.bridges() {
        match bridge.link_path() {
            Some(link) => println!("UART{} available at {}", bridge.channel(), link.display()),
            None => println!(
                "UART{} available at {}",
                bridge.channel(),
                bridge.secondary_path().display()
            ),
        }
    }

    let mut core = LoopbackCore::new();
    core.reset(board.boot_pc());
    info!("Starting board '{}'", board.name());

    let run_result = board.run(&mut core, args.max_steps, &RUN_CONTROL);
    let report = run_report(&board, &core, run_result.as_ref().ok().copied());

    // Tear down even when the run failed; the run error takes precedence.
    let shutdown_result = board.shutdown();
    let outcome = run_result.map_err(|e| Failure::Runtime(e.into()))?;
    shutdown_result.map_err(|e| Failure::Runtime(e.into()))?;

    info!("Board stopped: {:?}", outcome);
    if args.json {
        println!("{}", report);
    }
    match outcome {
        RunOutcome::Crashed => Err(Failure::Runtime(anyhow::anyhow!("Core crashed"))),
        _ => Ok(()),
    }
}

fn run_report(board: &Board, core: &LoopbackCore, outcome: Option<RunOutcome>) -> String {
    let channels: Vec<serde_json::Value> = board
        .bridges()
        .iter()
        .map(|bridge| {
            let stats = bridge.stats();
            serde_json::json!({
                "channel": bridge.channel().to_string(),
                "device": bridge.secondary_path(),
                "link": bridge.link_path(),
                "to_host": stats.to_host(),
                "from_host": stats.from_host(),
                "to_guest": stats.to_guest(),
                "dropped": stats.dropped(),
                "uart": board.uart(bridge.channel()).map(|u| u.snapshot()),
            })
        })
        .collect();
    serde_json::json!({
        "board": board.name(),
        "outcome": outcome.map(|o| format!("{:?}", o)),
        "steps": board.total_steps(),
        "echoed": core.echoed(),
        "channels": channels,
    })
    .to_string()
}

extern "C" fn on_signal(signal: libc::c_int) {
    if signal == libc::SIGHUP {
        RUN_CONTROL.request_reset();
    } else {
        RUN_CONTROL.request_stop();
    }
}

fn install_signal_handlers() -> Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for (signal, name) in [
        (libc::SIGHUP, "SIGHUP"),
        (libc::SIGINT, "SIGINT"),
        (libc::SIGTERM, "SIGTERM"),
    ] {
        if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to install {} handler", name));
        }
    }
    Ok(())
}
