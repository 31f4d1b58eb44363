use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use flexbridge_lib::bridge::session::StdDelay;
use flexbridge_lib::bridge::BridgeSession;
use flexbridge_lib::config::BridgeConfig;
use flexbridge_lib::mock::SimulatedBusPirate;
use flexbridge_lib::programs::Program;
use flexbridge_lib::runner;
use flexbridge_lib::serial::SerialInterface;

/// Drive a flex peripheral through a Bus Pirate's binary I2C mode
#[derive(Parser, Debug)]
#[command(name = "flexbridge", version, long_about = None)]
struct Args {
    /// Serial port of the adapter
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// 8-bit peripheral address, decimal or 0x-prefixed hex
    #[arg(short, long, global = true, value_parser = parse_address)]
    address: Option<u8>,

    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log negotiation, register access and command polling
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Log every byte exchanged with the adapter
    #[arg(long, global = true, default_value_t = false)]
    raw: bool,

    /// Run against the built-in firmware simulator instead of a serial port
    #[arg(long, global = true, default_value_t = false)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Print the peripheral's device info
    Info,
    /// Poll the keypad page and log every sample
    Keypad {
        /// Stop after this many samples
        #[arg(long)]
        count: Option<usize>,
    },
    /// Ramp the LED strip through its color channels
    LedSweep {
        /// Stop after this many frames
        #[arg(long)]
        count: Option<usize>,
    },
    /// Flood the LED page with writes
    Traffic {
        /// Stop after this many writes
        #[arg(long)]
        count: Option<usize>,
    },
    /// List USB serial ports
    Ports,
}

impl Command {
    fn program(self) -> Option<(Program, Option<usize>)> {
        match self {
            Command::Keypad { count } => Some((Program::Keypad, count)),
            Command::LedSweep { count } => Some((Program::LedSweep, count)),
            Command::Traffic { count } => Some((Program::Traffic, count)),
            Command::Info | Command::Ports => None,
        }
    }
}

fn parse_address(value: &str) -> Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", value, e))
}

fn build_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(address) = args.address {
        config.device_address = address;
    }
    config.log.show_debug |= args.verbose;
    config.log.show_raw |= args.raw;

    config.validate()?;
    Ok(config)
}

fn list_ports() -> anyhow::Result<()> {
    let ports = SerialInterface::discover_ports().context("Listing serial ports")?;
    if ports.is_empty() {
        info!("No USB serial ports found");
    }
    for port in ports {
        println!(
            "{}  {:04X}:{:04X}  {}",
            port.port_name,
            port.vid,
            port.pid,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run(config: &BridgeConfig, simulate: bool, command: Command, stop: &AtomicBool) -> anyhow::Result<()> {
    let opened = if simulate {
        info!("Using the firmware simulator");
        let link = SerialInterface::from_io(&config.port, Box::new(SimulatedBusPirate::new()), config.log);
        BridgeSession::connect(link, Box::new(StdDelay), config)
    } else {
        BridgeSession::open(config)
    };

    runner::run_with_session(opened, config, |device| {
        match command.program() {
            Some((program, limit)) => {
                let done = program.run(device, stop, limit)?;
                info!("{:?} finished after {} iterations", program, done);
            }
            None => {
                let device_info = device.device_info()?;
                println!("{}", serde_json::to_string_pretty(&device_info)?);
            }
        }
        Ok(())
    })
}

/// Logger filter: `--verbose` wins, then `RUST_LOG`, then `info`.
fn log_filter(verbose: bool, rust_log: Option<String>) -> String {
    match rust_log {
        _ if verbose => "debug".to_string(),
        Some(filter) if !filter.trim().is_empty() => filter,
        _ => "info".to_string(),
    }
}

fn exit_with(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&log_filter(args.verbose, std::env::var("RUST_LOG").ok()))
        .init();

    if let Command::Ports = args.command {
        return exit_with(list_ports());
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => return exit_with(Err(e)),
    };
    let stop = Arc::new(AtomicBool::new(false));

    // The bridge is blocking I/O; keep it off the runtime so Ctrl-C still lands.
    let worker_stop = stop.clone();
    let simulate = args.simulate;
    let command = args.command;
    let mut worker =
        tokio::task::spawn_blocking(move || run(&config, simulate, command, &worker_stop));

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received...");
            stop.store(true, Ordering::Relaxed);
            worker.await
        }
    };

    match joined {
        Ok(Ok(())) => ExitCode::SUCCESS,
        // The runner has already logged it.
        Ok(Err(_)) => ExitCode::FAILURE,
        Err(e) => exit_with(Err(e.into())),
    }
}
