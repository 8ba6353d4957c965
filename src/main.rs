//! CLI entry point for the fluidic rig.
//!
//! Runs one experiment from the command line and prints its rows:
//!
//! ```bash
//! fluidic_rig run --program flush.txt
//! fluidic_rig sweep --start -2 --end 2 --step 0.5 --limit 0.01
//! fluidic_rig write --program targets.txt --jump 0.2
//! fluidic_rig config > config/rig.toml
//! ```
//!
//! Devices without a configured port, or that fail to answer, run in
//! simulation. Ctrl+C stops the run and closes the data file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fluidic_rig::config::{RigConfig, DEFAULT_CONFIG_PATH};
use fluidic_rig::experiment::{
    parse_program, parse_write_program, EngineEvent, ExperimentEngine, SweepSpec, WriteSettings,
};
use fluidic_rig::hardware::HardwareFacade;
use fluidic_rig::limits::{DEFAULT_JUMP_SIZE, DEFAULT_SAMPLE_RATE};
use fluidic_rig::logging;
use fluidic_rig::recorder::{Recorder, SessionMetadata};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "fluidic_rig")]
#[command(about = "Fluidic rig experiment runner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Simulate the pump and SMU regardless of configuration
    #[arg(long, global = true)]
    simulate: bool,

    /// Session name, used as the data file prefix
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a step program (`step N: flow=..., duration=...`)
    Run {
        /// Program file
        #[arg(long)]
        program: PathBuf,
    },

    /// Run a linear I-V sweep
    Sweep {
        /// First voltage (V)
        #[arg(long, allow_hyphen_values = true)]
        start: f64,
        /// Last voltage (V)
        #[arg(long, allow_hyphen_values = true)]
        end: f64,
        /// Step magnitude (V)
        #[arg(long)]
        step: f64,
        /// Current compliance (A); defaults to the configured limit
        #[arg(long)]
        limit: Option<f64>,
    },

    /// Run a voltage write program (`label: voltage=X`)
    Write {
        /// Program file
        #[arg(long)]
        program: PathBuf,
        /// Current compliance (A); defaults to the configured limit
        #[arg(long)]
        limit: Option<f64>,
        /// Largest voltage change per jump (V)
        #[arg(long, default_value_t = DEFAULT_JUMP_SIZE)]
        jump: f64,
        /// Measurements per second
        #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
        rate: f64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if cli.simulate {
        config.pump.simulate = true;
        config.smu.simulate = true;
    }
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    if matches!(cli.command, Commands::Config) {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, "Starting");

    let facade = Arc::new(HardwareFacade::from_config(&config).context("building hardware")?);
    let report = facade.connect_all().await;
    println!("Hardware:");
    for result in &report.results {
        println!("  {:<20} {:<12} {}", result.device, result.state, result.detail);
    }
    if !config.smu.simulate && config.smu.resource.trim().is_empty() && !config.smu.candidates.is_empty() {
        match facade.autodetect_smu(&config.smu.candidates).await {
            Some(resource) => println!("  SMU found at {resource}"),
            None => println!("  No SMU answered, simulating"),
        }
    }

    let recorder = Recorder::new(config.recorder_settings().map_err(anyhow::Error::msg)?);
    let (engine, mut events) = ExperimentEngine::new(
        facade.clone(),
        config.safety_thresholds(),
        recorder,
        config.engine_settings(),
    );
    if let Some(name) = cli.name {
        engine.set_session_metadata(SessionMetadata::named(name));
    }

    let default_limit = config.smu.default_current_limit;
    match cli.command {
        Commands::Run { program } => {
            let text = tokio::fs::read_to_string(&program)
                .await
                .with_context(|| format!("reading {}", program.display()))?;
            let parsed = parse_program(&text).context("parsing program")?;
            for warning in &parsed.warnings {
                eprintln!("warning: {warning}");
            }
            engine.start(parsed.program)?;
        }
        Commands::Sweep {
            start,
            end,
            step,
            limit,
        } => {
            engine.run_iv_sweep(SweepSpec {
                start,
                end,
                step,
                current_limit: limit.unwrap_or(default_limit),
            })?;
        }
        Commands::Write {
            program,
            limit,
            jump,
            rate,
        } => {
            let text = tokio::fs::read_to_string(&program)
                .await
                .with_context(|| format!("reading {}", program.display()))?;
            let targets = parse_write_program(&text).context("parsing write program")?;
            engine.run_iv_write_program(
                targets,
                WriteSettings {
                    current_limit: limit.unwrap_or(default_limit),
                    jump_size: jump,
                    sample_rate: rate,
                },
            )?;
        }
        Commands::Config => return Ok(()),
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let status = loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            status = engine.wait() => {
                while let Ok(event) = events.try_recv() {
                    print_event(&event);
                }
                break status;
            }
            _ = &mut ctrl_c => {
                println!("Interrupted, finishing session");
                if let Err(e) = engine.finish().await {
                    eprintln!("finish: {e}");
                }
                while let Ok(event) = events.try_recv() {
                    print_event(&event);
                }
                break engine.status();
            }
        }
    };

    facade.disconnect_all().await;
    if let Some(path) = &status.session_path {
        println!("Data: {}", path.display());
    }
    let dropped = engine.dropped_events();
    if dropped > 0 {
        println!("({dropped} events dropped)");
    }
    match status.last_reason {
        Some(reason) if reason.is_abort() => bail!("run aborted: {reason}"),
        Some(reason) => {
            println!("Done: {reason}");
            Ok(())
        }
        None => Ok(()),
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"))
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::RecordAppended(r) => println!(
            "{:>5} t={:>8.2}s {:<14} flow={:.2}/{} P={} T={} L={} V={} I={}",
            r.measurement_id,
            r.elapsed,
            r.step_label,
            r.flow_setpoint,
            fmt_opt(r.pump_flow),
            fmt_opt(r.pressure),
            fmt_opt(r.temperature),
            fmt_opt(r.level),
            fmt_opt(r.voltage),
            fmt_opt(r.current),
        ),
        EngineEvent::Progress { .. } => {}
        EngineEvent::StatusChanged { state, reason } => match reason {
            Some(reason) => println!("[{state}] {reason}"),
            None => println!("[{state}]"),
        },
        EngineEvent::Connectivity { device, state } => println!("{device}: {state}"),
        EngineEvent::Completed { path } => {
            if let Some(path) = path {
                println!("Session closed: {}", path.display());
            }
        }
        EngineEvent::Error { kind, message } => eprintln!("error ({kind}): {message}"),
        EngineEvent::Warning { kind, message } => eprintln!("warning ({kind}): {message}"),
    }
}
