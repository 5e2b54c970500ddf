//! xbar - real-time audio routing server
//!
//! Loads a setup file, runs the routing engine for a while, and reports what
//! happened.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xbar_audio::{RoutingEngine, Setup};
use xbar_plugin::Properties;

/// Real-time audio routing server
#[derive(Parser, Debug)]
#[command(name = "xbar")]
#[command(about = "Run an audio routing setup", long_about = None)]
struct Args {
    /// Setup file (RON)
    #[arg(short, long)]
    setup: PathBuf,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 2.0)]
    seconds: f64,

    /// Module command sent before starting, e.g. `cabin.mixer:cmd=1,pin=nav,gain=-60`
    #[arg(long = "cmd", value_name = "INSTANCE:KEY=VALUE,...")]
    commands: Vec<String>,

    /// Record a matrix output port to `<prefix>.wav`, e.g. `speaker.out=capture`
    #[arg(long = "record", value_name = "PORT=PREFIX")]
    recordings: Vec<String>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xbar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.seconds.is_nan() || args.seconds <= 0.0 {
        bail!("--seconds must be > 0");
    }

    let setup = Setup::load(&args.setup)
        .with_context(|| format!("Failed to load setup {}", args.setup.display()))?;
    let mut engine = RoutingEngine::new(&setup).context("Failed to build routing engine")?;

    let seconds = args.seconds.ceil() as u32;
    let mut probed = Vec::new();
    for recording in &args.recordings {
        let (port, prefix) = parse_recording(recording)?;
        engine
            .start_probing(port, prefix, false, seconds)
            .with_context(|| format!("Failed to record port '{port}'"))?;
        probed.push(port.to_string());
    }

    for command in &args.commands {
        let (instance, cmd) = parse_command(command)?;
        let response = engine
            .dispatch_cmd(instance, &cmd)
            .with_context(|| format!("Command '{command}' failed"))?;
        if !response.is_empty() {
            for (key, value) in response.iter() {
                println!("{instance}: {key} = {value}");
            }
        }
    }

    engine.start().context("Failed to start routing engine")?;
    std::thread::sleep(Duration::from_secs_f64(args.seconds));
    engine.stop().context("Failed to stop routing engine")?;

    for port in &probed {
        // A probe that ran its full duration has already detached itself
        if engine.matrix().is_probing(engine.port(port).context("probed port vanished")?) {
            engine.stop_probing(port)?;
        }
    }

    report(&engine);
    Ok(())
}

/// `port=prefix`
fn parse_recording(arg: &str) -> Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((port, prefix)) if !port.is_empty() && !prefix.is_empty() => Ok((port, prefix)),
        _ => bail!("--record expects PORT=PREFIX, got '{arg}'"),
    }
}

/// `instance:key=value,key=value`; values become int32, float32 or string
fn parse_command(arg: &str) -> Result<(&str, Properties)> {
    let Some((instance, pairs)) = arg.split_once(':') else {
        bail!("--cmd expects INSTANCE:KEY=VALUE,..., got '{arg}'");
    };
    let mut properties = Properties::new();
    for pair in pairs.split(',').filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("malformed key=value '{pair}' in '{arg}'");
        };
        let key = key.trim();
        let value = value.trim();
        if let Ok(int) = value.parse::<i32>() {
            properties.set(key, int);
        } else if let Ok(float) = value.parse::<f32>() {
            properties.set(key, float);
        } else {
            properties.set(key, value);
        }
    }
    Ok((instance, properties))
}

fn report(engine: &RoutingEngine) {
    let stats = engine.stats();
    tracing::info!(
        "Matrix: {} triggers, {} frames copied, {} dropped in {} overruns, {} active jobs",
        stats.triggers,
        stats.frames_copied,
        stats.frames_dropped,
        stats.overruns,
        stats.active_jobs
    );
    for event in engine.matrix_events() {
        tracing::info!("Matrix event: {:?}", event);
    }
    for event in engine.module_events() {
        tracing::info!("Module event: {:?}", event);
    }
    for device in engine.devices() {
        let peaks: Vec<String> = (0..device.ring_buffer().num_channels())
            .filter_map(|ch| device.peak(ch))
            .map(|p| format!("{p:.3}"))
            .collect();
        println!(
            "{}: {} periods, {} xruns, last peaks [{}]",
            device.name(),
            device.periods(),
            device.xruns(),
            peaks.join(", ")
        );
    }
}
