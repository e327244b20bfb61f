//! Pulseloop - adaptive-latency tone playback
//!
//! Entry point for the command line player.

use anyhow::{bail, Context, Result};
use pulseloop::audio::signal::Waveform;
use pulseloop::server::cpal_backend::CpalServer;
use pulseloop::{spawn_playback, Backend, PlaybackConfig, SampleFormat};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulseloop=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut write_config: Option<PathBuf> = None;
    let mut backend = Backend::Cpal;
    let mut server: Option<String> = None;
    let mut latency: Option<u64> = None;
    let mut sample_rate: Option<u32> = None;
    let mut format: Option<SampleFormat> = None;
    let mut square_period: Option<usize> = None;
    let mut duration: Option<Duration> = None;
    let mut i = 1;

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--list" | "-l" => {
                list_sinks();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("pulseloop {}", pulseloop::VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--config" | "-c" => config_path = Some(PathBuf::from(value(&args, i)?)),
            "--write-config" => write_config = Some(PathBuf::from(value(&args, i)?)),
            "--backend" | "-b" => {
                let name = value(&args, i)?;
                backend = match Backend::from_name(name) {
                    Some(b) => b,
                    None => bail!("Unknown backend: {} (expected cpal or null)", name),
                };
            }
            "--server" | "-s" => server = Some(value(&args, i)?.to_string()),
            "--latency" => latency = Some(parse(&args, i)?),
            "--sample-rate" | "-r" => sample_rate = Some(parse(&args, i)?),
            "--format" | "-f" => {
                let name = value(&args, i)?;
                format = match SampleFormat::from_name(name) {
                    Some(f) => Some(f),
                    None => bail!("Unknown sample format: {} (expected s16le or float32le)", name),
                };
            }
            "--square" => square_period = Some(parse(&args, i)?),
            "--duration" | "-d" => {
                let secs: f64 = parse(&args, i)?;
                duration = Some(Duration::try_from_secs_f64(secs).context("Invalid duration")?);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += 2;
    }

    let mut config = match &config_path {
        Some(path) => PlaybackConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PlaybackConfig::default(),
    };
    if server.is_some() {
        config.server = server;
    }
    if let Some(usec) = latency {
        config.latency.initial_usec = usec;
    }
    if let Some(rate) = sample_rate {
        config.sample_rate = rate;
    }
    if let Some(format) = format {
        config.format = format;
    }
    if let Some(period) = square_period {
        config.waveform = Waveform::Square {
            period,
            amplitude: config.waveform.amplitude(),
        };
    }
    config.validate().context("Invalid configuration")?;

    if let Some(path) = write_config {
        config
            .save(&path)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    run(config, backend, duration)
}

/// Argument following the flag at `i`
fn value(args: &[String], i: usize) -> Result<&str> {
    match args.get(i + 1) {
        Some(v) => Ok(v.as_str()),
        None => bail!("{} requires a value", args[i]),
    }
}

fn parse<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T> {
    let raw = value(args, i)?;
    match raw.parse() {
        Ok(v) => Ok(v),
        Err(_) => bail!("Invalid value for {}: {}", args[i], raw),
    }
}

fn print_help() {
    println!("Usage: pulseloop [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH       Load configuration from a JSON file");
    println!("      --write-config PATH Write the effective configuration and exit");
    println!("  -b, --backend NAME      Audio backend: cpal (default) or null");
    println!("  -s, --server NAME       Server or output device name");
    println!("      --latency USEC      Initial buffer latency (default: 20000)");
    println!("  -r, --sample-rate HZ    Sample rate (default: 44100)");
    println!("  -f, --format FORMAT     Sample format: s16le (default) or float32le");
    println!("      --square PERIOD     Play a square wave with PERIOD frames");
    println!("  -d, --duration SECS     Stop after SECS seconds");
    println!("  -l, --list              List output devices");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  pulseloop --latency 50000");
    println!("  pulseloop --backend null --duration 5");
}

fn list_sinks() {
    match CpalServer::list_sinks() {
        Ok(sinks) if sinks.is_empty() => println!("No output devices found."),
        Ok(sinks) => {
            println!("Found {} output device(s):", sinks.len());
            println!();
            for (i, sink) in sinks.iter().enumerate() {
                let default_marker = if sink.is_default { " [DEFAULT]" } else { "" };
                println!("  {}. {}{}", i + 1, sink.name, default_marker);
                println!(
                    "     {} channel(s) @ {} Hz",
                    sink.channels, sink.sample_rate
                );
            }
        }
        Err(e) => {
            error!("Failed to list devices: {}", e);
            println!("Error: {}", e);
        }
    }
}

fn run(config: PlaybackConfig, backend: Backend, duration: Option<Duration>) -> Result<()> {
    info!(
        ?backend,
        rate = config.sample_rate,
        format = ?config.format,
        latency_usec = config.latency.initial_usec,
        "Starting pulseloop {}",
        pulseloop::VERSION
    );

    let handle = spawn_playback(config, backend).context("Failed to start playback")?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    println!("Playing. Press Ctrl+C to stop.");
    let started = Instant::now();
    while running.load(Ordering::SeqCst) && !handle.is_finished() {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("Stopping...");
    handle.stop();
    let summary = handle.join().context("Playback failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
