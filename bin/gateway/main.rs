use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::{error, info, LevelFilter};

use sensor_gateway::{load_config_or_default, Orchestrator, StdLogSink};

/// Sensor data gateway
#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(about = "Concurrent TCP ingestion gateway for sensor readings", long_about = None)]
struct Args {
    /// TCP port to listen on for sensor connections
    port: u16,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    initialize_logging(args.log_level.as_deref().unwrap_or("info"))?;
    info!("=== sensor gateway ===");
    info!("listening port: {}", args.port);
    info!("db path: {}", config.db_path);
    info!("control socket: {}", config.control_socket_path);

    let orchestrator = Arc::new(Orchestrator::new(Arc::new(StdLogSink)));
    let shutdown_orchestrator = orchestrator.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        shutdown_orchestrator.request_shutdown();
    })?;

    let result = orchestrator.run(args.port, &config);
    if let Err(ref e) = result {
        error!("gateway exited with error: {e}");
    }
    info!("final state: {:?}", orchestrator.state());

    result.map_err(|e| e.into())
}

fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
