use clap::Parser;
use relay::config::RelayConfig;
use relay::engine::ForwardingEngine;
use relay::sinks::{AllowAllAccessPolicy, CountingMetricsSink, NullConnectionSink, NullListenerStatusSink};
use relay::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "User-space L4 TCP/UDP forwarding relay", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        RelayConfig::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: relay --config {:?}", config_path);
        return Ok(());
    }

    init_logging(&args.log_level)?;

    info!("relay v{} starting", env!("CARGO_PKG_VERSION"));

    let config = if let Some(config_path) = args.config {
        info!("loading configuration from: {:?}", config_path);
        RelayConfig::from_file(config_path)?
    } else {
        info!("no configuration file specified, using defaults");
        RelayConfig::default()
    };

    // The rule/access-rule persistence store, admin API, and push channel are
    // out-of-scope collaborators; the standalone binary wires in-memory
    // no-op defaults so it can run without them.
    let engine = ForwardingEngine::new(
        Arc::new(AllowAllAccessPolicy),
        Arc::new(NullConnectionSink),
        CountingMetricsSink::new(),
        Arc::new(NullListenerStatusSink),
    );

    for rule in config.rules {
        let rule_id = rule.id;
        if engine.activate(rule).await {
            info!(rule_id, "rule activated");
        } else {
            error!(rule_id, "rule failed to activate");
        }
    }

    info!(
        active_rules = engine.active_server_count(),
        "relay running"
    );

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C, shutting down gracefully...");

    engine.shutdown().await;

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| relay::RelayError::Config(format!("invalid log level: {e}")))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
