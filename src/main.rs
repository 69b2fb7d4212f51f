//! inputhubd - multimodal input service daemon
//!
//! Entry point for the server binary.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inputhub_server::config::Config;
use inputhub_server::server::InputHubServer;

/// Command-line arguments for inputhubd
#[derive(Parser, Debug)]
#[command(name = "inputhubd")]
#[command(version, about = "Multimodal input service daemon", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/inputhub/config.toml")]
    pub config: String,

    /// UNIX socket path override
    #[arg(short, long, env = "INPUTHUB_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("inputhubd v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Profile: {}",
        if cfg!(debug_assertions) { "debug" } else { "release" }
    );

    let config = Config::load(&args.config).or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        Config::default_config()
    })?;
    let config = config.with_overrides(args.socket.clone());

    info!("Configuration loaded successfully");
    tracing::debug!("Config: {:?}", config);

    let server = InputHubServer::new(config)?;

    info!("Starting input hub server");
    server.run().await?;

    info!("Input hub server shut down");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("inputhub_server={log_level},warn"))
        });

    if let Some(log_file_path) = &args.log_file {
        let file_appender = tracing_appender::rolling::never(
            log_file_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
            log_file_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("inputhubd.log")),
        );

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout))
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file_appender)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stdout))
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file_appender)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stdout))
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file_appender)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
        }
    }

    Ok(())
}
