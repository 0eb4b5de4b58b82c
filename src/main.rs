use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skystream::config::AppConfig;
use skystream::nas::upload::ChunkedUploader;
use skystream::nas::FileStation;
use skystream::publisher::Publisher;
use skystream::relay;
use skystream::signaling::mqtt::{MqttRouter, MqttSignaling};
use skystream::signaling::SessionIdentity;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// skystream command line arguments
#[derive(Parser, Debug)]
#[command(name = "skystream")]
#[command(version, about = "A lightweight edge video publisher streaming local sources over WebRTC", long_about = None)]
struct CliArgs {
    /// Config file path
    #[arg(short, long, value_name = "FILE", default_value = "config/config.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish every configured video source to its remote consumer
    Publish,
    /// Consume a UDP stream and rebroadcast it to multiple sink addresses
    Relay,
    /// Retrieve files from the NAS into the local store
    Fetch {
        /// Remote file paths to retrieve
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("starting skystream v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&args.config).await?;

    match args.command {
        Command::Publish => publish(config).await,
        Command::Relay => Ok(relay::run(&config.relay).await?),
        Command::Fetch { paths } => fetch(config, paths).await,
    }
}

/// Run one publisher per configured stream until shutdown.
async fn publish(config: AppConfig) -> anyhow::Result<()> {
    if config.streams.is_empty() {
        anyhow::bail!("no streams configured");
    }

    let router = MqttRouter::connect(&config.signaling);
    let answer_timeout = Duration::from_secs(config.signaling.answer_timeout_secs);

    let mut streams = FuturesUnordered::new();
    for stream in &config.streams {
        let identity = SessionIdentity::new(stream.id.clone(), stream.source.kind());
        let signaling = Arc::new(MqttSignaling::new(
            router.clone(),
            &config.signaling,
            &identity,
        ));
        let publisher = Publisher::new(
            identity.clone(),
            config.webrtc.clone(),
            answer_timeout,
            signaling,
            stream.source.clone(),
        );

        streams.push(tokio::spawn(async move {
            if let Err(e) = publisher.publish().await {
                tracing::error!("stream {} failed: {}", identity, e);
            } else {
                tracing::info!("stream {} ended", identity);
            }
        }));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = async { while streams.next().await.is_some() {} } => {
            tracing::info!("all streams ended");
        }
    }

    Ok(())
}

/// Retrieve files from the NAS, then archive the result if an upload
/// endpoint is configured.
async fn fetch(config: AppConfig, paths: Vec<String>) -> anyhow::Result<()> {
    let nas = FileStation::new(config.nas.clone());

    let info = nas.api_info().await?;
    let sid = nas.login(&info).await?;
    let saved = nas.download(&info, &paths, &sid).await?;
    nas.logout(&info, &sid).await?;
    tracing::info!("saved {} remote file(s) to {}", paths.len(), saved.display());

    if !config.nas.upload_url.is_empty() {
        let uploader = ChunkedUploader::new(config.nas.upload_url.clone());
        let destination = uploader.upload(&saved).await?;
        tracing::info!("archived {} to {}", saved.display(), destination);
    }

    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "skystream=error",
        LogLevel::Warn => "skystream=warn",
        LogLevel::Info => "skystream=info",
        LogLevel::Debug => "skystream=debug",
        LogLevel::Trace => "skystream=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
