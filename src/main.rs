mod gateway;
mod rpc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use courier_channels::{AdapterRegistry, LoopbackAdapter};
use courier_core::config;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use gateway::{Gateway, LocalEchoRunner};

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Courier — multi-channel agent gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway.
    Start,
    /// Print resolved configuration and store locations.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let cfg = config::load_or_default(&cli.config)?;
            // Guard must stay alive for the file writer to flush.
            let _log_guard = init_logging(&cfg)?;

            let mut adapters = AdapterRegistry::new();
            adapters.register(Arc::new(LoopbackAdapter::new()));

            let gw = Arc::new(Gateway::new(cfg, Arc::new(LocalEchoRunner), adapters));
            gw.run().await?;
        }
        Commands::Status => {
            let cfg = config::load_or_default(&cli.config)?;
            println!("Courier — Status\n");
            println!("Config:        {}", cli.config);
            println!("Bind:          {}:{}", cfg.gateway.host, cfg.gateway.port);
            println!("DM scope:      {:?}", cfg.session.dm_scope);
            println!(
                "Session store: {}",
                cfg.resolve_path(&cfg.session.store_path).display()
            );
            println!(
                "Cron:          {} ({})",
                if cfg.cron.enabled { "enabled" } else { "disabled" },
                cfg.resolve_path(&cfg.cron.jobs_path).display()
            );
            println!(
                "Heartbeat:     {}",
                if cfg.heartbeat.enabled {
                    format!("every {} min", cfg.heartbeat.interval_minutes)
                } else {
                    "disabled".to_string()
                }
            );
            println!("Lanes:");
            for (lane, cap) in cfg.lanes.caps() {
                println!("  {lane}: {cap}");
            }
        }
    }

    Ok(())
}

/// Stdout plus a daily-rolled file under `<data_dir>/logs`. RUST_LOG
/// overrides the configured level.
fn init_logging(
    cfg: &config::Config,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = PathBuf::from(&cfg.courier.data_dir).join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file = tracing_appender::rolling::daily(&log_dir, "courier.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.courier.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file_writer.and(std::io::stdout))
        .with_ansi(false)
        .init();
    Ok(guard)
}
