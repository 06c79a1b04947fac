use clap::{Parser, Subcommand};
use op_settler::logging::{self, LogFormat};
use op_settler::{service, SettlerConfig, Shutdown};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "op-settler", version, about = "Tenant settlement agent")]
struct Cli {
    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    /// Log level for this crate; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the settlement agent until interrupted
    Start,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is normal in production
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_format, &cli.log_level) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Start => match run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("Settler failed: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run() -> eyre::Result<()> {
    let config = SettlerConfig::from_env()?;
    let shutdown = Shutdown::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, shutting down"),
            Err(e) => tracing::error!("Failed to listen for interrupt: {}", e),
        }
        trigger.trigger();
    });

    service::start(config, &shutdown).await?;
    Ok(())
}
