use chrono::Utc;
use clap::Parser;
use smartmatch::config::{Args, Command, DatabaseConfig};
use smartmatch::{Application, Config, Storage, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

async fn execute<S: Storage + 'static>(app: Application<S>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => app.serve(shutdown_signal()).await,
        Command::Guardrails { from, to } => {
            let now = Utc::now();
            let report = app.engine().guardrail_report(from, to.unwrap_or(now), now).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::FallbackQueue => {
            let queue = app.engine().fallback_queue().await?;
            println!("{}", serde_json::to_string_pretty(&queue)?);
            Ok(())
        }
        Command::Validate => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;
    let command = args.command.clone().unwrap_or(Command::Run);

    if command == Command::Validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let result = match config.database {
        DatabaseConfig::Memory => execute(Application::in_memory(config).await?, command).await,
        DatabaseConfig::External { .. } => execute(Application::connect(config).await?, command).await,
    };

    telemetry::shutdown_telemetry();
    result
}
