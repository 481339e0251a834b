mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Operator {
            metrics_bind_address,
            policy_health_probe_bind_address,
            entry_health_probe_bind_address,
            pod_health_probe_bind_address,
            metrics_secure,
            enable_http2,
        } => {
            commands::operator::run(commands::operator::OperatorFlags {
                metrics_bind_address,
                policy_health_probe_bind_address,
                entry_health_probe_bind_address,
                pod_health_probe_bind_address,
                metrics_secure,
                enable_http2,
            })
            .await?;
        }
    }

    Ok(())
}
