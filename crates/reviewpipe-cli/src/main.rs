use anyhow::Result;
use clap::{Parser, Subcommand};
use reviewpipe_storage::StoreBackend;
use reviewpipe_sync::PipelineConfig;
use reviewpipe_web::{AppState, DEFAULT_WEB_PORT};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "reviewpipe")]
#[command(about = "Collect app store reviews and report on them")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection pass over every enabled target.
    Collect {
        /// Write into an in-memory store instead of the configured one.
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the collect and report endpoints.
    Serve {
        #[arg(long, env = "REVIEWPIPE_WEB_PORT", default_value_t = DEFAULT_WEB_PORT)]
        port: u16,
    },
    /// Print the JSON report.
    Report,
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command.unwrap_or(Commands::Collect { dry_run: false }) {
        Commands::Collect { dry_run } => {
            let run = reviewpipe_sync::run_collect_once_from_env(dry_run).await?;
            for failure in run
                .sources
                .iter()
                .filter(|o| matches!(o, reviewpipe_sync::SourceOutcome::Failed { .. }))
            {
                warn!(outcome = ?failure, "source skipped");
            }
            println!(
                "collect complete: run_id={} inserted={} failed_sources={} \
                 failed_chunks={} dry_run={}",
                run.run_id,
                run.inserted,
                run.failed_sources(),
                run.failed_chunks(),
                dry_run
            );
            println!("{}", serde_json::to_string(&run.summary())?);
        }
        Commands::Serve { port } => {
            let state = AppState::from_config(&PipelineConfig::from_env()).await?;
            reviewpipe_web::serve(state, port).await?;
        }
        Commands::Report => {
            let config = PipelineConfig::from_env();
            let backend = StoreBackend::connect(&config.credentials()?, config.http_timeout())?;
            let report = reviewpipe_web::load_report(backend.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_is_the_default_command() {
        let cli = Cli::try_parse_from(["reviewpipe"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.json_logs);
    }

    #[test]
    fn parses_subcommands_and_global_flags() {
        let cli =
            Cli::try_parse_from(["reviewpipe", "collect", "--dry-run", "--json-logs"]).unwrap();
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Some(Commands::Collect { dry_run: true })));

        let cli = Cli::try_parse_from(["reviewpipe", "serve", "--port", "9100"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Serve { port: 9100 })));
    }

    #[test]
    fn serve_port_is_owned_by_the_cli() {
        let cli = Cli::try_parse_from(["reviewpipe", "serve"]).unwrap();
        let Some(Commands::Serve { port }) = cli.command else {
            panic!("expected serve");
        };
        let expected = std::env::var("REVIEWPIPE_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WEB_PORT);
        assert_eq!(port, expected);
    }
}
