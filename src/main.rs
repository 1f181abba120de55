use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crucible::config::Config;
use crucible::server;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Asynchronous code-task scheduler with live progress streaming")]
struct Cli {
    /// Path to a crucible.toml config file. Defaults to ./crucible.toml
    /// if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler server (the default when no command is given)
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Permissive CORS for local frontend development
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;

    let Commands::Serve { host, port, dev } = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
        dev: false,
    });
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev_mode = true;
    }

    // Keep the appender guard alive for the lifetime of the process.
    let _log_guard = init_tracing(&config, cli.verbose)?;

    server::start_server(config).await
}

/// Install the tracing subscriber: RUST_LOG wins, otherwise info (debug
/// with --verbose); pretty or JSON output, stdout or a log file.
fn init_tracing(
    config: &Config,
    verbose: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "crucible=debug,info" } else { "info" }));

    let json = config.logging.format == "json";
    match &config.logging.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .context("logging.file must name a file, not a directory")?;
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
            Ok(Some(guard))
        }
        None => {
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .init();
            }
            Ok(None)
        }
    }
}
