//! # calibre-rest CLI
//!
//! ```bash
//! # Serve the library over HTTP
//! calibre-rest --calibredb /opt/calibre/calibredb --library ~/Calibre serve
//!
//! # Validate configuration and print the calibre version
//! calibre-rest --config ./calibre-rest.toml check
//! ```
//!
//! Every option can also be set through its `CALIBRE_REST_*` environment
//! variable or the TOML file passed with `--config`; command-line values win.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use calibre_rest::config::{self, Overrides, LOG_LEVELS};
use calibre_rest::library::Library;
use calibre_rest::server;

/// calibre-rest: an HTTP CRUD API for a calibre library.
#[derive(Parser)]
#[command(name = "calibre-rest", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used when omitted.
    #[arg(long, short = 'c', global = true, env = "CALIBRE_REST_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the calibredb executable.
    #[arg(long, global = true, env = "CALIBRE_REST_PATH")]
    calibredb: Option<PathBuf>,

    /// Path to the calibre library directory (containing `metadata.db`).
    #[arg(long, short = 'l', global = true, env = "CALIBRE_REST_LIBRARY")]
    library: Option<PathBuf>,

    /// Bind address HOST:PORT.
    #[arg(long, short = 'b', global = true, env = "CALIBRE_REST_ADDR")]
    bind: Option<String>,

    /// Calibre library username.
    #[arg(long, short = 'u', global = true, env = "CALIBRE_REST_USERNAME")]
    username: Option<String>,

    /// Calibre library password.
    #[arg(long, short = 'p', global = true, env = "CALIBRE_REST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level: trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    #[arg(long, short = 'g', global = true, env = "CALIBRE_REST_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve,

    /// Validate the configuration and print the calibre version.
    Check,
}

fn init_tracing(level: &str) {
    let normalized = level.to_ascii_lowercase();
    let known = LOG_LEVELS.contains(&normalized.as_str());
    let fallback = if known { normalized.as_str() } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !known {
        warn!("Log level \"{}\" not supported. Setting log level to \"info\"", level);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(cli.config.as_deref())?.apply(Overrides {
        executable: cli.calibredb,
        library: cli.library,
        bind: cli.bind,
        username: cli.username,
        password: cli.password,
        log_level: cli.log_level,
    });
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Check => {
            let library = Library::new(&cfg)?;
            let version = tokio::task::spawn_blocking(move || library.version()).await??;
            info!(library = %cfg.calibre.library.display(), "configuration ok");
            println!("calibre {}", version);
        }
    }

    Ok(())
}
