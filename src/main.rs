//! decksync - controller state mirroring and cover distribution
//!
//! ## Modes
//!
//! **`decksync server`**: Runs the session server. Controllers report their
//! state to it, displays read the mirror, and cover producers are told which
//! covers are needed.
//!
//! **`decksync producer`**: Subscribes to needed covers, extracts the
//! embedded picture of each track and uploads it.
//!
//! **`decksync report`**: Reads newline-delimited JSON field changes from
//! stdin and reports them like a controller would.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use decksync::{
    api,
    archive::CoverArchive,
    config::{self, ConfigError, ServerConfig},
    discovery,
    producer::{FileCoverSource, PathTranslator, Producer, ProducerError},
    reporter::{Reporter, ReporterError},
    shutdown::ShutdownCoordinator,
    sync::{SyncOptions, SyncState},
};

/// Default session server endpoint for producers and reporters.
const DEFAULT_ENDPOINT: &str = "http://localhost:8080/";

/// How long WebSocket handlers get to send their close frames.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(ClapParser, Debug)]
#[command(name = "decksync", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session server
    Server {
        /// Config file (TOML). Defaults to <config dir>/decksync/server.toml
        #[arg(long, env = "DECKSYNC_CONFIG")]
        config: Option<PathBuf>,

        /// Address to bind the HTTP/WebSocket server
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Ask controllers to send their debug log lines
        #[arg(long)]
        debug_logging: bool,

        /// Updates buffered before init before the session is reset
        #[arg(long)]
        max_queue: Option<usize>,

        /// Directory to archive uploaded covers in
        #[arg(long)]
        cover_dir: Option<PathBuf>,

        /// Do not advertise the server over mDNS
        #[arg(long)]
        no_advertise: bool,

        /// mDNS instance name
        #[arg(long)]
        service_name: Option<String>,

        /// Seconds a cover long-poll waits before answering empty
        #[arg(long)]
        long_poll_secs: Option<u64>,

        /// Allowed CORS origin for browser displays (repeatable)
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,
    },

    /// Load and upload covers the server asks for
    Producer {
        /// Session server endpoint
        #[arg(short, long, env = "DECKSYNC_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Command that maps a controller path to a local path
        #[arg(short = 't', long)]
        path_translator: Option<String>,
    },

    /// Report NDJSON field changes from stdin
    Report {
        /// Session server endpoint
        #[arg(short, long, env = "DECKSYNC_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },
}

#[derive(Debug, Error)]
pub enum DecksyncError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("reporter error: {0}")]
    Reporter(#[from] ReporterError),

    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Server {
            config,
            bind,
            debug_logging,
            max_queue,
            cover_dir,
            no_advertise,
            service_name,
            long_poll_secs,
            cors_origins,
        } => {
            let overrides = ServerOverrides {
                bind,
                debug_logging,
                max_queue,
                cover_dir,
                no_advertise,
                service_name,
                long_poll_secs,
                cors_origins,
            };
            match load_server_config(config, overrides) {
                Ok(config) => run_server(config).await,
                Err(e) => Err(e),
            }
        }
        Commands::Producer {
            endpoint,
            path_translator,
        } => run_producer(endpoint, path_translator).await,
        Commands::Report { endpoint } => run_report(endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("decksync: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "decksync=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

/// Server flags given on the command line. Anything set here wins over the
/// config file.
struct ServerOverrides {
    bind: Option<SocketAddr>,
    debug_logging: bool,
    max_queue: Option<usize>,
    cover_dir: Option<PathBuf>,
    no_advertise: bool,
    service_name: Option<String>,
    long_poll_secs: Option<u64>,
    cors_origins: Vec<String>,
}

fn load_server_config(
    path: Option<PathBuf>,
    overrides: ServerOverrides,
) -> Result<ServerConfig, DecksyncError> {
    let path = path.unwrap_or_else(config::default_config_path);
    let mut config = ServerConfig::load_or_default(&path)?;
    tracing::debug!(path = %path.display(), "server config loaded");

    if let Some(bind) = overrides.bind {
        config.bind = bind;
    }
    if overrides.debug_logging {
        config.debug_logging = true;
    }
    if let Some(max_queue) = overrides.max_queue {
        config.max_queue = max_queue.max(1);
    }
    if overrides.cover_dir.is_some() {
        config.cover_dir = overrides.cover_dir;
    }
    if overrides.no_advertise {
        config.advertise = false;
    }
    if let Some(name) = overrides.service_name {
        config.service_name = name;
    }
    if let Some(secs) = overrides.long_poll_secs {
        config.long_poll_secs = secs.max(1);
    }
    if !overrides.cors_origins.is_empty() {
        config.cors_origins = overrides.cors_origins;
    }
    Ok(config)
}

async fn run_server(config: ServerConfig) -> Result<(), DecksyncError> {
    tracing::info!("decksync server starting");

    let shutdown = ShutdownCoordinator::new();
    let sync = SyncState::new(SyncOptions {
        max_queue: config.max_queue,
        debug_logging: config.debug_logging,
    });
    let mut state = api::AppState::new(sync, shutdown.clone());
    state.archive = config.cover_dir.clone().map(CoverArchive::new);
    state.long_poll_timeout = config.long_poll_timeout();
    if let Some(dir) = &config.cover_dir {
        tracing::info!(dir = %dir.display(), "archiving covers");
    }

    let app = api::router(
        state,
        api::RouterConfig {
            cors_origins: config.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "HTTP/WS server listening");

    // Held for the server's lifetime; dropping it withdraws the record.
    let _advertisement = if config.advertise {
        match discovery::advertise(local_addr, &config.service_name) {
            Ok(service) => Some(service),
            Err(e) => {
                tracing::warn!(error = %e, "mDNS advertisement unavailable");
                None
            }
        }
    } else {
        None
    };

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("received Ctrl+C");
        }
        result = &mut http_handle => {
            result??;
            return Ok(());
        }
    }

    // Signal WebSocket handlers and long-polls to finish
    shutdown.shutdown();
    if !shutdown.wait_for_idle(CLOSE_GRACE).await {
        tracing::debug!(active = shutdown.active_count(), "connections still open at shutdown");
    }

    let _ = server_shutdown_tx.send(());
    http_handle.await??;
    tracing::info!("decksync server stopped");
    Ok(())
}

// ── Producer mode ──────────────────────────────────────────────────

async fn run_producer(endpoint: String, path_translator: Option<String>) -> Result<(), DecksyncError> {
    let source = FileCoverSource::new(path_translator.map(PathTranslator::new));
    let producer = Producer::new(&endpoint, source)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C");
        }
        on_signal.cancel();
    });

    producer.run(cancel).await;
    Ok(())
}

// ── Report mode ────────────────────────────────────────────────────

/// One line of reporter input.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReportLine {
    Field {
        field: String,
        value: serde_json::Value,
    },
    Log {
        log: String,
        #[serde(default)]
        important: bool,
    },
}

async fn run_report(endpoint: String) -> Result<(), DecksyncError> {
    let reporter = Reporter::new(&endpoint)?;
    tracing::info!(endpoint = %reporter.endpoint(), "reporting stdin");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ReportLine>(&line) {
            Ok(ReportLine::Field { field, value }) => match reporter.report(&field, value).await {
                Ok(outcome) => tracing::debug!(field, ?outcome, "reported"),
                Err(e) => tracing::warn!(field, error = %e, "report failed"),
            },
            Ok(ReportLine::Log { log, important }) => {
                if let Err(e) = reporter.log(&log, important).await {
                    tracing::warn!(error = %e, "log failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping unparseable line"),
        }
    }
    Ok(())
}
