use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use snapscan_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use snapscan_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use snapscan_core::notify::NotificationEvent;
use snapscan_core::server::{app_router, AppState};

const CLI_SESSION_ID: &str = "cli";

#[derive(Parser)]
#[command(
    name = "snapscan",
    about = "Image upload service that runs object detection on every upload",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(
        long,
        value_name = "PROGRAM",
        global = true,
        help = "Detector executable (overrides detector.program)"
    )]
    detector: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store one image, run detection on it and print the result as JSON.
    Detect(DetectArgs),
}

#[derive(Args)]
struct DetectArgs {
    #[arg(help = "Path to the image to process")]
    image: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    let mut config = load_config(&resolved_data_dir);
    if let Some(program) = cli.detector {
        config.detector.program = program;
    }

    match cli.command {
        Some(Commands::Detect(args)) => run_detect(config, args.image).await,
        None => run_server(config, cli.port, cli.host).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        mode: RuntimeLogMode::Server,
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    match init_plan.file_sink {
        FileSinkPlan::Ready { log_dir, appender } => {
            let file_env_filter =
                parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            info!(log_dir = %log_dir.display(), "Persistent file logging enabled");
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// CLI flag, then `PORT`, then the config file.
fn resolve_port(port_override: Option<u16>, env_port: Option<&str>, config_port: u16) -> u16 {
    port_override
        .or_else(|| env_port.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config_port)
}

async fn run_server(
    mut config: AppConfig,
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<()> {
    config.server.port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    if let Some(host) = host_override {
        config.server.host = host;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let base_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let state = AppState::from_config(config, &base_dir).await?;
    let shutdown = state.shutdown_token();
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting snapscan server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown requested; stopping running detections");
            shutdown.cancel();
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn run_detect(config: AppConfig, image: PathBuf) -> Result<()> {
    let original_name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("not a file path: {}", image.display()))?;
    let file = tokio::fs::File::open(&image)
        .await
        .with_context(|| format!("failed to open {}", image.display()))?;

    let base_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let state = AppState::from_config(config, &base_dir).await?;
    let asset = state.storage().store(file, &original_name).await?;
    info!(filename = %asset.generated_name, "Stored {}", image.display());

    let (tx, rx) = mpsc::unbounded_channel();
    state.notifications().register(CLI_SESSION_ID, tx.clone());
    let printer = tokio::spawn(print_worker_output(rx));

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let result = state
        .pipeline()
        .process(asset, Some(CLI_SESSION_ID.to_string()), &cancel)
        .await;

    ctrl_c.abort();
    state.notifications().unregister(CLI_SESSION_ID, &tx);
    drop(tx);
    let _ = printer.await;

    let processed = result?;
    let descriptor = serde_json::json!({
        "filename": processed.asset.generated_name,
        "path": processed.asset.storage_path.display().to_string(),
        "output": processed.output_path.display().to_string(),
        "metadata": processed.metadata,
    });
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

async fn print_worker_output(mut rx: mpsc::UnboundedReceiver<NotificationEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            NotificationEvent::DetectionData { data, .. } => eprint!("{data}"),
            NotificationEvent::DetectionComplete {
                success, exit_code, ..
            } => {
                if !success {
                    eprintln!("detector exited with code {exit_code:?}");
                }
            }
            NotificationEvent::Session { .. } => {}
        }
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn parses_server_flags() {
        let cli = Cli::try_parse_from([
            "snapscan",
            "--port",
            "8080",
            "--host",
            "127.0.0.1",
            "--detector",
            "/opt/detect",
            "-vv",
        ])
        .unwrap();

        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.detector, Some(PathBuf::from("/opt/detect")));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn parses_detect_subcommand() {
        let cli = Cli::try_parse_from(["snapscan", "detect", "photo.jpg", "--log-filter", "debug"])
            .unwrap();

        match cli.command {
            Some(Commands::Detect(args)) => assert_eq!(args.image, PathBuf::from("photo.jpg")),
            None => panic!("expected detect subcommand"),
        }
        assert_eq!(cli.log_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn detect_requires_an_image() {
        assert!(Cli::try_parse_from(["snapscan", "detect"]).is_err());
    }

    #[test]
    fn port_precedence_is_flag_then_env_then_config() {
        assert_eq!(resolve_port(Some(1), Some("2"), 3), 1);
        assert_eq!(resolve_port(None, Some("2"), 3), 2);
        assert_eq!(resolve_port(None, Some("not-a-port"), 3), 3);
        assert_eq!(resolve_port(None, None, 3), 3);
    }
}
