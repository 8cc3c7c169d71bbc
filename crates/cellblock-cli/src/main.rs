//! Cellblock - pooled, isolated shell sandboxes
//!
//! The `cellblock` command exercises the sandbox pool against a Docker
//! Engine.
//!
//! ## Commands
//!
//! - `check-config`: Validate a configuration and show the container parameters it produces
//! - `warm`: Fill the sandbox pool and hold it until Ctrl-C
//! - `attach`: Run one session against the local terminal

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, Level};

use cellblock_core::recorder::recorder_factory;
use cellblock_core::telemetry::{init_tracing, parse_level};
use cellblock_core::{
    translate, CellblockConfig, Geometry, PoolSettings, SandboxPool, SessionContext, SessionIo,
    SessionOrchestrator, SessionSettings,
};
use cellblock_docker::DockerRuntime;

#[derive(Parser)]
#[command(name = "cellblock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pooled, isolated shell sandboxes for untrusted terminal sessions", long_about = None)]
struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true, env = "CELLBLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the translated container parameters
    CheckConfig,

    /// Create the sandbox pool and keep it warm until Ctrl-C
    Warm,

    /// Run one interactive session on this terminal
    ///
    /// Window size changes (SIGWINCH) are forwarded to the sandbox on Unix.
    Attach {
        /// Identity recorded for the session (default: $USER)
        #[arg(long)]
        identity: Option<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<CellblockConfig> {
    match path {
        Some(path) => CellblockConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let config = CellblockConfig::default();
            config.validate().context("Default configuration is invalid")?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        parse_level(&config.logging.level)
    };
    init_tracing(cli.json || config.logging.json, level);

    match cli.command {
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::Warm => cmd_warm(&config).await,
        Commands::Attach { identity } => {
            let code = cmd_attach(&config, identity).await?;
            // The blocking stdin reader would otherwise hold up runtime shutdown.
            std::process::exit(code);
        }
    }
}

fn cmd_check_config(config: &CellblockConfig) -> Result<()> {
    let example_name = format!("{}-00000000-{}", config.pool.name_prefix, Utc::now().format("%Y%m%d-%H%M%S"));
    let params = translate(
        &config.isolation,
        &config.pool.image,
        &example_name,
        Utc::now(),
        None,
    )
    .context("Failed to translate isolation policy")?;

    let report = serde_json::json!({
        "config": config,
        "create_params": params,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn connect(config: &CellblockConfig) -> Result<Arc<DockerRuntime>> {
    let runtime = DockerRuntime::connect(&config.docker).context("Failed to create Docker client")?;
    runtime
        .ping()
        .await
        .context("Docker engine is not reachable")?;
    Ok(Arc::new(runtime))
}

async fn warm_pool(config: &CellblockConfig, runtime: Arc<DockerRuntime>) -> Result<SandboxPool> {
    let pool = SandboxPool::new(runtime, PoolSettings::from_config(config));
    if let Err(e) = pool.initialize().await {
        pool.shutdown().await;
        return Err(e).context("Failed to initialize sandbox pool");
    }
    Ok(pool)
}

async fn cmd_warm(config: &CellblockConfig) -> Result<()> {
    let runtime = connect(config).await?;
    let pool = warm_pool(config, runtime).await?;

    info!(stats = ?pool.stats(), "sandbox pool warm; press Ctrl-C to drain");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    pool.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    Ok(())
}

fn env_geometry() -> Geometry {
    let dim = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u16>().ok());
    match (dim("COLUMNS"), dim("LINES")) {
        (Some(cols), Some(rows)) => Geometry::new(cols, rows),
        _ => Geometry::default(),
    }
}

/// Current size of the terminal on stdout, falling back to `COLUMNS`/`LINES`.
#[cfg(unix)]
fn terminal_geometry() -> Geometry {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes a `winsize` into the pointer we pass.
    let rc = unsafe {
        libc::ioctl(
            libc::STDOUT_FILENO,
            libc::TIOCGWINSZ,
            &mut size as *mut libc::winsize,
        )
    };
    if rc == 0 && size.ws_col > 0 && size.ws_row > 0 {
        Geometry::new(size.ws_col, size.ws_row)
    } else {
        env_geometry()
    }
}

#[cfg(not(unix))]
fn terminal_geometry() -> Geometry {
    env_geometry()
}

/// Send the new terminal size on every SIGWINCH until the session is gone.
#[cfg(unix)]
fn forward_resizes(resizes: UnboundedSender<Geometry>) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch =
        signal(SignalKind::window_change()).context("Failed to listen for SIGWINCH")?;
    Ok(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let geometry = terminal_geometry();
            debug!(%geometry, "terminal resized");
            if resizes.send(geometry).is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn forward_resizes(_resizes: UnboundedSender<Geometry>) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async {}))
}

async fn cmd_attach(config: &CellblockConfig, identity: Option<String>) -> Result<i32> {
    let runtime = connect(config).await?;
    let pool = warm_pool(config, runtime.clone()).await?;

    let orchestrator = SessionOrchestrator::new(
        pool.clone(),
        runtime,
        recorder_factory(&config.recording),
        SessionSettings::from_config(config),
    );

    let identity = identity
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "local".to_string());
    let session_id = format!("local-{}", Utc::now().format("%Y%m%d%H%M%S%3f"));
    let term_type = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());
    let ctx = SessionContext::new(session_id, identity, "local", terminal_geometry())
        .with_term_type(term_type);

    let (io, resizes) = SessionIo::new(tokio::io::stdin(), tokio::io::stdout());
    let resize_forwarder = forward_resizes(resizes)?;
    let result = orchestrator.run_session(ctx, io).await;
    resize_forwarder.abort();
    pool.shutdown().await;

    let report = result.context("Session failed")?;
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cellblock", "warm", "--json", "-v"]).unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Warm));
    }

    #[test]
    fn test_default_config_loads() {
        let config = load_config(None).unwrap();
        assert_eq!(config.pool.size, 3);
    }

    #[test]
    fn test_missing_config_file_has_context() {
        let err = load_config(Some(Path::new("/nonexistent/cellblock.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"));
    }

    #[test]
    fn test_check_config_runs_on_defaults() {
        cmd_check_config(&CellblockConfig::default()).unwrap();
    }

    #[test]
    fn test_terminal_geometry_is_never_empty() {
        let geometry = terminal_geometry();
        assert!(geometry.cols > 0);
        assert!(geometry.rows > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_window_change_is_forwarded() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let forwarder = forward_resizes(tx).unwrap();

        // SAFETY: raising a signal that has a handler installed above.
        unsafe { libc::raise(libc::SIGWINCH) };
        let geometry = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("resize not forwarded")
            .unwrap();
        assert_eq!(geometry, terminal_geometry());
        forwarder.abort();
    }
}
