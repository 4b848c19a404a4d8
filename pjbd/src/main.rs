use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pjb_core::config::{load_config, Config};
use pjb_core::observability::init_logging;
use pjbd::context::{ChannelHandler, ContextChannel};
use pjbd::{
    run_exchange, ChannelFactory, Context, ContextRegistry, ContextServer, ConnectionPool,
    PoolSettings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "pjbd", about = "PHP FastCGI bridge daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker, the connection pool and the context server.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate the configuration and exit.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run one script through the pool and write its body to stdout.
    Exec {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        script: PathBuf,
        /// Extra FastCGI params, `NAME=value`.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Send stdin as the request body.
        #[arg(long)]
        stdin: bool,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected NAME=value, got {raw:?}")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            build_runtime(&config)?.block_on(run(config))
        }
        Command::Check { config } => {
            let config = load_config(&config)?;
            let factory = ChannelFactory::from_config(&config.fastcgi);
            println!("config ok (FastCGI endpoint {})", factory.endpoint());
            Ok(())
        }
        Command::Exec {
            config,
            script,
            params,
            stdin,
        } => {
            let config = load_config(&config)?;
            build_runtime(&config)?.block_on(exec(config, script, params, stdin))
        }
    }
}

fn build_runtime(config: &Config) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.runtime.worker_threads {
        builder.worker_threads(threads);
    }
    builder.enable_all();
    Ok(builder.build()?)
}

async fn start_pool(config: &Config) -> Result<ConnectionPool> {
    let factory = Arc::new(ChannelFactory::from_config(&config.fastcgi));
    factory.initialize();
    if !factory.start_server().await {
        warn!(endpoint = %factory.endpoint(), "FastCGI server not started");
    }
    let settings = PoolSettings::from_config(&config.fastcgi);
    match ConnectionPool::new(factory.clone(), settings).await {
        Ok(pool) => Ok(pool),
        Err(e) => {
            factory.destroy().await;
            Err(e).context("FastCGI backend unavailable")
        }
    }
}

/// Owns a claimed context until its peer hangs up.
struct DrainHandler {
    registry: ContextRegistry,
}

#[async_trait]
impl ChannelHandler for DrainHandler {
    async fn handle(&self, mut channel: ContextChannel, context: Arc<Context>) -> Result<()> {
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            match channel.stream_mut().read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => total += n as u64,
                Err(e) => {
                    debug!(context = %context.id(), error = %e, "context channel read failed");
                    break;
                }
            }
        }
        debug!(context = %context.id(), bytes = total, "context channel closed");
        self.registry.destroy(context.id());
        Ok(())
    }
}

async fn run(config: Config) -> Result<()> {
    let _log_guard = init_logging(&config.system_log)?;
    info!(
        worker_threads = ?config.runtime.worker_threads,
        transport = ?config.fastcgi.transport,
        children = config.fastcgi.children,
        max_requests = config.fastcgi.max_requests,
        "runtime tuning"
    );

    let pool = start_pool(&config).await?;
    let registry = ContextRegistry::new();
    let reaper = registry.spawn_reaper(
        Duration::from_millis(config.context.sweep_interval_ms),
        Duration::from_millis(config.context.orphan_timeout_ms),
    );
    let server = ContextServer::new(
        config.context_server.clone(),
        registry.clone(),
        Arc::new(DrainHandler {
            registry: registry.clone(),
        }),
    );
    if config.context_server.enabled && !server.is_available().await {
        warn!("context server unavailable; peers fall back to the HTTP tunnel");
    }

    info!(endpoint = %pool.factory().endpoint(), "pjbd started");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("failed to listen for shutdown signal: {e}"))?;
    info!("shutting down");

    server.destroy().await;
    registry.shutdown();
    if let Err(e) = reaper.await {
        debug!(error = %e, "context reaper ended abnormally");
    }
    pool.destroy().await;
    Ok(())
}

fn script_params(script: &Path, body_len: Option<usize>) -> Vec<(String, String)> {
    let filename = script.display().to_string();
    let mut params = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), "pjbd".to_string()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
        ("SCRIPT_FILENAME".to_string(), filename.clone()),
        ("SCRIPT_NAME".to_string(), filename.clone()),
        ("PATH_TRANSLATED".to_string(), filename),
    ];
    match body_len {
        Some(len) => {
            params.push(("REQUEST_METHOD".into(), "POST".into()));
            params.push(("CONTENT_LENGTH".into(), len.to_string()));
            params.push((
                "CONTENT_TYPE".into(),
                "application/x-www-form-urlencoded".into(),
            ));
        }
        None => params.push(("REQUEST_METHOD".into(), "GET".into())),
    }
    params
}

async fn exec(
    config: Config,
    script: PathBuf,
    extra: Vec<(String, String)>,
    stdin: bool,
) -> Result<()> {
    let _log_guard = init_logging(&config.system_log)?;
    let script = std::fs::canonicalize(&script)
        .with_context(|| format!("script {} not found", script.display()))?;
    let body = if stdin {
        let mut body = Vec::new();
        tokio::io::stdin().read_to_end(&mut body).await?;
        Some(body)
    } else {
        None
    };

    let mut params = script_params(&script, body.as_ref().map(Vec::len));
    params.extend(extra);

    let pool = start_pool(&config).await?;
    let mut input = body.as_deref().unwrap_or_default();
    let mut output = tokio::io::stdout();
    let result = run_exchange(&pool, params, &mut input, &mut output).await;
    pool.destroy().await;

    let outcome = result?;
    info!(
        status = outcome.status,
        body_len = outcome.body_len,
        app_status = outcome.end.app_status,
        "script finished"
    );
    outcome.check_error()?;
    Ok(())
}
