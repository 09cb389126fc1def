use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::caller::RequestEvent;
use tollgate::clock::MockClock;
use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::ratelimit::{RateLimiter, Tier, Verdict};
use tollgate::sink::TracingSink;
use tollgate::store::{MemoryStore, SharedStore};
use tollgate::SecurityPipeline;

/// Distributed rate limiting and abuse detection.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML). `TOLLGATE__*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Log filter, e.g. `info` or `tollgate=debug`. Defaults to `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// Run JSON-lines request events through the limiter and pipeline
    Replay {
        /// Input file; standard input when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

/// One replayed request. `class` defaults to the endpoint.
#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(flatten)]
    event: RequestEvent,
    #[serde(default)]
    class: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerdictLine<'a> {
    caller_id: &'a str,
    class: &'a str,
    verdict: Verdict,
    allowed: bool,
    remaining: u64,
    limit: u64,
    tier: Option<Tier>,
    retry_after_ms: Option<u128>,
    degraded: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.log_level.as_deref())?;

    let config = TollgateConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Command::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Replay { input } => replay(config, input).await,
    }
}

fn init_tracing(format: LogFormat, level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("Invalid log level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

async fn connect_store(
    config: &TollgateConfig,
    clock: &MockClock,
) -> anyhow::Result<Arc<dyn SharedStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())))),
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store = tollgate::store::RedisStore::connect_with_config(
                &config.store.redis_url,
                tollgate::store::RedisStoreConfig {
                    key_prefix: config.store.key_prefix.clone(),
                },
            )
            .await
            .context("Failed to connect to Redis")?
            .with_clock(Arc::new(clock.clone()));
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => {
            anyhow::bail!("the redis backend requires the `redis-store` feature")
        }
    }
}

/// Replay events in file order. Time follows the event timestamps so window
/// rollovers and block expiry behave as they did when the events happened.
async fn replay(config: TollgateConfig, input: Option<PathBuf>) -> anyhow::Result<()> {
    let clock = MockClock::at_unix(0);
    let store = connect_store(&config, &clock).await?;
    let limiter = Arc::new(
        RateLimiter::from_config(store, &config).with_clock(Arc::new(clock.clone())),
    );
    let pipeline = SecurityPipeline::start(&config, Arc::clone(&limiter), Arc::new(TracingSink));

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = LinesStream::new(BufReader::new(reader).lines());

    info!(backend = ?config.store.backend, "Replaying request events");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut replayed = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else { break };
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        let ReplayLine { event, class } = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event");
                continue;
            }
        };
        let class = class.unwrap_or_else(|| event.endpoint.clone());

        clock.set(event.timestamp);
        let result = limiter.check(&event.caller_id, &class).await;
        let verdict = VerdictLine {
            caller_id: event.caller_id.as_str(),
            class: &class,
            verdict: result.verdict,
            allowed: result.allowed,
            remaining: result.remaining,
            limit: result.limit,
            tier: result.tier,
            retry_after_ms: result.retry_after.map(|d| d.as_millis()),
            degraded: result.degraded,
        };
        println!("{}", serde_json::to_string(&verdict)?);

        pipeline.record_outcome(event);
        replayed += 1;
    }

    pipeline.shutdown().await;

    let metrics = limiter.metrics().snapshot();
    info!(replayed, metrics = ?metrics, "Replay finished");
    if metrics.is_degraded() {
        warn!(
            fail_open = metrics.fail_open,
            events_dropped = metrics.events_dropped,
            "Replay ran in degraded mode"
        );
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
