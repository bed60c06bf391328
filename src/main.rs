use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kvflow::config::KvflowConfig;
use kvflow::queue::{ConsumerPool, IdlePolicy, LoggingHandler, Producer, Task};
use kvflow::ratelimit::{RateLimiter, RequestIdentity};
use kvflow::store::RedisStore;

const PAYLOAD_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Parser)]
#[command(name = "kvflow", version, about = "Rate limiter and work queue on Redis")]
struct Cli {
    /// YAML configuration file; KVFLOW__SECTION__FIELD variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

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
    /// Enqueue tasks with random payloads
    Produce {
        #[arg(short = 'n', long, default_value_t = 50)]
        count: usize,
    },
    /// Drain the queue with a pool of consumers until interrupted
    Consume {
        /// Overrides queue.consumer_count
        #[arg(long)]
        consumers: Option<usize>,
        /// Stop each consumer after its first idle timeout
        #[arg(long)]
        exit_when_idle: bool,
    },
    /// Fire requests from random client addresses at the rate limiter
    Simulate {
        #[arg(long, default_value_t = 3)]
        clients: usize,
        #[arg(long, default_value_t = 20)]
        requests: usize,
    },
    /// Show where an identity stands against its limit
    Status { identity: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = KvflowConfig::load(cli.config.as_deref())?;
    info!(
        host = %config.store.host,
        port = config.store.port,
        queue = %config.queue.queue_key,
        "Configuration loaded"
    );

    let store = Arc::new(
        RedisStore::connect_with_retry(
            config.store.connection_info()?,
            &config.store.retry.policy(),
        )
        .await?,
    );

    match cli.command {
        Command::Produce { count } => {
            let producer = Producer::from_config(store, &config.queue);
            for _ in 0..count {
                let task = Task::new(random_payload(10));
                let len = producer.enqueue(&task).await?;
                info!(task_id = %task.id, queue_len = len, "Produced");
            }
            info!(count, "Producer finished adding tasks");
        }
        Command::Consume {
            consumers,
            exit_when_idle,
        } => {
            if let Some(n) = consumers {
                config.queue.consumer_count = n;
            }
            if exit_when_idle {
                config.queue.idle_policy = IdlePolicy::Exit;
            }

            let pool = ConsumerPool::spawn(store, &config.queue, Arc::new(LoggingHandler))?;
            let stats = pool.run_until(shutdown_signal()).await?;
            for (i, s) in stats.iter().enumerate() {
                info!(
                    consumer = %format!("C{}", i),
                    processed = s.processed,
                    failed = s.failed,
                    malformed = s.malformed,
                    "Consumer summary"
                );
            }
        }
        Command::Simulate { clients, requests } => {
            let limiter = RateLimiter::new(store, &config.rate_limiting)?;
            let identities = random_identities(clients);

            for _ in 0..requests {
                let Some(identity) = identities.choose(&mut rand::thread_rng()).cloned() else {
                    break;
                };
                if limiter.admit(&identity).await?.is_allowed() {
                    info!(identity = %identity, "Accepted");
                } else {
                    warn!(identity = %identity, "429 Too Many Requests");
                }
            }
        }
        Command::Status { identity } => {
            let limiter = RateLimiter::new(store, &config.rate_limiting)?;
            let identity = RequestIdentity::new(identity);
            let status = limiter.status(&identity).await?;
            info!(
                identity = %identity,
                count = status.count,
                limit = status.limit,
                remaining = status.remaining,
                reset_after_secs = status.reset_after.map(|d| d.as_secs()),
                blocked = status.is_blocked(),
                "Rate limit status"
            );
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn random_payload(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| *PAYLOAD_LETTERS.choose(&mut rng).unwrap_or(&b'x') as char)
        .collect()
}

fn random_identities(count: usize) -> Vec<RequestIdentity> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let addr = Ipv4Addr::new(rng.gen(), rng.gen(), rng.gen(), rng.gen());
            RequestIdentity::from(IpAddr::V4(addr))
        })
        .collect()
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
