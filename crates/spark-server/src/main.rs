//! # spark-server
//!
//! Real-time chat delivery for matched pairs.
//!
//! This binary provides:
//! - **WebSocket chat sessions** with participant checks, fan-out, typing and
//!   seen signals
//! - **Write-behind buffering** of messages in Redis (or memory) with
//!   token-guarded batch flushes into the durable SQLite record
//! - **Delayed flush triggers** through QStash, or an in-process scheduler
//!   when no QStash token is configured
//! - **REST API** (axum) for health checks and the signed flush webhook
//! - **Rate limiting** per client address on HTTP, and per participant and
//!   per chat on socket commands

mod api;
mod auth;
mod config;
mod connection;
mod error;
mod flush;
mod jwt;
mod rate_limit;
mod scheduler;
mod session;
mod signature;
mod sweep;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use spark_buffer::{BufferStore, MemoryBuffer, RedisBuffer};
use spark_shared::keys::KeySpace;
use spark_store::{ChatRepository, Database, SqliteRepository};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::flush::{FlushCoordinator, FlushSettings};
use crate::scheduler::{FlushScheduler, LocalScheduler, QStashScheduler};
use crate::session::ChatServices;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,spark_server=debug")),
        )
        .init();

    info!("Starting Spark chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.jwt_secret.is_none() {
        tracing::warn!("JWT_SECRET is not set, every chat socket will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable record (runs migrations on open)
    let db = Database::open_at(&config.database_path)?;
    let repo: Arc<dyn ChatRepository> = Arc::new(SqliteRepository::new(db));

    // Buffer store: Redis when configured, process memory otherwise
    let subscriptions = config.subscription_options();
    let buffer: Arc<dyn BufferStore> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis buffer");
            let keys = KeySpace::new(config.key_namespace.clone());
            Arc::new(RedisBuffer::open(url, keys)?.with_subscription_options(subscriptions))
        }
        None => {
            info!("REDIS_URL not set, using in-memory buffer");
            Arc::new(MemoryBuffer::with_subscription_options(subscriptions))
        }
    };

    // Delayed triggers: QStash when a token is configured, in-process otherwise
    let mut local_jobs = None;
    let scheduler: Arc<dyn FlushScheduler> = match &config.qstash_token {
        Some(token) => {
            let qstash = QStashScheduler::new(
                config.qstash_url.clone(),
                token.clone(),
                config.backend_url.clone(),
            )?;
            info!(publish_url = %qstash.publish_url(), "Using QStash flush scheduler");
            Arc::new(qstash)
        }
        None => {
            info!("QSTASH_TOKEN not set, using in-process flush scheduler");
            let (local, rx) = LocalScheduler::channel();
            local_jobs = Some(rx);
            Arc::new(local)
        }
    };

    let flush = Arc::new(FlushCoordinator::new(
        buffer.clone(),
        repo.clone(),
        scheduler,
        FlushSettings {
            batch_size: config.flush_batch_size,
            idle_delay: config.flush_idle,
        },
    ));

    let services = ChatServices {
        buffer: buffer.clone(),
        repo,
        flush: flush.clone(),
    };

    let sweep_interval = config.sweep_interval;
    let http_addr = config.http_addr;
    let app_state = AppState::new(services, config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    if let Some(rx) = local_jobs {
        tokio::spawn(scheduler::run_local_jobs(rx, flush.clone()));
    }

    // Active-chat sweep recovers buffers whose trigger was lost
    tokio::spawn(sweep::run_sweep(buffer, flush, sweep_interval));

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_limiter = app_state.rate_limiter.clone();
    let command_limiter = app_state.command_limiter.clone();
    tokio::spawn(async move {
        let idle = std::time::Duration::from_secs(600);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted =
                http_limiter.evict_idle(idle).await + command_limiter.evict_idle(idle).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted idle rate limit buckets");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
