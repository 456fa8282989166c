//! MUTT process entry point. A single binary, one of four roles selected
//! at startup (spec §4: each service is independently multi-replica).

mod errors;
mod ingest;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mutt_config::{DynConfig, StaticConfig};
use mutt_contracts::queue::QueueSubstrate;
use mutt_core::alerter::Alerter;
use mutt_core::forwarder::Forwarder;
use mutt_core::http_sink::HttpSink;
use mutt_core::postgres_audit_store::PostgresAuditStore;
use mutt_core::postgres_rule_store::PostgresRuleStore;
use mutt_core::redis_queue::RedisQueueSubstrate;
use mutt_core::remediation::RemediationWorker;
use mutt_core::rule_cache::RuleCache;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::IngestState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Ingest,
    Alerter,
    Forwarder,
    Remediation,
}

#[derive(Parser, Debug)]
#[command(name = "mutt-server")]
#[command(about = "MUTT monitoring-event middleware pipeline")]
struct Args {
    /// Which service role this process instance runs.
    #[arg(long, value_enum, env = "MUTT_ROLE")]
    role: Role,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mutt_server=info,mutt_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Arc::new(StaticConfig::from_env()?);

    let queue: Arc<dyn QueueSubstrate> = Arc::new(RedisQueueSubstrate::connect(&config.queue_url).await?);
    let dyn_config = DynConfig::new(queue.clone(), config.pod_id.clone(), Duration::from_secs(5));
    dyn_config.seed_defaults().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(watch_shutdown_signal(shutdown_tx));

    match args.role {
        Role::Ingest => run_ingest(config, queue, dyn_config, shutdown_rx).await,
        Role::Alerter => run_alerter(config, queue, dyn_config, shutdown_rx).await,
        Role::Forwarder => run_forwarder(config, queue, dyn_config, shutdown_rx).await,
        Role::Remediation => run_remediation(config, queue, dyn_config, shutdown_rx).await,
    }
}

async fn watch_shutdown_signal(tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    let _ = tx.send(true);
}

async fn connect_postgres(config: &StaticConfig) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .min_connections(config.pool_min_connections)
        .max_connections(config.pool_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(Into::into)
}

async fn run_ingest(
    config: Arc<StaticConfig>,
    queue: Arc<dyn QueueSubstrate>,
    dyn_config: DynConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let rate_limiter = Arc::new(mutt_core::ratelimit::SlidingWindowRateLimiter::new(queue.clone()));
    let watcher_config = dyn_config.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher_config.watch().await {
            error!(error = %e, "config watcher stream ended");
        }
    });

    let state = IngestState {
        queue,
        dyn_config,
        rate_limiter,
        static_config: config.clone(),
    };

    let app = axum::Router::new()
        .route("/ingest", axum::routing::post(ingest::ingest))
        .route("/health", axum::routing::get(ingest::health))
        .route("/metrics", axum::routing::get(ingest::metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "ingest gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

async fn run_alerter(
    config: Arc<StaticConfig>,
    queue: Arc<dyn QueueSubstrate>,
    dyn_config: DynConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let pool = connect_postgres(&config).await?;
    let rule_store = Arc::new(PostgresRuleStore::new(pool.clone()));
    let audit_store = Arc::new(PostgresAuditStore::new(pool));

    let rule_cache = Arc::new(RuleCache::new(rule_store));
    rule_cache.load_initial(10, Duration::from_secs(2)).await?;
    let refresh_handle = rule_cache
        .clone()
        .spawn_refresh_loop(dyn_config.clone(), shutdown_rx.clone());

    let watcher_config = dyn_config.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher_config.watch().await {
            error!(error = %e, "config watcher stream ended");
        }
    });

    let alerter = Alerter::new(queue, rule_cache, audit_store, dyn_config, config.pod_id.clone());
    let heartbeat = alerter.startup(shutdown_rx.clone()).await?;

    info!(pod_id = %config.pod_id, "alerter started");
    loop {
        tokio::select! {
            result = alerter.tick() => {
                if let Err(e) = result {
                    error!(error = %e, "alerter tick failed; continuing");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("alerter shutting down, waiting for grace period");
    tokio::time::timeout(config.shutdown_grace_period, heartbeat).await.ok();
    refresh_handle.abort();
    Ok(())
}

async fn run_forwarder(
    config: Arc<StaticConfig>,
    queue: Arc<dyn QueueSubstrate>,
    dyn_config: DynConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sink = Arc::new(HttpSink::new(
        config.sink_url.clone(),
        &config.sink_auth_token,
        config.sink_http_timeout,
    )?);

    let watcher_config = dyn_config.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher_config.watch().await {
            error!(error = %e, "config watcher stream ended");
        }
    });

    let forwarder = Forwarder::new(queue, sink, dyn_config, config.pod_id.clone());
    let heartbeat = forwarder.startup(shutdown_rx.clone()).await?;

    info!(pod_id = %config.pod_id, "forwarder started");
    loop {
        tokio::select! {
            result = forwarder.tick() => {
                if let Err(e) = result {
                    error!(error = %e, "forwarder tick failed; continuing");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("forwarder shutting down, waiting for grace period");
    tokio::time::timeout(config.shutdown_grace_period, heartbeat).await.ok();
    Ok(())
}

async fn run_remediation(
    config: Arc<StaticConfig>,
    queue: Arc<dyn QueueSubstrate>,
    dyn_config: DynConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sink = Arc::new(HttpSink::new(
        config.sink_url.clone(),
        &config.sink_auth_token,
        config.sink_http_timeout,
    )?);

    let worker = RemediationWorker::new(queue, sink, dyn_config.clone());
    info!("remediation worker started");

    loop {
        let interval = dyn_config
            .get_duration("remediation_interval", Duration::from_secs(30))
            .await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match worker.run_cycle().await {
                    Ok(replayed) if replayed > 0 => info!(replayed, "remediation cycle complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "remediation cycle failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    Ok(())
}
