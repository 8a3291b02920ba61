//! Gateway entry point (Supervisor, §4.8): loads config, connects MQTT and
//! SQLite, wires up the Registry, Pipeline, durable Sink, Subscriber Hub, and
//! Alert Engine, then drives the top-level event loop.
//!
//! Safety features:
//! - Signal handling: SIGTERM/SIGINT triggers the five-step graceful
//!   shutdown below rather than an abrupt exit.
//! - MQTT re-subscribe on every reconnect, exponential backoff on error.
//! - Data retention: periodic pruning of old readings.
//! - Idle device eviction: periodic sweep of devices with no traffic.

mod alerts;
mod codec;
mod config;
mod db;
mod error;
mod hub;
mod ingest;
mod metrics;
mod pipeline;
mod registry;
mod sink;
mod state;
mod web;

use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use alerts::{AlertEngine, Rule};
use config::Config;
use db::Db;
use registry::{DeviceKind, Registry, UnknownDevicePolicy};
use sink::{DurableSink, SqliteSink};
use state::SystemState;
use web::AppState;

/// Data retention pruning interval (6 hours).
const PRUNE_INTERVAL_SEC: u64 = 6 * 3600;

/// Default data retention period in days.
const RETENTION_DAYS: i64 = 90;

/// How often the idle-device eviction sweep runs.
const IDLE_EVICT_INTERVAL_SEC: u64 = 3600;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = Config::load(std::path::Path::new(&config_path))
        .with_context(|| format!("failed to load config from {config_path}"))?;

    // ── Database ────────────────────────────────────────────────────
    let db = Arc::new(
        Db::connect(&cfg.db_url)
            .await
            .context("failed to connect to sqlite database")?,
    );
    db.migrate().await.context("failed to run migrations")?;

    // ── Registry, seeded from config ───────────────────────────────
    let unknown_policy = UnknownDevicePolicy::parse(&cfg.registry.unknown_device_policy);
    let registry = Arc::new(Registry::new(cfg.registry.shards, unknown_policy));
    for seed in &cfg.file.devices {
        registry
            .seed(
                &seed.device_id,
                DeviceKind::parse(&seed.kind),
                seed.credentials_fingerprint.clone(),
            )
            .await;
        db.upsert_device(
            &seed.device_id,
            &seed.kind,
            seed.credentials_fingerprint.as_deref(),
            time::OffsetDateTime::now_utc().unix_timestamp(),
        )
        .await
        .with_context(|| format!("failed to persist seed device {}", seed.device_id))?;
    }
    info!(devices = cfg.file.devices.len(), "registry seeded");

    // ── Alert rules, parsed from config ────────────────────────────
    let mut rules = Vec::with_capacity(cfg.file.alert_rules.len());
    for entry in &cfg.file.alert_rules {
        rules.push(Rule::from_entry(entry).with_context(|| format!("rule {}", entry.rule_id))?);
    }
    info!(rules = rules.len(), "alert rules loaded");

    let shared: state::SharedState = Arc::new(RwLock::new(SystemState::new()));

    let alert_sink: Arc<dyn alerts::AlertSink> = Arc::new(alerts::DbAlertSink::new(Arc::clone(&db)));
    let alerts = Arc::new(AlertEngine::with_sink_and_state(
        rules,
        alert_sink,
        Arc::clone(&shared),
    ));
    let missing_data_handle = tokio::spawn(Arc::clone(&alerts).run_missing_data_wheel());

    // ── Durable sink ────────────────────────────────────────────────
    let sink: Arc<dyn DurableSink> = SqliteSink::spawn(
        Arc::clone(&db),
        cfg.durable.wab_capacity,
        cfg.durable.batch_size,
        cfg.durable.batch_age,
        cfg.durable.retry_backoff_min,
        cfg.durable.retry_backoff_max,
    );

    // ── Subscriber hub ──────────────────────────────────────────────
    let hub = Arc::new(hub::SubscriberHub::new(
        cfg.subscribers.outbox_capacity,
        &cfg.subscribers.drop_policy,
    ));

    // ── Pipeline ────────────────────────────────────────────────────
    let (pipeline, shard_handles) = pipeline::spawn(
        cfg.pipeline.shards,
        cfg.pipeline.device_queue,
        Arc::clone(&registry),
        Arc::clone(&sink),
        Arc::clone(&hub),
        Arc::clone(&alerts),
    );

    // ── Ingest front-end state ──────────────────────────────────────
    let limiter = Arc::new(ingest::KeyedRateLimiter::new(cfg.registry.shards, 50.0, 10.0));
    let ingest_state = Arc::new(ingest::http::IngestState {
        registry: Arc::clone(&registry),
        pipeline: pipeline.clone(),
        limiter: Arc::clone(&limiter),
        auth_token: cfg.http.auth_token.clone(),
        shared: Arc::clone(&shared),
    });

    let mqtt_connected = Arc::new(AtomicBool::new(false));
    let metrics_handle = Arc::new(metrics::install());

    let app_state = AppState {
        shared: Arc::clone(&shared),
        registry: Arc::clone(&registry),
        sink: Arc::clone(&sink),
        alerts: Arc::clone(&alerts),
        hub: Arc::clone(&hub),
        ingest: Arc::clone(&ingest_state),
        metrics_handle: Arc::clone(&metrics_handle),
        mqtt_connected: Arc::clone(&mqtt_connected),
    };

    // ── MQTT ingest task ────────────────────────────────────────────
    let mqtt_shutdown = CancellationToken::new();
    let (mqtt_client, mqtt_eventloop) = ingest::mqtt::build_client(&cfg.mqtt);
    let mqtt_handle = tokio::spawn(ingest::mqtt::run(
        mqtt_client,
        mqtt_eventloop,
        cfg.mqtt.clone(),
        Arc::clone(&registry),
        pipeline.clone(),
        Arc::clone(&limiter),
        Arc::clone(&mqtt_connected),
        Arc::clone(&shared),
        mqtt_shutdown.clone(),
    ));

    // ── HTTP server task ────────────────────────────────────────────
    let http_bind = cfg.http.bind.clone();
    let http_shutdown = CancellationToken::new();
    let http_shutdown_for_task = http_shutdown.clone();
    let web_handle = tokio::spawn(async move {
        web::serve(&http_bind, app_state, http_shutdown_for_task).await;
    });

    // ── Retention pruner ────────────────────────────────────────────
    let prune_db = Arc::clone(&db);
    let prune_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(PRUNE_INTERVAL_SEC));
        loop {
            tick.tick().await;
            let cutoff = time::OffsetDateTime::now_utc().unix_timestamp() - RETENTION_DAYS * 86_400;
            match prune_db.prune_old_readings(cutoff).await {
                Ok(n) => info!(pruned = n, "retention sweep complete"),
                Err(e) => error!("retention sweep failed: {e:#}"),
            }
        }
    });

    // ── Idle device eviction sweep ──────────────────────────────────
    let evict_registry = Arc::clone(&registry);
    let idle_evict_secs = cfg.registry.idle_evict_after.as_secs() as i64;
    let evict_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(IDLE_EVICT_INTERVAL_SEC));
        loop {
            tick.tick().await;
            let evicted = evict_registry.evict_idle(idle_evict_secs).await;
            if evicted > 0 {
                info!(evicted, "idle device eviction swept stale devices");
            }
        }
    });

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    let mut mqtt_died = false;
    let mut web_died = false;

    loop {
        tokio::select! {
            result = &mut mqtt_handle => {
                error!("CRITICAL: mqtt ingest task exited unexpectedly: {result:?}");
                mqtt_died = true;
                exit_reason = "mqtt task died";
                break;
            }
            result = &mut web_handle => {
                error!("CRITICAL: http server task exited unexpectedly: {result:?}");
                web_died = true;
                exit_reason = "http task died";
                break;
            }
            result = &mut prune_handle => {
                error!("retention pruner task exited unexpectedly: {result:?}");
                // Not safety-critical; log and continue.
            }
            result = &mut evict_handle => {
                error!("idle eviction task exited unexpectedly: {result:?}");
                // Not safety-critical; log and continue.
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown (§4.8, five steps) ─────────────────────────
    warn!(signal = exit_reason, "shutting down");
    shared.write().await.shutting_down = true;

    // 1. Stop ingest: cancel the MQTT loop and tell the HTTP server to stop
    //    accepting new connections. Both tasks hold their own clone of the
    //    PipelineHandle, so joining them here is what actually drops those
    //    clones — essential before step 2 can close the shard channels. Skip
    //    joining a handle that already resolved above (double-polling a
    //    completed `JoinHandle` panics).
    mqtt_shutdown.cancel();
    http_shutdown.cancel();
    if !mqtt_died {
        let _ = mqtt_handle.await;
    }
    if !web_died {
        let _ = web_handle.await;
    }

    // 2. Drain pipeline shards: dropping the last PipelineHandle (ingest_state's
    //    clone, then this one) closes every shard's mpsc sender, which ends
    //    each `run_shard` loop once its queue empties of in-flight work.
    drop(ingest_state);
    drop(pipeline);
    for handle in shard_handles {
        let _ = handle.await;
    }

    // 3. Flush the write-ahead buffer with a deadline; anything still
    //    unflushed after that is counted as lost (§4.8, §6 metric).
    let lost = sink.drain(cfg.shutdown.drain_deadline).await;
    if lost > 0 {
        warn!(lost, "shutdown: readings lost after drain deadline");
        metrics::record_shutdown_lost_readings(lost as u64);
    }

    // 4. Close all WebSocket subscribers.
    hub.close_all().await;

    // 5. The missing-data wheel driver has no natural end (it outlives every
    //    reset_tx clone); stop it explicitly rather than leak the task.
    missing_data_handle.abort();

    info!("shutdown complete");
    Ok(())
}
