use crate::config::EvaluatorConfig;
use crate::error::{Result, ServerError};
use crate::ingest::{IdentityCache, Ingest};
use crate::notifier::WebhookNotifier;
use crate::state::AppState;
use crate::tsdb::PromTsdb;
use crate::{api, logging};
use axum::middleware;
use axum::Router;
use chrono::Utc;
use futures::future::join_all;
use ringwatch_alert::{
    Evaluator, EvaluatorParts, EventStore, MuteIndex, NotifyRequest, NotifyScheduler, PersistPolicy,
    RuleStore, StateTable, Sweeper, TsdbClient, WindowStore,
};
use ringwatch_cluster::{
    ConnPool, DispatchConfig, Dispatcher, Membership, MembershipConfig, PoolConfig, RingHandle,
};
use ringwatch_common::shutdown::{self, ShutdownSignal};
use ringwatch_common::stats::Stats;
use ringwatch_storage::{ConfigStore, SqliteConfigStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn build_http_app(state: AppState) -> Router {
    api::routes()
        .layer(middleware::from_fn(logging::request_logging))
        .with_state(state)
}

/// Every long-lived component of one evaluator, wired together.
pub struct Components {
    pub instance_id: String,
    pub cluster: String,
    pub store: Arc<dyn ConfigStore>,
    pub stats: Arc<Stats>,
    pub membership: Arc<Membership>,
    pub ring: Arc<RingHandle>,
    pub pool: Arc<ConnPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub rules: Arc<RuleStore>,
    pub mutes: Arc<MuteIndex>,
    pub windows: Arc<WindowStore>,
    pub states: Arc<StateTable>,
    pub events: Arc<EventStore>,
    pub scheduler: Arc<NotifyScheduler>,
    pub evaluator: Arc<Evaluator>,
    pub sweeper: Arc<Sweeper>,
    pub ingest: Arc<Ingest>,
    start_time: chrono::DateTime<Utc>,
}

impl Components {
    /// Wires the pipeline on top of `store`. Nothing is spawned; the
    /// receiver carries notification requests for the notifier.
    pub fn build(
        config: &EvaluatorConfig,
        store: Arc<dyn ConfigStore>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<(Self, mpsc::Receiver<NotifyRequest>)> {
        let instance_id = config.effective_instance_id();
        let cluster = config.cluster.name.clone();
        let stats = Arc::new(Stats::default());

        let membership = Arc::new(Membership::new(
            MembershipConfig {
                instance_id: instance_id.clone(),
                cluster: cluster.clone(),
                endpoint: config.advertise_url(),
                heartbeat_interval: config.cluster.heartbeat_interval,
                liveness_ttl: config.cluster.liveness_ttl,
            },
            store.clone(),
            stats.clone(),
        ));
        let ring = Arc::new(RingHandle::new(config.cluster.vnodes));
        let pool = Arc::new(ConnPool::new(
            PoolConfig {
                max_active: config.pool.max_active,
                max_idle: config.pool.max_idle,
                dial_timeout: config.pool.dial_timeout,
                call_timeout: config.pool.call_timeout,
            },
            &instance_id,
            membership.subscribe(),
        ));

        let rules = Arc::new(RuleStore::new(store.clone(), &cluster, stats.clone()));
        let mutes = Arc::new(MuteIndex::new(store.clone()));
        let windows = Arc::new(WindowStore::new(
            config.alert.window_shards,
            config.alert.window_max_points,
        ));
        let states = Arc::new(StateTable::new());
        let events = Arc::new(EventStore::new(
            &instance_id,
            store.clone(),
            config.alert.dead_letter_max,
            PersistPolicy::default(),
            stats.clone(),
        ));

        let (notify_tx, notify_rx) = mpsc::channel(config.alert.notify_buffer);
        let scheduler = Arc::new(NotifyScheduler::new(
            &cluster,
            events.clone(),
            rules.clone(),
            mutes.clone(),
            notify_tx,
            config.alert.notify_scan_interval,
            stats.clone(),
        ));

        let tsdb: Option<Arc<dyn TsdbClient>> = match config.tsdb.url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let client: Arc<dyn TsdbClient> = Arc::new(PromTsdb::new(url, config.tsdb.timeout)?);
                Some(client)
            }
            _ => None,
        };

        let evaluator = Arc::new(Evaluator::new(EvaluatorParts {
            instance_id: instance_id.clone(),
            cluster: cluster.clone(),
            rules: rules.clone(),
            windows: windows.clone(),
            states: states.clone(),
            events: events.clone(),
            notifier: scheduler.clone(),
            ring: ring.clone(),
            tsdb,
            stats: stats.clone(),
        }));
        let sweeper = Arc::new(Sweeper::new(
            rules.clone(),
            windows.clone(),
            states.clone(),
            events.clone(),
            mutes.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            &instance_id,
            DispatchConfig {
                queue_max: config.dispatch.queue_max,
                read_batch: config.dispatch.read_batch,
                send_retries: config.dispatch.send_retries,
                send_retry_interval: config.dispatch.send_retry_interval,
            },
            ring.clone(),
            pool.clone(),
            evaluator.clone(),
            stats.clone(),
            shutdown,
        ));
        let ingest = Arc::new(Ingest::new(
            config.ingest.max_offset,
            IdentityCache::new(
                store.clone(),
                config.ingest.identity_cache_size,
                config.ingest.identity_cache_ttl,
                stats.clone(),
            ),
            dispatcher.clone(),
            stats.clone(),
        ));

        let components = Self {
            instance_id,
            cluster,
            store,
            stats,
            membership,
            ring,
            pool,
            dispatcher,
            rules,
            mutes,
            windows,
            states,
            events,
            scheduler,
            evaluator,
            sweeper,
            ingest,
            start_time: Utc::now(),
        };
        Ok((components, notify_rx))
    }

    pub fn state(&self) -> AppState {
        AppState {
            instance_id: self.instance_id.clone(),
            cluster: self.cluster.clone(),
            ingest: self.ingest.clone(),
            local: self.evaluator.clone(),
            ring: self.ring.clone(),
            rules: self.rules.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            start_time: self.start_time,
        }
    }

    /// First heartbeat, ring, rules, mutes and restored events, before any
    /// traffic is accepted.
    pub async fn startup(&self) -> Result<()> {
        let roster = self
            .membership
            .heartbeat_once(ringwatch_common::now_secs())
            .map_err(|e| {
                if e.is_fatal() {
                    ServerError::Fatal(e.to_string())
                } else {
                    ServerError::StoreUnavailable(e.to_string())
                }
            })?;
        self.dispatcher.apply_roster(&roster).await;

        let snapshot = self
            .rules
            .refresh()
            .map_err(|e| ServerError::StoreUnavailable(e.to_string()))?;
        self.mutes
            .refresh()
            .map_err(|e| ServerError::StoreUnavailable(e.to_string()))?;

        let restored = self.evaluator.restore().await.map_err(|e| {
            if e.is_fatal() {
                ServerError::Fatal(e.to_string())
            } else {
                ServerError::StoreUnavailable(e.to_string())
            }
        })?;

        tracing::info!(
            instance_id = %self.instance_id,
            cluster = %self.cluster,
            peers = roster.peers().len(),
            rules = snapshot.rules.len(),
            broken_rules = snapshot.broken.len(),
            restored_events = restored,
            "Evaluator initialized"
        );
        Ok(())
    }
}

async fn log_stats(stats: Arc<Stats>, every: Duration, mut shutdown: ShutdownSignal) {
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let s = stats.snapshot();
                tracing::info!(
                    received = s.points_received,
                    invalid = s.points_invalid,
                    local = s.points_local,
                    remote = s.points_remote,
                    queue_dropped = s.queue_dropped,
                    batches_sent = s.batches_sent,
                    batches_dropped = s.batches_dropped,
                    out_of_order = s.window_out_of_order,
                    rules_broken = s.rules_broken,
                    fired = s.events_fired,
                    recovered = s.events_recovered,
                    notified = s.notify_emitted,
                    muted = s.notify_muted,
                    store_errors = s.store_errors,
                    dead_letters = s.dead_letters,
                    tsdb_errors = s.tsdb_errors,
                    missed_ticks = s.eval_missed_ticks,
                    "Pipeline stats"
                );
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Runs one evaluator until Ctrl-C or a fatal error.
pub async fn run(config: EvaluatorConfig) -> Result<()> {
    let store: Arc<dyn ConfigStore> = Arc::new(
        SqliteConfigStore::open(Path::new(&config.store))
            .map_err(|e| ServerError::StoreUnavailable(e.to_string()))?,
    );
    let (trigger, shutdown) = shutdown::channel();
    let (app, notify_rx) = Components::build(&config, store, shutdown.clone())
        .map_err(|e| ServerError::Config(format!("{e:#}")))?;
    let notifier = WebhookNotifier::new(config.notify.webhook_url.as_deref(), config.notify.timeout)
        .map_err(|e| ServerError::Config(format!("{e:#}")))?;

    app.startup().await?;

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| ServerError::Fatal(format!("cannot listen on {}: {e}", config.listen)))?;
    let router = build_http_app(app.state());

    let mut membership_task = tokio::spawn(app.membership.clone().run(shutdown.clone()));
    let mut handles: Vec<JoinHandle<()>> = vec![
        tokio::spawn(
            app.dispatcher
                .clone()
                .run(app.membership.subscribe(), shutdown.clone()),
        ),
        tokio::spawn(app.rules.clone().run(
            app.mutes.clone(),
            config.alert.rule_refresh_interval,
            shutdown.clone(),
        )),
        tokio::spawn(app.evaluator.clone().run(shutdown.clone())),
        tokio::spawn(app.scheduler.clone().run(shutdown.clone())),
        tokio::spawn(
            app.sweeper
                .clone()
                .run(config.alert.gc_interval, shutdown.clone()),
        ),
        tokio::spawn(notifier.run(notify_rx, shutdown.clone())),
        tokio::spawn(log_stats(
            app.stats.clone(),
            config.alert.gc_interval,
            shutdown.clone(),
        )),
    ];
    let mut http_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { http_shutdown.recv().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "HTTP server error");
        }
    }));

    tracing::info!(listen = %config.listen, advertise = %config.advertise_url(), "Evaluator started");

    let fatal = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully");
            None
        }
        res = &mut membership_task => match res {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("membership task failed: {e}")),
        },
    };
    trigger.trigger();

    let drain = async {
        join_all(handles).await;
        app.dispatcher.join_writers().await;
        app.events.retry_dead_letters().await
    };
    match tokio::time::timeout(config.shutdown_grace, drain).await {
        Ok(0) => {}
        Ok(left) => tracing::warn!(dead_letters = left, "Unpersisted event writes left at shutdown"),
        Err(_) => tracing::warn!(
            grace_ms = config.shutdown_grace.as_millis() as u64,
            "Shutdown grace period elapsed"
        ),
    }
    membership_task.abort();

    match fatal {
        Some(reason) => {
            tracing::error!(reason = %reason, "Evaluator stopped on fatal error");
            Err(ServerError::Fatal(reason))
        }
        None => {
            tracing::info!("Evaluator stopped");
            Ok(())
        }
    }
}
