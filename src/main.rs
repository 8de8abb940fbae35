//! Roomwatch - room reservations reconciled against live occupancy
//!
//! Runs one occupancy ticker (and optionally one sensor poller) per room,
//! the no-show and end-of-session watchers, and the metrics endpoints.
//!
//! Module structure:
//! - `domain/` - Core types (Reservation, BoundingBox, Clock)
//! - `io/` - External interfaces (sensors, room services, KPI, Prometheus)
//! - `services/` - Business logic (store, penalties, state machine, watchers)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use roomwatch::domain::Clock;
use roomwatch::infra::{Config, Metrics};
use roomwatch::io::{
    start_metrics_server, CounterOccupancySource, DetectionSource, HttpDetectionSource,
    HttpRoomServices, KpiLog, LocalMatcher, MetricsSources, RoomServices,
};
use roomwatch::services::{
    ArrivalWindows, CrossingProcessor, LineTracker, OccupancyBoard, OccupancyFilter,
    PenaltyLedger, ReservationStore, RoomRegistry, RoomTicker, SensorPoller, WatchBoard, Watchers,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Roomwatch - reservation and occupancy reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "roomwatch", version, about)]
struct Args {
    /// Path to TOML configuration file (defaults to $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default level INFO, RUST_LOG=debug for per-tick visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "roomwatch starting");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        rooms = ?config.rooms(),
        utc_offset_minutes = %config.utc_offset_minutes(),
        tick_interval_ms = %config.tick_interval().as_millis(),
        detection_url = ?config.detection_url(),
        kpi_bucket = %config.kpi_bucket(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let clock = Arc::new(Clock::new(config.utc_offset_minutes())?);
    if let Some(start) = config.simulated_start() {
        let sim_now = clock.parse(start).context("invalid clock.simulated_start")?;
        clock.set_simulated(sim_now, config.clock_scale())?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let timing = config.room_timing();
    let watcher_settings = config.watcher_settings();
    let service_settings = config.service_settings();

    let store = Arc::new(ReservationStore::in_memory(config.buffer(), clock.offset()));
    let ledger = Arc::new(PenaltyLedger::in_memory(config.penalty_policy()));
    let registry = Arc::new(RoomRegistry::new(store.clone(), ledger, timing));
    let occupancy = Arc::new(OccupancyBoard::new());
    let board = Arc::new(WatchBoard::new());
    let kpi = Arc::new(KpiLog::new(config.kpi_log_path(), config.kpi_bucket()));
    let metrics = Arc::new(Metrics::new());

    let matcher = LocalMatcher {
        store: store.clone(),
        arrival_before: timing.arrival_before,
        no_show_grace: watcher_settings.no_show_grace,
    };
    let services: Arc<dyn RoomServices> = Arc::new(
        HttpRoomServices::from_settings(&service_settings)
            .context("failed to build room services client")?
            .with_local_matcher(matcher),
    );

    let windows = ArrivalWindows {
        before: timing.arrival_before,
        after: timing.arrival_after,
        no_show_grace: watcher_settings.no_show_grace,
    };

    for room in config.rooms() {
        let counter = occupancy.counter(room);

        let ticker = RoomTicker::new(
            room.clone(),
            Arc::new(CounterOccupancySource::new(counter.clone())),
            OccupancyFilter::new(config.filter_settings()),
            registry.clone(),
            board.clone(),
            clock.clone(),
            metrics.clone(),
            config.tick_interval(),
        );
        tokio::spawn(ticker.run(shutdown_rx.clone()));

        // without a detection endpoint occupancy only moves via manual overrides
        let Some(url) = config.detection_url() else {
            warn!(room_id = %room, "sensor_poller_disabled");
            continue;
        };
        let source: Arc<dyn DetectionSource> =
            Arc::new(HttpDetectionSource::new(url, service_settings.timeout)?);
        let processor = CrossingProcessor::new(
            room.clone(),
            counter,
            board.clone(),
            services.clone(),
            kpi.clone(),
            metrics.clone(),
            config.confidence_min(),
            windows,
        );
        let poller = SensorPoller::new(
            source,
            LineTracker::new(config.line_settings()),
            processor,
            clock.clone(),
            metrics.clone(),
            config.poll_fps(),
        );
        tokio::spawn(poller.run(shutdown_rx.clone()));
    }

    let watchers = Watchers {
        settings: watcher_settings,
        store,
        board,
        occupancy: occupancy.clone(),
        services,
        kpi,
        metrics: metrics.clone(),
        clock,
    };
    tokio::spawn(watchers.clone().run_no_show_watcher(shutdown_rx.clone()));
    tokio::spawn(watchers.run_end_watcher(shutdown_rx.clone()));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let sources = MetricsSources {
            site_id: Arc::new(config.site_id().to_string()),
            metrics: metrics.clone(),
            occupancy: occupancy.clone(),
            registry: registry.clone(),
        };
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(prometheus_port, sources, prom_shutdown).await {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {}
            }
            let snapshots = occupancy.snapshot_all();
            let total: u64 = snapshots.iter().map(|(_, s)| u64::from(s.occupancy)).sum();
            metrics.report(snapshots.len(), total).log();
        }
    });

    info!(rooms = %config.rooms().len(), "roomwatch_started");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    info!("roomwatch shutdown complete");
    Ok(())
}
