//! Roomwatch offline scenario - replays one reservation on a simulated timeline
//!
//! Everything runs in memory: synthetic detection frames go through the line
//! tracker, the occupancy filter feeds the room state machine, and the
//! watchers scan the same timeline. Each simulated minute prints one JSON line.
//!
//! Usage:
//!   cargo run --bin roomwatch-scenario -- --mode visit
//!   cargo run --bin roomwatch-scenario -- --mode no-show --minutes 40
//!   cargo run --bin roomwatch-scenario -- --mode qr

use anyhow::Context;
use clap::{Parser, ValueEnum};
use roomwatch::domain::{BoundingBox, Clock, ReservationStatus, RoomId, Timestamp, UserId};
use roomwatch::infra::{Config, Metrics};
use roomwatch::io::{KpiLog, LocalMatcher, MockRoomServices, RoomServices};
use roomwatch::services::watchers::WatchAction;
use roomwatch::services::{
    ArrivalWindows, CrossingProcessor, LineTracker, OccupancyBoard, OccupancyFilter,
    PenaltyLedger, ReservationStore, RoomRegistry, WatchBoard, Watchers,
};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Guest walks in shortly after start and leaves before the end
    Visit,
    /// Nobody ever shows up
    NoShow,
    /// Guest scans in at the door before walking in
    Qr,
}

#[derive(Parser, Debug)]
#[command(name = "roomwatch-scenario", version, about)]
struct Args {
    #[arg(short, long, value_enum, default_value = "visit")]
    mode: Mode,

    /// Path to TOML configuration file (defaults to $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Reservation start, RFC 3339 or naive local time
    #[arg(long, default_value = "2026-04-01T10:00:00")]
    start: String,

    /// Reservation length in minutes
    #[arg(long, default_value_t = 30)]
    length: i64,

    /// Simulated minutes to replay, starting 5 minutes before the reservation
    #[arg(long, default_value_t = 60)]
    minutes: i64,
}

#[derive(Serialize)]
struct Step {
    ts: String,
    minute: i64,
    crossings: usize,
    occupancy: u32,
    is_occupied: bool,
    state: String,
    reservation_status: String,
    penalty_points: u32,
    actions: Vec<String>,
}

const ENTER_OFFSET_MIN: i64 = 2;
const EXIT_BEFORE_END_MIN: i64 = 5;

/// Detection box centred at `cy`, tall enough that 20px steps keep IoU high
fn person_at(cy: f64) -> BoundingBox {
    BoundingBox::new(170.0, cy - 60.0, 230.0, cy + 60.0, 0.95)
}

/// Frames of one person walking across the counting line, then leaving view
fn walk(from: f64, to: f64) -> Vec<Vec<BoundingBox>> {
    let step = if to > from { 20.0 } else { -20.0 };
    let mut frames = Vec::new();
    let mut cy = from;
    while (step > 0.0 && cy <= to) || (step < 0.0 && cy >= to) {
        frames.push(vec![person_at(cy)]);
        cy += step;
    }
    frames.push(Vec::new());
    frames
}

fn describe(action: &WatchAction) -> String {
    format!("{:?}:{}", action.kind, action.reservation_id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the timeline; logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };
    let clock = Arc::new(Clock::new(config.utc_offset_minutes())?);
    let start = clock.parse(&args.start).context("invalid --start")?;
    let end = start + chrono::Duration::minutes(args.length.max(1));

    let timing = config.room_timing();
    let watcher_settings = config.watcher_settings();
    let room = RoomId::from("scenario-room");
    let user = UserId::from("scenario-user");

    let store = Arc::new(ReservationStore::in_memory(config.buffer(), clock.offset()));
    let ledger = Arc::new(PenaltyLedger::in_memory(config.penalty_policy()));
    let registry = RoomRegistry::new(store.clone(), ledger.clone(), timing);
    let occupancy = Arc::new(OccupancyBoard::new());
    let board = Arc::new(WatchBoard::new());
    let metrics = Arc::new(Metrics::new());
    let kpi = Arc::new(KpiLog::disabled(config.kpi_bucket()));
    let matcher = LocalMatcher {
        store: store.clone(),
        arrival_before: timing.arrival_before,
        no_show_grace: watcher_settings.no_show_grace,
    };
    let services: Arc<dyn RoomServices> = Arc::new(MockRoomServices::with_local_matcher(matcher));

    let reservation = store.create(&room, &user, start, end, None)?;
    let counter = occupancy.counter(&room);
    let processor = CrossingProcessor::new(
        room.clone(),
        counter.clone(),
        board.clone(),
        services.clone(),
        kpi.clone(),
        metrics.clone(),
        config.confidence_min(),
        ArrivalWindows {
            before: timing.arrival_before,
            after: timing.arrival_after,
            no_show_grace: watcher_settings.no_show_grace,
        },
    );
    let mut tracker = LineTracker::new(config.line_settings());
    let mut filter = OccupancyFilter::new(config.filter_settings());
    let watchers = Watchers {
        settings: watcher_settings,
        store: store.clone(),
        board,
        occupancy,
        services,
        kpi,
        metrics,
        clock: clock.clone(),
    };

    let line = config.line_settings().position;
    let first = start - chrono::Duration::minutes(5);
    let enter_at = start + chrono::Duration::minutes(ENTER_OFFSET_MIN);
    let exit_at = end - chrono::Duration::minutes(EXIT_BEFORE_END_MIN);

    for minute in 0..args.minutes.max(1) {
        let now: Timestamp = first + chrono::Duration::minutes(minute);
        clock.set_simulated(now, 1.0)?;

        let mut actions = Vec::new();
        if args.mode == Mode::Qr && now == enter_at {
            watchers.board.sync_from(&store)?;
            let checkin = processor.manual_checkin(&reservation.id, now);
            actions.push(format!("QrCheckin:{}", checkin.reservation_id().is_some()));
        }

        let frames = match args.mode {
            Mode::Visit | Mode::Qr if now == enter_at => walk(line - 50.0, line + 50.0),
            Mode::Visit | Mode::Qr if now == exit_at => walk(line + 50.0, line - 50.0),
            _ => vec![Vec::new()],
        };
        let mut crossings = 0;
        for frame in &frames {
            for event in tracker.update(frame) {
                processor.process(&event, now).await;
                crossings += 1;
            }
        }

        let is_occupied = filter.update(counter.occupancy());
        let outcome = registry.tick(&room, is_occupied, now)?;

        let mut claimed = watchers.no_show_cycle(now)?;
        claimed.extend(watchers.end_cycle(now)?);
        for handle in watchers.notify_all(&claimed) {
            let _ = handle.await;
        }
        actions.extend(claimed.iter().map(describe));

        let status = store
            .get_by_id(&reservation.id)?
            .map_or(ReservationStatus::Cancelled, |r| r.status);
        let step = Step {
            ts: now.to_rfc3339(),
            minute,
            crossings,
            occupancy: counter.occupancy(),
            is_occupied: outcome.is_occupied,
            state: outcome.state.to_string(),
            reservation_status: status.to_string(),
            penalty_points: ledger.points(&user, now),
            actions,
        };
        println!("{}", serde_json::to_string(&step)?);
    }

    Ok(())
}
