//! Prometheus metrics HTTP endpoint
//!
//! Exposes counters, per-room occupancy and per-room state in Prometheus text
//! format at /metrics, plus a /health probe. Uses hyper for the HTTP server.
//! Scrapes read monotonic values only and never reset the periodic report.

use crate::infra::metrics::Metrics;
use crate::services::occupancy::OccupancyBoard;
use crate::services::room_state::{RoomRegistry, RoomState};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Numeric encoding of the room state gauge
fn state_value(state: RoomState) -> u64 {
    match state {
        RoomState::Idle => 0,
        RoomState::ReservedNotUsed => 1,
        RoomState::InUse => 2,
        RoomState::Finished => 3,
    }
}

/// Everything a scrape reads from
#[derive(Clone)]
pub struct MetricsSources {
    pub site_id: Arc<String>,
    pub metrics: Arc<Metrics>,
    pub occupancy: Arc<OccupancyBoard>,
    pub registry: Arc<RoomRegistry>,
}

fn write_counters(output: &mut String, site: &str, m: &Metrics) {
    let counters: [(&str, &str, u64); 15] = [
        ("roomwatch_ticks_total", "Room state machine ticks", m.ticks_total()),
        ("roomwatch_crossings_enter_total", "Accepted enter crossings", m.crossings_enter()),
        ("roomwatch_crossings_exit_total", "Accepted exit crossings", m.crossings_exit()),
        (
            "roomwatch_crossings_filtered_total",
            "Crossings below the confidence floor",
            m.crossings_filtered(),
        ),
        ("roomwatch_checkin_success_total", "Check-ins matched to a reservation", m.checkin_success()),
        ("roomwatch_checkin_fail_total", "Check-ins with no matching reservation", m.checkin_fail()),
        ("roomwatch_no_shows_total", "Reservations marked NO_SHOW", m.no_shows()),
        ("roomwatch_auto_releases_total", "Reservations auto-released by the watcher", m.auto_releases()),
        ("roomwatch_sessions_closed_total", "Sessions closed at zero occupancy", m.sessions_closed()),
        ("roomwatch_overstay_alerts_total", "Overstay alerts raised by room ticks", m.overstay_alerts()),
        ("roomwatch_overstays_detected_total", "Overstays flagged by the end watcher", m.overstays_detected()),
        ("roomwatch_penalties_total", "No-show penalties recorded", m.penalties()),
        ("roomwatch_poll_errors_total", "Sensor fetch failures", m.poll_errors()),
        ("roomwatch_service_errors_total", "Failed collaborator calls", m.service_errors()),
        ("roomwatch_watcher_errors_total", "Failed watcher cycles", m.watcher_errors()),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
}

fn write_room_gauges(output: &mut String, site: &str, sources: &MetricsSources) {
    let _ = writeln!(output, "# HELP roomwatch_room_occupancy Live person count per room");
    let _ = writeln!(output, "# TYPE roomwatch_room_occupancy gauge");
    for (room, snap) in sources.occupancy.snapshot_all() {
        let _ = writeln!(
            output,
            "roomwatch_room_occupancy{{site=\"{site}\",room=\"{room}\"}} {}",
            snap.occupancy
        );
    }

    let _ = writeln!(
        output,
        "# HELP roomwatch_room_state Room state (0=idle, 1=reserved_not_used, 2=in_use, 3=finished)"
    );
    let _ = writeln!(output, "# TYPE roomwatch_room_state gauge");
    for status in sources.registry.states() {
        let _ = writeln!(
            output,
            "roomwatch_room_state{{site=\"{site}\",room=\"{}\"}} {}",
            status.room_id,
            state_value(status.state)
        );
    }
}

fn format_prometheus_metrics(sources: &MetricsSources) -> String {
    let mut output = String::with_capacity(4096);
    let site = sources.site_id.as_str();
    write_counters(&mut output, site, &sources.metrics);
    write_metric(
        &mut output,
        "roomwatch_rooms_tracked",
        "Rooms with a live occupancy counter",
        MetricType::Gauge,
        site,
        sources.occupancy.snapshot_all().len() as u64,
    );
    write_room_gauges(&mut output, site, sources);
    output
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    sources: MetricsSources,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&sources),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(resp)
}

pub async fn start_metrics_server(
    port: u16,
    sources: MetricsSources,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %sources.site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let sources = sources.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let sources = sources.clone();
                                async move { handle_request(req, sources).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CrossingEvent, CrossingKind, RoomId};
    use crate::services::penalty::{PenaltyLedger, PenaltyPolicy};
    use crate::services::reservation_store::ReservationStore;
    use crate::services::room_state::RoomTiming;
    use chrono::{FixedOffset, TimeZone};

    fn sources() -> MetricsSources {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let store = Arc::new(ReservationStore::in_memory(chrono::Duration::minutes(5), offset));
        let ledger = Arc::new(PenaltyLedger::in_memory(PenaltyPolicy::default()));
        MetricsSources {
            site_id: Arc::new("test-site".to_string()),
            metrics: Arc::new(Metrics::new()),
            occupancy: Arc::new(OccupancyBoard::new()),
            registry: Arc::new(RoomRegistry::new(store, ledger, RoomTiming::default())),
        }
    }

    #[test]
    fn test_format_prometheus_metrics() {
        let sources = sources();
        sources.metrics.record_tick();
        sources.metrics.record_no_show();
        let room = RoomId::from("room-a");
        sources
            .occupancy
            .counter(&room)
            .apply(&CrossingEvent { kind: CrossingKind::Enter, confidence: 1.0 }, 0.9);
        let now = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 4, 1, 10, 0, 0)
            .unwrap();
        sources.registry.tick(&room, true, now).unwrap();

        let output = format_prometheus_metrics(&sources);
        assert!(output.contains("# TYPE roomwatch_ticks_total counter"));
        assert!(output.contains("roomwatch_ticks_total{site=\"test-site\"} 1"));
        assert!(output.contains("roomwatch_penalties_total{site=\"test-site\"} 1"));
        assert!(output.contains("roomwatch_room_occupancy{site=\"test-site\",room=\"room-a\"} 1"));
        assert!(output.contains("roomwatch_room_state{site=\"test-site\",room=\"room-a\"} 0"));
        assert!(output.contains("roomwatch_rooms_tracked{site=\"test-site\"} 1"));
    }

    #[test]
    fn test_error_counters_are_separate() {
        let sources = sources();
        sources.metrics.record_service_error();
        sources.metrics.record_watcher_error();
        sources.metrics.record_watcher_error();

        let output = format_prometheus_metrics(&sources);
        assert!(output.contains("roomwatch_service_errors_total{site=\"test-site\"} 1\n"));
        assert!(output.contains("# TYPE roomwatch_watcher_errors_total counter"));
        assert!(output.contains("roomwatch_watcher_errors_total{site=\"test-site\"} 2\n"));
    }

    #[test]
    fn test_scrape_does_not_reset_report() {
        let sources = sources();
        sources.metrics.record_tick();
        format_prometheus_metrics(&sources);
        assert_eq!(sources.metrics.report(0, 0).ticks_total, 1);
    }
}
