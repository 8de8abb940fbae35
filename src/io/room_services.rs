//! External reservation and lock collaborators
//!
//! All calls are best-effort notifications. When an API base is not
//! configured, the corresponding call degrades to a local mock that always
//! matches or grants. Callers log failures and never roll back local state.

use crate::domain::types::{ReservationId, ReservationStatus, RoomId, Timestamp};
use crate::services::reservation_store::ReservationStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckinResult {
    Matched(ReservationId),
    NoHit,
}

impl CheckinResult {
    pub fn reservation_id(&self) -> Option<&ReservationId> {
        match self {
            CheckinResult::Matched(id) => Some(id),
            CheckinResult::NoHit => None,
        }
    }
}

#[async_trait]
pub trait RoomServices: Send + Sync {
    async fn checkin_attempt(
        &self,
        room: &RoomId,
        ts: Timestamp,
    ) -> Result<CheckinResult, ServiceError>;
    async fn auto_release(&self, reservation: &ReservationId, room: &RoomId)
        -> Result<(), ServiceError>;
    async fn grant_lock(&self, room: &RoomId) -> Result<bool, ServiceError>;
    async fn revoke_lock(&self, reservation: &ReservationId, room: &RoomId)
        -> Result<(), ServiceError>;
    async fn report_overstay(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
        occupancy: u32,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    pub base: String,
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub reservation_api: Option<ApiEndpoint>,
    pub lock_api: Option<ApiEndpoint>,
    pub timeout: Duration,
    pub checkin_timeout: Duration,
    pub mock_match: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            reservation_api: None,
            lock_api: None,
            timeout: Duration::from_millis(2000),
            checkin_timeout: Duration::from_millis(3000),
            mock_match: true,
        }
    }
}

/// Resolves mock check-ins against locally known reservations
#[derive(Clone)]
pub struct LocalMatcher {
    pub store: Arc<ReservationStore>,
    pub arrival_before: chrono::Duration,
    pub no_show_grace: chrono::Duration,
}

impl LocalMatcher {
    fn resolve(&self, room: &RoomId, ts: Timestamp) -> Option<ReservationId> {
        let list = self.store.list_for_room(room).ok()?;
        list.into_iter()
            .find(|r| {
                matches!(r.status, ReservationStatus::Active | ReservationStatus::Used)
                    && r.start - self.arrival_before <= ts
                    && ts <= r.end + self.no_show_grace
            })
            .map(|r| r.id)
    }
}

#[derive(Deserialize)]
struct CheckinResponse {
    #[serde(default)]
    matched: bool,
    #[serde(default)]
    reservation_id: Option<String>,
}

pub struct HttpRoomServices {
    client: reqwest::Client,
    reservation_api: Option<ApiEndpoint>,
    lock_api: Option<ApiEndpoint>,
    checkin_timeout: Duration,
    mock_match: bool,
    local: Option<LocalMatcher>,
}

impl HttpRoomServices {
    pub fn new(
        reservation_api: Option<ApiEndpoint>,
        lock_api: Option<ApiEndpoint>,
        timeout: Duration,
        checkin_timeout: Duration,
        mock_match: bool,
    ) -> Result<Self, ServiceError> {
        // one client for connection pooling
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, reservation_api, lock_api, checkin_timeout, mock_match, local: None })
    }

    pub fn from_settings(settings: &ServiceSettings) -> Result<Self, ServiceError> {
        Self::new(
            settings.reservation_api.clone(),
            settings.lock_api.clone(),
            settings.timeout,
            settings.checkin_timeout,
            settings.mock_match,
        )
    }

    pub fn with_local_matcher(mut self, matcher: LocalMatcher) -> Self {
        self.local = Some(matcher);
        self
    }

    async fn post(
        &self,
        api: &ApiEndpoint,
        path: &str,
        body: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ServiceError> {
        let url = format!("{}{}", api.base.trim_end_matches('/'), path);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &api.key {
            req = req.bearer_auth(key);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ServiceError::Status { status: resp.status().as_u16(), url });
        }
        Ok(resp)
    }

    fn mock_checkin(&self, room: &RoomId, ts: Timestamp) -> CheckinResult {
        if !self.mock_match {
            return CheckinResult::NoHit;
        }
        let id = self
            .local
            .as_ref()
            .and_then(|m| m.resolve(room, ts))
            .unwrap_or_else(|| ReservationId(format!("rsv_mock_{}", ts.timestamp())));
        info!(room_id = %room, reservation_id = %id, mock = true, "checked_in");
        CheckinResult::Matched(id)
    }
}

#[async_trait]
impl RoomServices for HttpRoomServices {
    async fn checkin_attempt(
        &self,
        room: &RoomId,
        ts: Timestamp,
    ) -> Result<CheckinResult, ServiceError> {
        let Some(api) = &self.reservation_api else {
            return Ok(self.mock_checkin(room, ts));
        };

        let body = json!({ "room_id": room, "ts": ts.to_rfc3339() });
        let resp =
            self.post(api, "/reservations/checkin-attempt", body, Some(self.checkin_timeout)).await?;
        let data: CheckinResponse = resp.json().await?;
        info!(
            room_id = %room,
            matched = %data.matched,
            reservation_id = ?data.reservation_id,
            "rsv_checkin_call"
        );
        match (data.matched, data.reservation_id) {
            (true, Some(id)) => Ok(CheckinResult::Matched(ReservationId(id))),
            _ => Ok(CheckinResult::NoHit),
        }
    }

    async fn auto_release(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
    ) -> Result<(), ServiceError> {
        let Some(api) = &self.reservation_api else {
            debug!(reservation_id = %reservation, room_id = %room, "auto_release_mock");
            return Ok(());
        };
        let body = json!({ "reservation_id": reservation, "room_id": room });
        self.post(api, "/reservations/auto-release", body, None).await?;
        Ok(())
    }

    async fn grant_lock(&self, room: &RoomId) -> Result<bool, ServiceError> {
        let Some(api) = &self.lock_api else {
            info!(room_id = %room, "lock_grant_mock");
            return Ok(true);
        };
        let path = format!("/rooms/{}/grant", room);
        match self.post(api, &path, json!({}), Some(self.checkin_timeout)).await {
            Ok(_) => {
                info!(room_id = %room, ok = true, "lock_grant_call");
                Ok(true)
            }
            Err(ServiceError::Status { status, .. }) => {
                warn!(room_id = %room, status = %status, ok = false, "lock_grant_call");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn revoke_lock(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
    ) -> Result<(), ServiceError> {
        let Some(api) = &self.lock_api else {
            debug!(reservation_id = %reservation, room_id = %room, "lock_revoke_mock");
            return Ok(());
        };
        let body = json!({ "reservation_id": reservation, "room_id": room });
        self.post(api, "/locks/revoke", body, None).await?;
        Ok(())
    }

    async fn report_overstay(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
        occupancy: u32,
    ) -> Result<(), ServiceError> {
        let Some(api) = &self.reservation_api else {
            debug!(reservation_id = %reservation, room_id = %room, "overstay_report_mock");
            return Ok(());
        };
        let body = json!({ "reservation_id": reservation, "room_id": room, "occupancy": occupancy });
        self.post(api, "/reservations/overstay", body, None).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    CheckinAttempt(RoomId),
    AutoRelease(ReservationId, RoomId),
    GrantLock(RoomId),
    RevokeLock(ReservationId, RoomId),
    ReportOverstay(ReservationId, RoomId, u32),
}

/// In-process collaborator that records every call
///
/// Check-ins resolve through the attached `LocalMatcher`, or not at all.
#[derive(Default)]
pub struct MockRoomServices {
    calls: Mutex<Vec<ServiceCall>>,
    local: Option<LocalMatcher>,
}

impl MockRoomServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_matcher(matcher: LocalMatcher) -> Self {
        Self { calls: Mutex::new(Vec::new()), local: Some(matcher) }
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: ServiceCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl RoomServices for MockRoomServices {
    async fn checkin_attempt(
        &self,
        room: &RoomId,
        ts: Timestamp,
    ) -> Result<CheckinResult, ServiceError> {
        self.record(ServiceCall::CheckinAttempt(room.clone()));
        Ok(self
            .local
            .as_ref()
            .and_then(|m| m.resolve(room, ts))
            .map_or(CheckinResult::NoHit, CheckinResult::Matched))
    }

    async fn auto_release(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
    ) -> Result<(), ServiceError> {
        self.record(ServiceCall::AutoRelease(reservation.clone(), room.clone()));
        Ok(())
    }

    async fn grant_lock(&self, room: &RoomId) -> Result<bool, ServiceError> {
        self.record(ServiceCall::GrantLock(room.clone()));
        Ok(true)
    }

    async fn revoke_lock(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
    ) -> Result<(), ServiceError> {
        self.record(ServiceCall::RevokeLock(reservation.clone(), room.clone()));
        Ok(())
    }

    async fn report_overstay(
        &self,
        reservation: &ReservationId,
        room: &RoomId,
        occupancy: u32,
    ) -> Result<(), ServiceError> {
        self.record(ServiceCall::ReportOverstay(reservation.clone(), room.clone(), occupancy));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn at(hour: u32, min: u32) -> Timestamp {
        offset().with_ymd_and_hms(2026, 4, 1, hour, min, 0).unwrap()
    }

    fn matcher() -> (LocalMatcher, ReservationId) {
        let store = Arc::new(ReservationStore::in_memory(chrono::Duration::minutes(5), offset()));
        let r = store
            .create(&RoomId::from("room-a"), &"alice".into(), at(10, 0), at(11, 0), None)
            .unwrap();
        let matcher = LocalMatcher {
            store,
            arrival_before: chrono::Duration::minutes(10),
            no_show_grace: chrono::Duration::minutes(7),
        };
        (matcher, r.id)
    }

    fn offline(mock_match: bool) -> HttpRoomServices {
        HttpRoomServices::from_settings(&ServiceSettings { mock_match, ..Default::default() })
            .unwrap()
    }

    #[test]
    fn test_local_matcher_window() {
        let (matcher, id) = matcher();
        let room = RoomId::from("room-a");
        assert_eq!(matcher.resolve(&room, at(9, 50)), Some(id.clone()));
        assert_eq!(matcher.resolve(&room, at(11, 7)), Some(id));
        assert_eq!(matcher.resolve(&room, at(9, 49)), None);
        assert_eq!(matcher.resolve(&room, at(11, 8)), None);
        assert_eq!(matcher.resolve(&RoomId::from("room-b"), at(10, 0)), None);
    }

    #[tokio::test]
    async fn test_unconfigured_apis_degrade_to_mock() {
        let services = offline(true);
        let room = RoomId::from("room-a");

        let result = services.checkin_attempt(&room, at(10, 0)).await.unwrap();
        assert_eq!(
            result,
            CheckinResult::Matched(ReservationId(format!("rsv_mock_{}", at(10, 0).timestamp())))
        );
        assert!(services.grant_lock(&room).await.unwrap());
        services.revoke_lock(&"r1".into(), &room).await.unwrap();
        services.auto_release(&"r1".into(), &room).await.unwrap();
        services.report_overstay(&"r1".into(), &room, 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_match_disabled_is_no_hit() {
        let services = offline(false);
        let result = services.checkin_attempt(&"room-a".into(), at(10, 0)).await.unwrap();
        assert_eq!(result, CheckinResult::NoHit);
    }

    #[tokio::test]
    async fn test_mock_resolves_local_reservation() {
        let (matcher, id) = matcher();
        let services = offline(true).with_local_matcher(matcher);
        let result = services.checkin_attempt(&"room-a".into(), at(10, 3)).await.unwrap();
        assert_eq!(result, CheckinResult::Matched(id));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_an_error() {
        let api = ApiEndpoint { base: "http://127.0.0.1:9".to_string(), key: Some("k".into()) };
        let services = HttpRoomServices::new(
            Some(api.clone()),
            Some(api),
            Duration::from_millis(200),
            Duration::from_millis(200),
            true,
        )
        .unwrap();
        assert!(services.checkin_attempt(&"room-a".into(), at(10, 0)).await.is_err());
        assert!(services.revoke_lock(&"r1".into(), &"room-a".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_recording_services() {
        let (matcher, id) = matcher();
        let services = MockRoomServices::with_local_matcher(matcher);
        let room = RoomId::from("room-a");

        assert_eq!(
            services.checkin_attempt(&room, at(10, 0)).await.unwrap(),
            CheckinResult::Matched(id.clone())
        );
        services.revoke_lock(&id, &room).await.unwrap();
        assert_eq!(
            services.calls(),
            vec![ServiceCall::CheckinAttempt(room.clone()), ServiceCall::RevokeLock(id, room)]
        );
    }
}
