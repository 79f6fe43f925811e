//! Read-only JSON endpoints for overlays and external players.

use crate::epg::{EpgData, Programme};
use crate::errors::{MatrixError, Result};
use crate::schedule::{ScheduleStore, ScheduleSummary, TimeSlot};
use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerState {
    pub store: Arc<ScheduleStore>,
    pub epg: Arc<RwLock<EpgData>>,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(store: Arc<ScheduleStore>, epg: EpgData) -> SharedState {
        Arc::new(Self {
            store,
            epg: Arc::new(RwLock::new(epg)),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChannelQuery {
    pub channel: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NowEntry {
    pub channel_id: i64,
    pub name: String,
    pub now: Option<TimeSlot>,
    pub next: Option<TimeSlot>,
}

#[derive(Debug, Serialize)]
pub struct NowResponse {
    pub generated_at: DateTime<Utc>,
    pub channels: Vec<NowEntry>,
}

#[derive(Debug, Serialize)]
pub struct EpgEntry {
    pub id: String,
    pub name: String,
    pub now: Option<Programme>,
    pub next: Option<Programme>,
}

/// JSON error body with a status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<MatrixError> for ApiError {
    fn from(err: MatrixError) -> Self {
        match err {
            MatrixError::NotFound(what) => ApiError::not_found(format!("{} not found", what)),
            other => {
                tracing::error!(error = %other, "request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/now.json", get(now_handler))
        .route("/schedules.json", get(schedules_handler))
        .route("/epg.json", get(epg_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Current and next slot for every scheduler channel (or the one named by
/// `channel`, which may be an id or a name)
pub fn build_now(
    state: &ServerState,
    channel: Option<&str>,
    at: DateTime<Utc>,
) -> std::result::Result<NowResponse, ApiError> {
    let mut channels = state.store.list_channels()?;
    if let Some(wanted) = channel {
        let wanted = wanted.trim();
        let id = wanted.parse::<i64>().ok();
        channels.retain(|c| Some(c.id) == id || c.name.eq_ignore_ascii_case(wanted));
        if channels.is_empty() {
            return Err(ApiError::not_found(format!("channel '{}' not found", wanted)));
        }
    }

    let naive = at.naive_utc();
    let mut entries = Vec::with_capacity(channels.len());
    for ch in channels {
        let (now, next) = state.store.now_and_next(ch.id, naive)?;
        entries.push(NowEntry {
            channel_id: ch.id,
            name: ch.name,
            now,
            next,
        });
    }

    Ok(NowResponse {
        generated_at: at,
        channels: entries,
    })
}

pub fn build_epg(
    state: &ServerState,
    channel: Option<&str>,
    at: DateTime<Utc>,
) -> std::result::Result<Vec<EpgEntry>, ApiError> {
    let epg = state.epg.read();
    let ids = match channel {
        Some(id) => {
            let known = epg.channels.contains_key(id) || epg.programmes.contains_key(id);
            if !known {
                return Err(ApiError::not_found(format!("EPG channel '{}' not found", id)));
            }
            vec![id.to_string()]
        }
        None => epg.channel_ids(),
    };

    Ok(ids
        .into_iter()
        .map(|id| EpgEntry {
            name: epg.display_name(&id).to_string(),
            now: epg.current_programme(&id, at).cloned(),
            next: epg.next_programme(&id, at).cloned(),
            id,
        })
        .collect())
}

pub async fn now_handler(
    State(state): State<SharedState>,
    Query(query): Query<ChannelQuery>,
) -> std::result::Result<Json<NowResponse>, ApiError> {
    build_now(&state, query.channel.as_deref(), Utc::now()).map(Json)
}

pub async fn schedules_handler(
    State(state): State<SharedState>,
) -> std::result::Result<Json<Vec<ScheduleSummary>>, ApiError> {
    Ok(Json(state.store.list_schedules()?))
}

pub async fn epg_handler(
    State(state): State<SharedState>,
    Query(query): Query<ChannelQuery>,
) -> std::result::Result<Json<Vec<EpgEntry>>, ApiError> {
    build_epg(&state, query.channel.as_deref(), Utc::now()).map(Json)
}

async fn fallback_handler(uri: Uri) -> ApiError {
    tracing::debug!(path = %uri.path(), "unknown route");
    ApiError::not_found(format!("no route for {}", uri.path()))
}

/// Bind `addr` and serve until the process exits
pub async fn serve(addr: &str, state: SharedState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, state).await
}

pub async fn serve_listener(listener: TcpListener, state: SharedState) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, create_app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epg::parse_xmltv;
    use crate::schedule::NewShow;
    use chrono::{Duration, TimeZone};

    fn state_with_slot(at: DateTime<Utc>) -> SharedState {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let ch = store.add_channel("Retro", None).unwrap();
        let start = at.naive_utc() - Duration::minutes(10);
        let sched = store
            .create_schedule("Today", ch, start, start + Duration::hours(2))
            .unwrap();
        let show = store.add_show(&NewShow::new("Cartoons", 30)).unwrap();
        store
            .add_time_slot(sched, show, start, start + Duration::minutes(30))
            .unwrap();
        store
            .add_time_slot(sched, show, start + Duration::minutes(30), start + Duration::minutes(60))
            .unwrap();
        ServerState::new(store, EpgData::new())
    }

    #[test]
    fn test_build_now_reports_current_and_next() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let state = state_with_slot(at);
        let resp = build_now(&state, None, at).unwrap();
        assert_eq!(resp.channels.len(), 1);
        let entry = &resp.channels[0];
        assert_eq!(entry.now.as_ref().unwrap().show_title, "Cartoons");
        assert_eq!(
            entry.next.as_ref().unwrap().start,
            at.naive_utc() + Duration::minutes(20)
        );

        assert!(build_now(&state, Some("retro"), at).is_ok());
        let err = build_now(&state, Some("missing"), at).unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_build_epg_filters_by_channel() {
        let xml = r#"<tv>
            <channel id="a"><display-name>Alpha</display-name></channel>
            <programme channel="a" start="20240301110000 +0000" stop="20240301130000 +0000"><title>Noon</title></programme>
        </tv>"#;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let state = ServerState::new(store, parse_xmltv(xml));

        let all = build_epg(&state, None, at).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Alpha");
        assert_eq!(all[0].now.as_ref().unwrap().title, "Noon");
        assert!(all[0].next.is_none());
        assert_eq!(build_epg(&state, Some("zzz"), at).unwrap_err().status, StatusCode::NOT_FOUND);
    }
}
