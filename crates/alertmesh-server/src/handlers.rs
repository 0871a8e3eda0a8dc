//! HTTP request handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use alertmesh_cluster::{ClusterMember, GossipMessage};
use alertmesh_core::{
    AlertQuery, AlertView, GroupView, IngestReport, PostableAlert, PostableSilence,
    ReceiverHealth, Silence, SilenceState, parse_matchers,
};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, ReloadSummary};

/// Query parameters for `GET /alerts`.
#[derive(Debug, Default, Deserialize)]
pub struct AlertFilterParams {
    /// Matcher list, e.g. `{service="api",severity=~"crit.*"}`.
    pub filter: Option<String>,
    /// Include alerts that are neither silenced nor inhibited.
    pub active: Option<bool>,
    /// Include silenced alerts.
    pub silenced: Option<bool>,
    /// Include inhibited alerts.
    pub inhibited: Option<bool>,
    /// Include resolved alerts still held for retention.
    pub resolved: Option<bool>,
    /// Only alerts routed to this receiver.
    pub receiver: Option<String>,
}

impl AlertFilterParams {
    fn into_query(self) -> ApiResult<AlertQuery> {
        let defaults = AlertQuery::default();
        let matchers = match self.filter.as_deref() {
            Some(filter) => parse_matchers(filter)?,
            None => Vec::new(),
        };
        Ok(AlertQuery {
            matchers,
            active: self.active.unwrap_or(defaults.active),
            silenced: self.silenced.unwrap_or(defaults.silenced),
            inhibited: self.inhibited.unwrap_or(defaults.inhibited),
            resolved: self.resolved.unwrap_or(defaults.resolved),
            receiver: self.receiver,
        })
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
}

/// Response to `POST /silences`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SilenceCreated {
    /// Id of the created or updated silence.
    #[serde(rename = "silenceID")]
    pub silence_id: String,
}

/// A silence with its current state.
#[derive(Debug, Serialize)]
pub struct SilenceView {
    /// The stored silence.
    #[serde(flatten)]
    pub silence: Silence,
    /// State at the time of the request.
    pub status: SilenceStatus,
}

/// Current state of a silence.
#[derive(Debug, Serialize)]
pub struct SilenceStatus {
    /// Pending, active or expired.
    pub state: SilenceState,
}

impl SilenceView {
    fn new(silence: Silence) -> Self {
        let state = silence.state(Utc::now());
        Self {
            silence,
            status: SilenceStatus { state },
        }
    }
}

/// Cluster part of `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Local peer id.
    pub peer_id: String,
    /// Advertised address.
    pub address: String,
    /// Position among live members; notifications are delayed by it.
    pub position: usize,
    /// Every known member.
    pub members: Vec<ClusterMember>,
}

/// Response to `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Crate version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Cluster membership.
    pub cluster: ClusterStatus,
    /// Delivery health per configured receiver.
    pub receivers: BTreeMap<String, ReceiverHealth>,
    /// Stored alerts, silences and notification log entries.
    pub records: RecordCounts,
}

/// Record counts in the replicated state.
#[derive(Debug, Serialize)]
pub struct RecordCounts {
    /// Stored alerts.
    pub alerts: usize,
    /// Stored silences.
    pub silences: usize,
    /// Notification log entries.
    pub nflog: usize,
}

/// Handle GET /health - liveness.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Handle POST /alerts - ingest a batch.
///
/// Valid alerts in a batch are stored even when others are rejected; the
/// response is then a 400 listing the rejected indices.
pub async fn post_alerts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<Vec<PostableAlert>>, JsonRejection>,
) -> ApiResult<Json<IngestReport>> {
    let token = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.authorize_ingest(token) {
        warn!("rejected alert batch with a bad ingest token");
        return Err(ApiError::Unauthorized);
    }

    let Json(batch) = payload?;
    let report = state.engine().ingest(batch, Utc::now());
    if report.is_ok() {
        return Ok(Json(report));
    }

    let reasons: Vec<String> = report
        .errors
        .iter()
        .map(|e| format!("alert {}: {}", e.index, e.message))
        .collect();
    Err(ApiError::InvalidRequest(format!(
        "{} of {} alerts rejected: {}",
        report.errors.len(),
        report.errors.len() + report.accepted.len(),
        reasons.join("; ")
    )))
}

/// Handle GET /alerts - filtered alert list.
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertFilterParams>,
) -> ApiResult<Json<Vec<AlertView>>> {
    let query = params.into_query()?;
    Ok(Json(state.engine().query(&query, Utc::now())))
}

/// Handle GET /alerts/groups - current groups.
pub async fn list_groups(State(state): State<Arc<AppState>>) -> Json<Vec<GroupView>> {
    Json(state.engine().groups())
}

/// Handle POST /silences - create or update a silence.
pub async fn post_silence(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PostableSilence>, JsonRejection>,
) -> ApiResult<Json<SilenceCreated>> {
    let Json(silence) = payload?;
    let shared = state.shared();
    let silence_id = shared
        .silences()
        .upsert(silence, Utc::now(), |prev| shared.stamp(prev))?;
    Ok(Json(SilenceCreated { silence_id }))
}

/// Handle GET /silences - every stored silence.
pub async fn list_silences(State(state): State<Arc<AppState>>) -> Json<Vec<SilenceView>> {
    let silences = state.shared().silences().list();
    Json(silences.into_iter().map(SilenceView::new).collect())
}

/// Handle GET /silences/{id}.
pub async fn get_silence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SilenceView>> {
    state
        .shared()
        .silences()
        .get(&id)
        .map(|s| Json(SilenceView::new(s)))
        .ok_or(ApiError::NotFound("silence", id))
}

/// Handle DELETE /silences/{id} - expire a silence.
pub async fn delete_silence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SilenceView>> {
    let shared = state.shared();
    let silence = shared
        .silences()
        .expire(&id, Utc::now(), |prev| shared.stamp(prev))?;
    Ok(Json(SilenceView::new(silence)))
}

/// Handle GET /status - membership and receiver health.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let engine = state.engine();
    let replicator = state.replicator();
    let shared = state.shared();

    let mut receivers: BTreeMap<String, ReceiverHealth> = engine
        .pipeline()
        .receiver_names()
        .into_iter()
        .map(|name| (name, ReceiverHealth::default()))
        .collect();
    for (name, health) in engine.pipeline().health() {
        if let Some(slot) = receivers.get_mut(&name) {
            *slot = health;
        }
    }

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        cluster: ClusterStatus {
            peer_id: replicator.local().id.to_string(),
            address: replicator.local().address.clone(),
            position: replicator.position(),
            members: replicator.members(),
        },
        receivers,
        records: RecordCounts {
            alerts: shared.alerts().len(),
            silences: shared.silences().len(),
            nflog: shared.nflog().len(),
        },
    })
}

/// Handle POST /-/reload - reload routing, receivers and inhibition rules.
pub async fn reload(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReloadSummary>> {
    Ok(Json(state.reload()?))
}

/// Handle POST /cluster/gossip - answer a peer's gossip message.
pub async fn gossip(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GossipMessage>, JsonRejection>,
) -> ApiResult<Json<GossipMessage>> {
    let Json(message) = payload?;
    debug!(peer = %message.sender().id, kind = message.kind(), "gossip received");
    Ok(Json(state.replicator().handle(message, Utc::now())?))
}
