use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::app_state::AppState;
use crate::error::{ParseProfileTypeError, ServerError};
use crate::storage::{self, NewProfile, ProfileId, ProfileMeta, ProfileType};

/// Percent-encoded, since service names may hold bytes a header cannot.
const SERVICE_HEADER: &str = "x-profile-service";
const TYPE_HEADER: &str = "x-profile-type";
const CREATED_AT_HEADER: &str = "x-profile-created-at";

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    service: String,
    #[serde(rename = "type")]
    profile_type: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct FindParams {
    service: String,
    #[serde(rename = "type")]
    profile_type: Option<String>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: Option<usize>,
}

/// Cancelled when the handler future is dropped, e.g. on client disconnect.
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

fn parse_type(raw: &str) -> Result<ProfileType, ServerError> {
    raw.parse()
        .map_err(|e: ParseProfileTypeError| ServerError::BadRequest(e.to_string()))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed().unwrap_or_default();
    let response = serde_json::json!({
        "status": "ok",
        "uptime": format!("{}s", uptime.as_secs()),
        "backend": state.backend,
        "version": env!("CARGO_PKG_VERSION"),
    });
    tracing::debug!("Health check response: {:?}", response);
    Json(response)
}

pub async fn write_profile(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WriteParams>,
    body: Bytes,
) -> Result<impl IntoResponse, ServerError> {
    let (cancel, _guard) = request_token();
    let profile = NewProfile::new(
        params.service,
        parse_type(&params.profile_type)?,
        params.created_at.unwrap_or_else(Utc::now),
    );

    let id = state.writer.write_profile(profile, body, &cancel).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

pub async fn find_profiles(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FindParams>,
) -> Result<Json<Vec<ProfileMeta>>, ServerError> {
    let (cancel, _guard) = request_token();
    let mut query = storage::Query::new(params.service, params.from, params.to);
    if let Some(raw) = params.profile_type.as_deref() {
        query = query.with_type(parse_type(raw)?);
    }
    if let Some(limit) = params.limit {
        query = query.with_limit(limit);
    }

    let profiles: Vec<ProfileMeta> = state
        .reader
        .find_profiles(query, &cancel)?
        .try_collect()
        .await?;
    debug!(count = profiles.len(), "Found profiles");
    Ok(Json(profiles))
}

pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let (cancel, _guard) = request_token();
    let id = ProfileId::parse(&id)?;
    let record = state.reader.read_profile(&id, &cancel).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                HeaderName::from_static(SERVICE_HEADER),
                urlencoding::encode(&record.meta.service).into_owned(),
            ),
            (HeaderName::from_static(TYPE_HEADER), record.meta.profile_type.to_string()),
            (HeaderName::from_static(CREATED_AT_HEADER), record.meta.created_at.to_rfc3339()),
        ],
        record.payload,
    ))
}
