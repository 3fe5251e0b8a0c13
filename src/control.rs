// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::RecorderError;
use crate::guard::RunStatus;
use crate::playback::Player;
use crate::protocol::{
    CommandResponse, ErrorResponse, MessageOut, MessageQuery, NewSession, PlaybackOptions,
    RecordingSession, SessionOut,
};
use crate::recorder::Recorder;
use crate::storage::RecordingStore;

/// Page size when the caller gives none
pub const DEFAULT_PAGE_SIZE: u32 = 200;

type ApiResult<T> = Result<Json<T>, RecorderError>;

/// HTTP control surface over the recorder and the player
#[derive(Clone)]
pub struct ControlInterface {
    store: Arc<dyn RecordingStore>,
    recorder: Arc<Recorder>,
    player: Arc<Player>,
    default_topic_prefix: String,
}

impl ControlInterface {
    pub fn new(
        store: Arc<dyn RecordingStore>,
        recorder: Arc<Recorder>,
        player: Arc<Player>,
        default_topic_prefix: String,
    ) -> Self {
        Self {
            store,
            recorder,
            player,
            default_topic_prefix,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/sessions", post(create_session).get(list_sessions))
            .route("/v1/sessions/{id}", get(get_session))
            .route("/v1/sessions/{id}/record/start", post(record_start))
            .route("/v1/sessions/{id}/record/stop", post(record_stop))
            .route("/v1/sessions/{id}/play/start", post(play_start))
            .route("/v1/sessions/{id}/play/stop", post(play_stop))
            .route("/v1/sessions/{id}/messages", get(list_messages))
            .route("/v1/status", get(status))
            .with_state(self.clone())
    }

    /// Serve until `shutdown` fires
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Control interface listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

impl IntoResponse for RecorderError {
    fn into_response(self) -> Response {
        let status = match &self {
            RecorderError::Conflict { .. } => StatusCode::CONFLICT,
            RecorderError::NotFound(_) => StatusCode::NOT_FOUND,
            RecorderError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_session(
    State(api): State<ControlInterface>,
    body: Result<Json<NewSession>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionOut>), RecorderError> {
    let Json(new) = body.map_err(|rejection| RecorderError::validation(rejection.body_text()))?;
    new.validate()?;

    let session = api.store.create_session(new).await?;
    info!(session_id = %session.id, node = %session.node, "Session created");
    Ok((StatusCode::CREATED, Json(SessionOut::from(&session))))
}

async fn list_sessions(State(api): State<ControlInterface>) -> ApiResult<Vec<SessionOut>> {
    let sessions = api.store.list_sessions().await?;
    Ok(Json(sessions.iter().map(SessionOut::from).collect()))
}

async fn get_session(
    State(api): State<ControlInterface>,
    Path(id): Path<Uuid>,
) -> ApiResult<RecordingSession> {
    let session = api
        .store
        .get_session(id)
        .await?
        .ok_or(RecorderError::NotFound(id))?;
    Ok(Json(session))
}

async fn record_start(
    State(api): State<ControlInterface>,
    Path(id): Path<Uuid>,
) -> ApiResult<CommandResponse> {
    api.recorder.start(id).await?;
    Ok(Json(CommandResponse::ok()))
}

async fn record_stop(
    State(api): State<ControlInterface>,
    Path(id): Path<Uuid>,
) -> ApiResult<CommandResponse> {
    if let Some(active) = api.recorder.active_session() {
        if active != id {
            return Err(RecorderError::conflict("recorder"));
        }
    }

    match api.recorder.stop().await? {
        Some(report) => Ok(Json(CommandResponse::with_report(&report))),
        None => Ok(Json(CommandResponse::ok())),
    }
}

#[derive(Debug, Deserialize)]
struct PlayParams {
    speed: Option<f64>,
    topic_prefix: Option<String>,
}

async fn play_start(
    State(api): State<ControlInterface>,
    Path(id): Path<Uuid>,
    Query(params): Query<PlayParams>,
) -> ApiResult<CommandResponse> {
    let options = PlaybackOptions {
        speed: params.speed.unwrap_or(1.0),
        topic_prefix: Some(
            params
                .topic_prefix
                .unwrap_or_else(|| api.default_topic_prefix.clone()),
        ),
    };
    api.player.start(id, options).await?;
    Ok(Json(CommandResponse::ok()))
}

async fn play_stop(
    State(api): State<ControlInterface>,
    Path(_id): Path<Uuid>,
) -> ApiResult<CommandResponse> {
    match api.player.stop().await? {
        Some(report) => Ok(Json(CommandResponse::with_report(&report))),
        None => Ok(Json(CommandResponse::ok())),
    }
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    limit: Option<u32>,
    topic_prefix: Option<String>,
    offset: Option<u32>,
}

async fn list_messages(
    State(api): State<ControlInterface>,
    Path(id): Path<Uuid>,
    Query(params): Query<MessageParams>,
) -> ApiResult<Vec<MessageOut>> {
    let query = MessageQuery {
        session_id: id,
        topic_prefix: params.topic_prefix,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        offset: params.offset.unwrap_or(0),
    };
    query.validate()?;

    if api.store.get_session(id).await?.is_none() {
        return Err(RecorderError::NotFound(id));
    }
    let rows = api.store.query_messages(&query).await?;
    Ok(Json(rows.into_iter().map(MessageOut::from).collect()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusOut {
    pub recorder: RunStatus,
    pub player: RunStatus,
}

async fn status(State(api): State<ControlInterface>) -> Json<StatusOut> {
    Json(StatusOut {
        recorder: api.recorder.status(),
        player: api.player.status(),
    })
}
