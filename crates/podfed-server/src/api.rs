use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat};
use podfed::core::{Pod as PodEntry, PodHost, VideoUpdatedPayload, VideoUuid};
use podfed::store::SqliteStore;
use podfed::sync::{MessageHandler, PodMessage, PodReply};
use podfed::{Pod, UploadRequest, Video};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::transport::{HttpTransport, INBOX_PATH};

pub type ServerPod = Pod<SqliteStore, HttpTransport>;

#[derive(Clone)]
pub struct AppState {
    pub pod: Arc<ServerPod>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/videos", get(list_videos).post(upload_video))
        .route(
            "/videos/:uuid",
            get(get_video).put(update_video).delete(delete_video),
        )
        .route("/pods", get(list_pods))
        .route("/pods/friend-request", post(friend_request))
        .route("/pods/make-friends", post(make_friends))
        .route("/pods/:host", delete(remove_friend))
        .route(INBOX_PATH, post(federation_inbox))
        .layer(DefaultBodyLimit::max(state.config.max_upload_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    host: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResponse {
    id: u64,
    uuid: String,
    name: String,
    description: String,
    pod_host: String,
    is_local: bool,
    content_identifier: String,
    duration: u32,
    tags: Vec<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    author: String,
    views: u64,
    thumbnail_path: String,
}

impl From<Video> for VideoResponse {
    fn from(video: Video) -> Self {
        let uuid = video.uuid().to_string();
        let r = video.record;
        Self {
            id: video.id,
            uuid,
            pod_host: r.origin.to_string(),
            is_local: video.is_local,
            content_identifier: r.content_id.to_string(),
            created_at: rfc3339(r.created_at),
            updated_at: rfc3339(r.updated_at),
            name: r.name,
            description: r.description,
            duration: r.duration,
            tags: r.tags,
            author: r.author,
            views: r.views,
            thumbnail_path: r.thumbnail_path,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VideoListResponse {
    total: usize,
    data: Vec<VideoResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodResponse {
    host: String,
    public_key_fingerprint: Option<String>,
    state: String,
    last_seen_at: Option<String>,
    score: i32,
}

impl From<PodEntry> for PodResponse {
    fn from(pod: PodEntry) -> Self {
        Self {
            host: pod.host.to_string(),
            public_key_fingerprint: pod.public_key_fingerprint,
            state: pod.state.to_string(),
            last_seen_at: (pod.last_seen_at > 0)
                .then(|| rfc3339(pod.last_seen_at))
                .flatten(),
            score: pod.score,
        }
    }
}

#[derive(Deserialize)]
struct FriendRequestBody {
    host: String,
}

#[derive(Deserialize)]
struct MakeFriendsBody {
    hosts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FriendshipResponse {
    host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn rfc3339(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis).map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn parse_uuid(s: &str) -> Result<VideoUuid, ServerError> {
    VideoUuid::parse(s).map_err(|e| ServerError::BadRequest(e.to_string()))
}

fn parse_host(s: &str) -> Result<PodHost, ServerError> {
    PodHost::new(s).map_err(|e| ServerError::BadRequest(e.to_string()))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        host: state.pod.host().to_string(),
    })
}

async fn list_videos(State(state): State<AppState>) -> Result<Json<VideoListResponse>, ServerError> {
    let data: Vec<VideoResponse> = state
        .pod
        .list()
        .await?
        .into_iter()
        .map(VideoResponse::from)
        .collect();
    Ok(Json(VideoListResponse {
        total: data.len(),
        data,
    }))
}

async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<VideoResponse>), ServerError> {
    let mut name = None;
    let mut description = String::new();
    let mut tags = Vec::new();
    let mut duration = 0u32;
    let mut author = "root".to_string();
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        if field_name == "file" {
            let extension = field
                .file_name()
                .and_then(|f| std::path::Path::new(f).extension())
                .and_then(|e| e.to_str())
                .unwrap_or("bin")
                .to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

            tokio::fs::create_dir_all(&state.config.media_path)
                .await
                .map_err(|e| ServerError::Internal(e.to_string()))?;
            let path = state
                .config
                .media_path
                .join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
            tokio::fs::write(&path, &data)
                .await
                .map_err(|e| ServerError::Internal(e.to_string()))?;
            file = Some(path);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
        match field_name.as_str() {
            "name" => name = Some(value),
            "description" => description = value,
            "tags" => tags.push(value),
            "duration" => {
                duration = value
                    .trim()
                    .parse()
                    .map_err(|_| ServerError::BadRequest(format!("Invalid duration: {value}")))?
            }
            "author" => author = value,
            _ => {}
        }
    }

    let name = name.ok_or_else(|| ServerError::BadRequest("Missing 'name' field".into()))?;
    let file = file.ok_or_else(|| {
        ServerError::BadRequest("Missing 'file' field in multipart form".to_string())
    })?;

    let video = state
        .pod
        .upload(UploadRequest {
            name,
            description,
            tags,
            duration,
            author,
            file,
        })
        .await?;
    info!(uuid = %video.uuid(), "Video uploaded via API");
    Ok((StatusCode::CREATED, Json(video.into())))
}

async fn get_video(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<VideoResponse>, ServerError> {
    let uuid = parse_uuid(&uuid)?;
    Ok(Json(state.pod.view(&uuid).await?.into()))
}

async fn update_video(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(changes): Json<VideoUpdatedPayload>,
) -> Result<Json<VideoResponse>, ServerError> {
    let uuid = parse_uuid(&uuid)?;
    Ok(Json(state.pod.update(&uuid, changes).await?.into()))
}

async fn delete_video(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ServerError> {
    let uuid = parse_uuid(&uuid)?;
    state.pod.delete(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_pods(State(state): State<AppState>) -> Result<Json<Vec<PodResponse>>, ServerError> {
    let pods = state.pod.list_pods().await?;
    Ok(Json(pods.into_iter().map(PodResponse::from).collect()))
}

async fn friend_request(
    State(state): State<AppState>,
    Json(body): Json<FriendRequestBody>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let host = parse_host(&body.host)?;
    if &host == state.pod.host() {
        return Err(ServerError::BadRequest("A pod cannot befriend itself".into()));
    }
    let relationship = state.pod.request_friendship(&host).await?;
    Ok(Json(FriendshipResponse {
        host: host.to_string(),
        state: Some(relationship.to_string()),
        error: None,
    }))
}

async fn make_friends(
    State(state): State<AppState>,
    Json(body): Json<MakeFriendsBody>,
) -> Result<Json<Vec<FriendshipResponse>>, ServerError> {
    let hosts = body
        .hosts
        .iter()
        .map(|h| parse_host(h))
        .collect::<Result<Vec<_>, _>>()?;

    let results = state
        .pod
        .make_friends(&hosts)
        .await
        .into_iter()
        .map(|(host, result)| match result {
            Ok(relationship) => FriendshipResponse {
                host: host.to_string(),
                state: Some(relationship.to_string()),
                error: None,
            },
            Err(e) => FriendshipResponse {
                host: host.to_string(),
                state: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    Ok(Json(results))
}

async fn remove_friend(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let host = parse_host(&host)?;
    state.pod.remove_friend(&host).await?;
    Ok(Json(FriendshipResponse {
        host: host.to_string(),
        state: Some(podfed::RelationshipState::Removed.to_string()),
        error: None,
    }))
}

/// Inbound federation traffic. Protocol-level refusals travel in the reply
/// body; the HTTP status is only non-2xx for transport problems.
async fn federation_inbox(
    State(state): State<AppState>,
    Json(message): Json<PodMessage>,
) -> Json<PodReply> {
    Json(state.pod.handle_message(message).await)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
