//! HTTP adapter over the session service and the authorization engine.
//!
//! Handlers stay thin: resolve the caller (token from query param or
//! cookie, bound to the connection's IP), call the service, map errors per
//! the taxonomy. Media bytes are served range-capable; everything else is
//! JSON.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use abyss_shared::constants::{DELEGATED_TTL_SECS, ROOT_UUID};
use abyss_shared::perms::Permission;
use abyss_store::User;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::resources::Resources;
use crate::session::{SessionService, UserCreating};
use crate::Store;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionService>,
    pub resources: Arc<Resources>,
    pub store: Store,
    pub config: Arc<ServerConfig>,
    pub rate_limiter: RateLimiter,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/api/User/validate", post(user_validate))
        .route("/api/User/destroy", post(user_destroy))
        .route(
            "/api/User/{user}",
            get(user_challenge).post(user_login).patch(user_create),
        )
        .route("/api/User/{user}/open", get(user_open))
        .route("/api/Root/chmod", post(root_chmod))
        .route("/api/Root/chown", post(root_chown))
        .route("/api/Root/init", post(root_init))
        .route("/api/Root/ls", get(root_ls))
        .route("/api/Video", get(video_classes))
        .route("/api/Video/{klass}", get(video_class))
        .route("/api/Video/{klass}/bulkquery", post(video_bulkquery))
        .route("/api/Video/{klass}/{id}", get(video_summary))
        .route("/api/Video/{klass}/{id}/cover", get(video_cover))
        .route("/api/Video/{klass}/{id}/av", get(video_av))
        .route("/api/Video/{klass}/{id}/subtitle", get(video_subtitle))
        .route("/api/Video/{klass}/{id}/gallery/{pic}", get(video_gallery))
        .route("/api/Image", get(image_index))
        .route("/api/Image/bulkquery", post(image_bulkquery))
        .route("/api/Image/{id}", get(image_summary))
        .route("/api/Image/{id}/{file}", get(image_file))
        .route("/api/Live/{id}", post(live_create).delete(live_delete))
        .route("/api/Live/{id}/{token}/{item}", get(live_item))
        .layer(middleware::from_fn(mask_internal_errors))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Uncaught failures leave as 400, never as a stack trace.
async fn mask_internal_errors(
    req: axum::http::Request<Body>,
    next: middleware::Next,
) -> Response {
    let response = next.run(req).await;
    if response.status().is_server_error() {
        (StatusCode::BAD_REQUEST, "Bad Request").into_response()
    } else {
        response
    }
}

// ---------------------------------------------------------------------------
// Health & instance info
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    version: &'static str,
    debug_mode: bool,
    proxy_port: u16,
    allowed_ports: Vec<u16>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        debug_mode: state.config.debug_mode,
        proxy_port: abyss_shared::constants::PROXY_PORT,
        allowed_ports: state.config.allowed_ports.clone(),
    })
}

// ---------------------------------------------------------------------------
// Caller resolution
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct TokenQuery {
    token: Option<String>,
}

/// Token from the query string, falling back to the `token` cookie.
fn token_from(query: &TokenQuery, headers: &HeaderMap) -> Result<String, ApiError> {
    if let Some(token) = &query.token {
        return Ok(token.clone());
    }
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some(value) = pair.trim().strip_prefix("token=") {
                return Ok(value.to_string());
            }
        }
    }
    Err(ApiError::NotAuthenticated)
}

async fn resolve_actor(state: &AppState, token: &str, ip: IpAddr) -> Result<User, ApiError> {
    let uuid = state.session.validate(token, ip);
    if uuid < 0 {
        return Err(ApiError::NotAuthenticated);
    }
    let db = state.store.lock().await;
    db.find_user_by_uuid(uuid)
        .map_err(|_| ApiError::NotAuthenticated)
}

// ---------------------------------------------------------------------------
// User endpoints
// ---------------------------------------------------------------------------

async fn user_challenge(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<String>, ApiError> {
    match state.session.challenge(&user).await? {
        Some(challenge) => Ok(Json(challenge)),
        None => Err(ApiError::Forbidden("unknown user".into())),
    }
}

#[derive(Deserialize)]
struct LoginBody {
    #[serde(alias = "Response")]
    response: String,
}

async fn user_login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(user): Path<String>,
    Json(body): Json<LoginBody>,
) -> Result<Response, ApiError> {
    let signature = BASE64
        .decode(&body.response)
        .map_err(|e| ApiError::BadRequest(format!("response base64: {e}")))?;

    match state.session.verify(&user, &signature, addr.ip()).await {
        Some(token) => {
            let cookie = format!("token={token}; Path=/; HttpOnly");
            Ok(([(header::SET_COOKIE, cookie)], Json(token)).into_response())
        }
        None => Err(ApiError::Forbidden("authentication failed".into())),
    }
}

async fn user_validate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<i64>, ApiError> {
    let token = token_from(&query, &headers)?;
    let uuid = state.session.validate(&token, addr.ip());
    if uuid < 0 {
        return Err(ApiError::NotAuthenticated);
    }
    Ok(Json(uuid))
}

async fn user_destroy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<StatusCode, ApiError> {
    let token = token_from(&query, &headers)?;
    if state.session.validate(&token, addr.ip()) < 0 {
        return Err(ApiError::NotAuthenticated);
    }
    state.session.destroy(&token);
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct CreateUserBody {
    #[serde(alias = "Response")]
    response: String,
    #[serde(alias = "Name")]
    name: String,
    #[serde(alias = "Privilege")]
    privilege: i64,
    #[serde(alias = "PublicKey", rename = "publicKey")]
    public_key: String,
}

/// Create a user under the caller. The signed challenge proves the
/// creator's key; the short-lived token minted here is consumed by the
/// creation itself, forcing a fresh login afterwards.
async fn user_create(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(user): Path<String>,
    Json(body): Json<CreateUserBody>,
) -> Result<StatusCode, ApiError> {
    let signature = BASE64
        .decode(&body.response)
        .map_err(|e| ApiError::BadRequest(format!("response base64: {e}")))?;
    let token = state
        .session
        .verify(&user, &signature, addr.ip())
        .await
        .ok_or_else(|| ApiError::Forbidden("authentication failed".into()))?;

    let key_bytes = BASE64
        .decode(&body.public_key)
        .map_err(|e| ApiError::BadRequest(format!("publicKey base64: {e}")))?;
    let public_key: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| ApiError::BadRequest("publicKey must be 32 bytes".into()))?;

    state
        .session
        .create_user(
            &token,
            addr.ip(),
            UserCreating {
                name: body.name,
                privilege: body.privilege,
                public_key,
            },
        )
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct OpenQuery {
    token: Option<String>,
    #[serde(rename = "bindIp")]
    bind_ip: String,
}

/// Root-only delegation: a 1 h token for `user`, bound to `bindIp`.
async fn user_open(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Query(query): Query<OpenQuery>,
) -> Result<Json<String>, ApiError> {
    let token = token_from(
        &TokenQuery {
            token: query.token.clone(),
        },
        &headers,
    )?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    if actor.uuid != ROOT_UUID {
        return Err(ApiError::Forbidden("root only".into()));
    }

    let bind_ip: IpAddr = query
        .bind_ip
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("bindIp: {:?}", query.bind_ip)))?;
    let target = {
        let db = state.store.lock().await;
        db.find_user_by_name(&user)
            .map_err(|_| ApiError::Forbidden("unknown user".into()))?
    };

    let delegated = state.session.create_token(
        target.uuid,
        bind_ip,
        Duration::from_secs(DELEGATED_TTL_SECS),
    );
    info!(target = %user, bind = %bind_ip, "delegated token issued");
    Ok(Json(delegated))
}

// ---------------------------------------------------------------------------
// Root endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChmodQuery {
    token: Option<String>,
    path: String,
    permission: String,
    #[serde(default)]
    recursive: bool,
}

async fn root_chmod(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ChmodQuery>,
) -> Result<Json<usize>, ApiError> {
    let token = token_from(
        &TokenQuery {
            token: query.token.clone(),
        },
        &headers,
    )?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    let permission: Permission = query.permission.parse().map_err(ApiError::from)?;

    let changed = state
        .resources
        .chmod(&actor, &query.path, &permission, query.recursive)
        .await?;
    Ok(Json(changed))
}

#[derive(Deserialize)]
struct ChownQuery {
    token: Option<String>,
    path: String,
    owner: i64,
    #[serde(default)]
    recursive: bool,
}

async fn root_chown(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ChownQuery>,
) -> Result<Json<usize>, ApiError> {
    let token = token_from(
        &TokenQuery {
            token: query.token.clone(),
        },
        &headers,
    )?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;

    let changed = state
        .resources
        .chown(&actor, &query.path, query.owner, query.recursive)
        .await?;
    Ok(Json(changed))
}

#[derive(Deserialize)]
struct InitQuery {
    token: Option<String>,
    path: String,
    owner: i64,
}

async fn root_init(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<InitQuery>,
) -> Result<Json<usize>, ApiError> {
    let token = token_from(
        &TokenQuery {
            token: query.token.clone(),
        },
        &headers,
    )?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;

    let inserted = state
        .resources
        .initialize(&actor, &query.path, query.owner)
        .await?;
    Ok(Json(inserted))
}

#[derive(Deserialize)]
struct LsQuery {
    token: Option<String>,
    path: String,
}

async fn root_ls(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<LsQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let token = token_from(
        &TokenQuery {
            token: query.token.clone(),
        },
        &headers,
    )?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    if actor.uuid != ROOT_UUID {
        return Err(ApiError::Forbidden("root only".into()));
    }

    let entries = state.resources.list_entries(&query.path).await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|e| format!("{} {} {} {}", e.permission, e.owner, e.uid, e.name))
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Video endpoints
// ---------------------------------------------------------------------------

async fn video_classes(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    listing(&state, &query, &headers, addr.ip(), "Videos".to_string()).await
}

async fn video_class(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(klass): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    listing(&state, &query, &headers, addr.ip(), format!("Videos/{klass}")).await
}

async fn video_summary(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((klass, id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    json_file(
        &state,
        &query,
        &headers,
        addr.ip(),
        format!("Videos/{klass}/{id}/summary.json"),
    )
    .await
}

async fn video_cover(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((klass, id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    let path = state
        .resources
        .get_file(&actor, &format!("Videos/{klass}/{id}/cover.jpg"))
        .await?;
    serve_ranged(path, "image/jpeg", &headers).await
}

async fn video_gallery(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((klass, id, pic)): Path<(String, String, String)>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    let path = state
        .resources
        .get_file(&actor, &format!("Videos/{klass}/{id}/gallery/{pic}"))
        .await?;
    serve_ranged(path, "image/jpeg", &headers).await
}

/// The stream itself: the single `video.<ext>` file in the title's
/// directory, whichever container it is.
async fn video_av(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((klass, id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;

    let dir = format!("Videos/{klass}/{id}");
    let children = state.resources.query(&actor, &dir).await?;
    let video = children
        .iter()
        .find(|name| name.starts_with("video."))
        .ok_or_else(|| ApiError::NotFound("no video file".into()))?;

    let content_type = match video.rsplit('.').next() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    };
    let path = state
        .resources
        .get_file(&actor, &format!("{dir}/{video}"))
        .await?;
    serve_ranged(path, content_type, &headers).await
}

async fn video_subtitle(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((klass, id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;

    let dir = format!("Videos/{klass}/{id}");
    for (name, content_type) in [("subtitle.vtt", "text/vtt"), ("subtitle.ass", "text/plain")] {
        match state.resources.get_file(&actor, &format!("{dir}/{name}")).await {
            Ok(path) => return serve_ranged(path, content_type, &headers).await,
            Err(abyss_shared::AbyssError::NotFound) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ApiError::NotFound("no subtitle".into()))
}

async fn video_bulkquery(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(klass): Path<String>,
    Query(query): Query<TokenQuery>,
    Json(ids): Json<Vec<String>>,
) -> Result<Json<HashMap<String, Option<String>>>, ApiError> {
    bulk_summaries(&state, &query, &headers, addr.ip(), ids, |id| {
        format!("Videos/{klass}/{id}/summary.json")
    })
    .await
}

// ---------------------------------------------------------------------------
// Image endpoints
// ---------------------------------------------------------------------------

async fn image_index(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    listing(&state, &query, &headers, addr.ip(), "Images".to_string()).await
}

async fn image_summary(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    json_file(
        &state,
        &query,
        &headers,
        addr.ip(),
        format!("Images/{id}/summary.json"),
    )
    .await
}

async fn image_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((id, file)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    let path = state
        .resources
        .get_file(&actor, &format!("Images/{id}/{file}"))
        .await?;
    let content_type = match file.rsplit('.').next() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    serve_ranged(path, content_type, &headers).await
}

async fn image_bulkquery(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(ids): Json<Vec<String>>,
) -> Result<Json<HashMap<String, Option<String>>>, ApiError> {
    bulk_summaries(&state, &query, &headers, addr.ip(), ids, |id| {
        format!("Images/{id}/summary.json")
    })
    .await
}

// ---------------------------------------------------------------------------
// Live endpoints
// ---------------------------------------------------------------------------

async fn live_item(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((id, token, item)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    let path = state
        .resources
        .get_file(&actor, &format!("Live/{id}/{item}"))
        .await?;
    let content_type = match item.rsplit('.').next() {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    };
    serve_ranged(path, content_type, &headers).await
}

async fn live_create(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<StatusCode, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    state.resources.create_channel(&actor, &id).await?;
    Ok(StatusCode::OK)
}

async fn live_delete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<StatusCode, ApiError> {
    let token = token_from(&query, &headers)?;
    let actor = resolve_actor(&state, &token, addr.ip()).await?;
    state.resources.remove_channel(&actor, &id).await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Shared handler plumbing
// ---------------------------------------------------------------------------

async fn listing(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
    ip: IpAddr,
    path: String,
) -> Result<Json<Vec<String>>, ApiError> {
    let token = token_from(query, headers)?;
    let actor = resolve_actor(state, &token, ip).await?;
    let mut names = state.resources.query(&actor, &path).await?;
    names.sort();
    Ok(Json(names))
}

async fn json_file(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
    ip: IpAddr,
    path: String,
) -> Result<Response, ApiError> {
    let token = token_from(query, headers)?;
    let actor = resolve_actor(state, &token, ip).await?;
    let text = state.resources.get_string(&actor, &path).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        text,
    )
        .into_response())
}

async fn bulk_summaries(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
    ip: IpAddr,
    ids: Vec<String>,
    to_path: impl Fn(&str) -> String,
) -> Result<Json<HashMap<String, Option<String>>>, ApiError> {
    let token = token_from(query, headers)?;
    let actor = resolve_actor(state, &token, ip).await?;

    let paths: Vec<String> = ids.iter().map(|id| to_path(id)).collect();
    let mut texts = state.resources.get_all_string(&actor, &paths).await?;

    let mut out = HashMap::with_capacity(ids.len());
    for (id, path) in ids.into_iter().zip(paths) {
        out.insert(id, texts.remove(&path).flatten());
    }
    Ok(Json(out))
}

/// Stream a file, honoring a single `bytes=` range.
async fn serve_ranged(
    path: PathBuf,
    content_type: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::NotFound("no such file".into()))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, len));

    let response = match range {
        Some((start, end)) => {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let stream = ReaderStream::new(file.take(end - start + 1));
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, end - start + 1)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{len}"),
                )
                .body(Body::from_stream(stream))
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, len)
            .body(Body::from_stream(ReaderStream::new(file))),
    };
    response.map_err(|e| ApiError::Internal(e.to_string()))
}

/// `bytes=a-b` / `bytes=a-` / `bytes=-suffix`; anything else (or an
/// unsatisfiable start) falls back to a full response.
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_text, end_text) = spec.split_once('-')?;
    if len == 0 {
        return None;
    }

    if start_text.is_empty() {
        let suffix: u64 = end_text.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((len.saturating_sub(suffix), len - 1));
    }

    let start: u64 = start_text.parse().ok()?;
    if start >= len {
        return None;
    }
    let end = if end_text.is_empty() {
        len - 1
    } else {
        end_text.parse::<u64>().ok()?.min(len - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
