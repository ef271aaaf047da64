use crate::error::AppError;
use crate::key_pool::{KeyPool, QuotaError, UsageEntry, seconds_until_reset};
use crate::logging::{self, LogLevel};
use crate::util::id;
use crate::youtube::YouTubeClient;
use crate::youtube::types::ListResponse;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub youtube: YouTubeClient,
    pub pool: Arc<KeyPool>,
    pub log_level: LogLevel,
}

impl AppState {
    /// 全部 key 耗尽时带上距离下次重置的秒数，提示调用方“重置后再试”。
    fn quota_error(&self, err: QuotaError) -> AppError {
        match err {
            QuotaError::NoAvailableKey { .. } => {
                AppError::quota_exhausted(err, seconds_until_reset(&self.pool))
            }
            other => AppError::Quota(other),
        }
    }
}

pub async fn handle_health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub keys: Vec<UsageEntry>,
    pub total_consumed: u64,
    pub total_budget: u64,
    pub reset_timezone: String,
    pub seconds_until_reset: i64,
}

pub async fn handle_quota(State(state): State<Arc<AppState>>) -> Json<QuotaReport> {
    let keys = state.pool.usage_report();
    Json(QuotaReport {
        total_consumed: keys.iter().map(|k| k.consumed as u64).sum(),
        total_budget: keys.iter().map(|k| k.budget as u64).sum(),
        keys,
        reset_timezone: state.pool.boundary().tz().name().to_string(),
        seconds_until_reset: seconds_until_reset(&state.pool),
    })
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub index: usize,
    pub enable: bool,
}

pub async fn handle_toggle(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<UsageEntry>, AppError> {
    let entry = state.pool.set_enabled(req.index, req.enable)?;
    Ok(Json(entry))
}

pub async fn handle_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<sonic_rs::Value>, AppError> {
    let channel_id = non_empty(&channel_id, "channel id")?;
    let item = state
        .youtube
        .get_channel_by_id(channel_id)
        .await
        .map_err(|e| state.quota_error(e))?;
    Ok(Json(item))
}

pub async fn handle_video(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<String>,
) -> Result<Json<sonic_rs::Value>, AppError> {
    let video_id = non_empty(&video_id, "video id")?;
    let item = state
        .youtube
        .get_video_by_id(video_id)
        .await
        .map_err(|e| state.quota_error(e))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
pub struct VideosQuery {
    #[serde(default)]
    pub ids: String,
}

/// 批量查询视频，逗号分隔，单次最多 50 个（videos.list 上限）。
pub async fn handle_videos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VideosQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let ids: Vec<String> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(AppError::bad_request("ids 不能为空"));
    }
    if ids.len() > 50 {
        return Err(AppError::bad_request("ids 最多 50 个"));
    }
    let page = state
        .youtube
        .list_videos(&ids)
        .await
        .map_err(|e| state.quota_error(e))?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

/// 按 handle/用户名解析频道：search（100 单位）+ channels.list（1 单位）。
pub async fn handle_search_channel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<sonic_rs::Value>, AppError> {
    let q = non_empty(query.q.trim_start_matches('@'), "q")?;
    let channel_id = state
        .youtube
        .search_channel_id(q)
        .await
        .map_err(|e| state.quota_error(e))?
        .ok_or_else(|| AppError::not_found(format!("未找到频道: {q}")))?;
    let item = state
        .youtube
        .get_channel_by_id(&channel_id)
        .await
        .map_err(|e| state.quota_error(e))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistQuery {
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default)]
    pub max_results: Option<u32>,
}

pub async fn handle_playlist_items(
    State(state): State<Arc<AppState>>,
    Path(playlist_id): Path<String>,
    Query(query): Query<PlaylistQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let playlist_id = non_empty(&playlist_id, "playlist id")?;
    let page = state
        .youtube
        .list_playlist_items(
            playlist_id,
            query.page_token.as_deref(),
            query.max_results.unwrap_or(50),
        )
        .await
        .map_err(|e| state.quota_error(e))?;
    Ok(Json(page))
}

/// 客户端请求日志（DEBUG=low 及以上）。
pub async fn log_requests(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if !state.log_level.client_enabled() {
        return next.run(req).await;
    }

    let request_id = id::request_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    logging::client_request(&request_id, method.as_str(), &path);

    let resp = next.run(req).await;
    logging::client_response(&request_id, resp.status().as_u16(), start.elapsed());
    resp
}

fn non_empty<'a>(value: &'a str, name: &str) -> Result<&'a str, AppError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(AppError::bad_request(format!("{name} 不能为空")));
    }
    Ok(v)
}
