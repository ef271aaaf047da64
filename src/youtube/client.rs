use crate::config::Config;
use crate::key_pool::{Dispatcher, FailureKind, OperationKind, QuotaError, UpstreamFailure};
use crate::logging::{self, LogLevel};
use crate::youtube::types::{ErrorEnvelope, ListResponse, SearchResult};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// 上游明确表示“该 key 当日配额耗尽”的 reason。
const QUOTA_REASONS: [&str; 2] = ["quotaExceeded", "dailyLimitExceeded"];
/// 短时限流：与日配额无关，退避后同一个 key 可以继续使用。
const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("YouTube API 错误 {status} ({reason}): {message}")]
    Http {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transport(reqwest::Error),

    #[error("解析上游响应失败: {0}")]
    Json(#[from] sonic_rs::Error),
}

impl From<reqwest::Error> for ApiError {
    /// reqwest 的错误文本会带上完整 URL（含 `key=`），包装时去掉。
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.without_url())
    }
}

impl UpstreamFailure for ApiError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Http { status, reason, .. } => classify_http(*status, reason),
            Self::NotFound(_) | Self::Json(_) => FailureKind::ErrorResponse,
            Self::Transport(e) if e.is_builder() => FailureKind::Fatal,
            Self::Transport(_) => FailureKind::Transient,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Json(_) => None,
        }
    }
}

fn classify_http(status: u16, reason: &str) -> FailureKind {
    if QUOTA_REASONS.contains(&reason) {
        return FailureKind::QuotaRejected;
    }
    if status == 429 || status >= 500 || RATE_LIMIT_REASONS.contains(&reason) {
        return FailureKind::Transient;
    }
    if status == 404 {
        return FailureKind::ErrorResponse;
    }
    FailureKind::Fatal
}

/// YouTube Data API v3 只读客户端；每次调用都经过 key 池调度。
#[derive(Debug, Clone)]
pub struct YouTubeClient {
    http: reqwest::Client,
    base: String,
    dispatcher: Arc<Dispatcher>,
    log_level: LogLevel,
}

impl YouTubeClient {
    pub fn new(cfg: &Config, dispatcher: Arc<Dispatcher>) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base: cfg.api_base.trim_end_matches('/').to_string(),
            dispatcher,
            log_level: cfg.log_level(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn get_channel_by_id(&self, channel_id: &str) -> Result<sonic_rs::Value, QuotaError> {
        let params = [
            ("part", "snippet,statistics,contentDetails"),
            ("id", channel_id),
        ];
        self.first_item(OperationKind::ListChannels, "channels", &params, channel_id)
            .await
    }

    pub async fn get_video_by_id(&self, video_id: &str) -> Result<sonic_rs::Value, QuotaError> {
        let params = [("part", "snippet,contentDetails,statistics"), ("id", video_id)];
        self.first_item(OperationKind::ListVideos, "videos", &params, video_id)
            .await
    }

    /// 批量拉取视频统计（单次最多 50 个 id，仍只计 1 单位）。
    pub async fn list_videos(&self, video_ids: &[String]) -> Result<ListResponse, QuotaError> {
        let ids = video_ids.join(",");
        let params = [("part", "snippet,contentDetails,statistics"), ("id", ids.as_str())];
        self.dispatcher
            .perform_call(OperationKind::ListVideos, |key| {
                self.fetch::<ListResponse>("videos", &params, key)
            })
            .await
    }

    pub async fn list_playlist_items(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ListResponse, QuotaError> {
        let max_results = max_results.clamp(1, 50).to_string();
        let mut params = vec![
            ("part", "snippet,contentDetails"),
            ("playlistId", playlist_id),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token.filter(|t| !t.is_empty()) {
            params.push(("pageToken", token));
        }
        self.dispatcher
            .perform_call(OperationKind::ListPlaylistItems, |key| {
                self.fetch::<ListResponse>("playlistItems", &params, key)
            })
            .await
    }

    /// 按用户名/handle 搜索频道，返回第一个匹配的频道 id（search 成本 100 单位）。
    pub async fn search_channel_id(&self, query: &str) -> Result<Option<String>, QuotaError> {
        let params = [
            ("part", "snippet"),
            ("q", query),
            ("type", "channel"),
            ("maxResults", "1"),
        ];
        let resp = self
            .dispatcher
            .perform_call(OperationKind::Search, |key| {
                self.fetch::<ListResponse<SearchResult>>("search", &params, key)
            })
            .await?;
        Ok(resp.items.into_iter().find_map(|it| it.id.channel_id))
    }

    async fn first_item(
        &self,
        op: OperationKind,
        path: &str,
        params: &[(&str, &str)],
        id: &str,
    ) -> Result<sonic_rs::Value, QuotaError> {
        self.dispatcher
            .perform_call(op, |key| async move {
                let resp = self.fetch::<ListResponse>(path, params, key).await?;
                resp.items
                    .into_iter()
                    .next()
                    .ok_or_else(|| ApiError::NotFound(format!("{path} {id}")))
            })
            .await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
        key: String,
    ) -> Result<T, ApiError> {
        let url = format!("{}/{}", self.base, path);
        let req = self
            .http
            .get(url)
            .query(params)
            .query(&[("key", key.as_str())])
            .build()?;
        if self.log_level.upstream_enabled() {
            logging::upstream_request("GET", req.url().as_str());
        }

        let start = Instant::now();
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if self.log_level.upstream_enabled() {
            logging::upstream_response(self.log_level, status.as_u16(), start.elapsed(), &bytes);
        }

        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice::<T>(&bytes)?)
    }
}

fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    match sonic_rs::from_slice::<ErrorEnvelope>(body) {
        Ok(env) => ApiError::Http {
            status,
            reason: env
                .error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .find(|r| !r.is_empty())
                .unwrap_or_default(),
            message: env.error.message,
        },
        Err(_) => ApiError::Http {
            status,
            reason: String::new(),
            message: String::from_utf8_lossy(body).chars().take(512).collect(),
        },
    }
}
