//! YouTube Data API v3 只读客户端：仅覆盖入库层需要的几个列表接口。

pub mod client;
pub mod types;

pub use client::{ApiError, YouTubeClient};
