use crate::key_pool::mask_secret;
use std::borrow::Cow;
use std::time::Duration;

/// 日志等级：
/// - off：不输出详细请求响应
/// - low：输出客户端请求/响应摘要
/// - medium：额外输出上游请求/响应（格式化、脱敏）
/// - high：上游响应体原样输出（URL 中的 key 仍然脱敏）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" | "upstream" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn upstream_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(request_id: &str, method: &str, path: &str) {
    tracing::info!(request_id, "[客户端请求] {method} {path}");
}

pub fn client_response(request_id: &str, status: u16, duration: Duration) {
    tracing::info!(
        request_id,
        "[客户端响应] {} {}ms",
        status,
        format_duration_ms(duration)
    );
}

pub fn upstream_request(method: &str, url: &str) {
    tracing::info!("[上游请求] {method} {}", redact_url(url));
}

pub fn upstream_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    let body = if level.raw_enabled() {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n====================== 上游响应 ========================\n[上游响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body
    );
}

/// 把 URL 查询串中的 `key=` 参数替换为脱敏表示。
pub fn redact_url(url: &str) -> Cow<'_, str> {
    let Some((base, query)) = url.split_once('?') else {
        return Cow::Borrowed(url);
    };
    if !query.split('&').any(|p| p.starts_with("key=")) {
        return Cow::Borrowed(url);
    }

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.strip_prefix("key=") {
            Some(secret) => format!("key={}", mask_secret(secret)),
            None => pair.to_string(),
        })
        .collect();
    Cow::Owned(format!("{base}?{}", redacted.join("&")))
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 大包不做 JSON 解析，避免日志本身带来额外内存与 CPU 开销。
    const MAX_PARSE_BYTES: usize = 512 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        return format!(
            "(body too large: {} bytes)\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(&bytes[..8 * 1024]))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => sonic_rs::to_string_pretty(&v).unwrap_or_else(|_| v.to_string()),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 16 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(LogLevel::parse(" HIGH "), LogLevel::High);
        assert_eq!(LogLevel::parse("upstream"), LogLevel::Medium);
        assert_eq!(LogLevel::parse("low"), LogLevel::Low);
        assert_eq!(LogLevel::parse("nope"), LogLevel::Off);
        assert!(LogLevel::Medium.client_enabled());
        assert!(!LogLevel::Low.upstream_enabled());
    }

    #[test]
    fn redact_url_masks_key_param() {
        let url = "https://example.test/youtube/v3/channels?part=snippet&id=UC1&key=AIzaSecretValue9876";
        assert_eq!(
            redact_url(url),
            "https://example.test/youtube/v3/channels?part=snippet&id=UC1&key=...9876"
        );
        assert!(matches!(redact_url("https://x.test/a?b=1"), Cow::Borrowed(_)));
        assert!(matches!(redact_url("https://x.test/a"), Cow::Borrowed(_)));
    }

    #[test]
    fn body_formatting_truncates_non_json() {
        let long = "x".repeat(20 * 1024);
        let out = format_body_bytes(long.as_bytes());
        assert!(out.ends_with("...[TRUNCATED]"));
        assert!(format_body_bytes(b"{\"a\":1}").contains("\"a\""));
    }
}
