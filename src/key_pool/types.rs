use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

/// YouTube Data API v3 每个 key 的默认日配额。
pub const DEFAULT_DAILY_BUDGET: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Exhausted,
    Disabled,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Exhausted => "exhausted",
            Self::Disabled => "disabled",
        }
    }
}

/// 单个凭证 key 的账本状态。
#[derive(Debug, Clone)]
pub struct CredentialKey {
    pub secret: String,
    pub daily_budget: u32,
    /// 今日已确认消耗的配额单位。
    pub consumed: u32,
    /// 已被进行中请求预占、但尚未确认结果的单位。
    pub reserved: u32,
    /// 最近一次重置所在的“配额日”（按重置边界时区计算）。
    pub last_reset: NaiveDate,
    pub status: KeyStatus,
    pub total_requests: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_quota_exceeded: Option<DateTime<Utc>>,
}

impl CredentialKey {
    pub fn new(secret: String, daily_budget: u32, today: NaiveDate) -> Self {
        Self {
            secret,
            daily_budget,
            consumed: 0,
            reserved: 0,
            last_reset: today,
            status: KeyStatus::Active,
            total_requests: 0,
            last_used: None,
            last_quota_exceeded: None,
        }
    }

    /// 剩余可分配的单位（扣除已预占部分）。
    pub fn headroom(&self) -> u32 {
        self.daily_budget
            .saturating_sub(self.consumed)
            .saturating_sub(self.reserved)
    }

    pub fn can_serve(&self, cost: u32) -> bool {
        self.status == KeyStatus::Active && self.headroom() >= cost
    }

    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }
}

/// `current_usage` 的返回值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage {
    pub consumed: u32,
    pub budget: u32,
    pub status: KeyStatus,
}

/// 面向运维的用量报告条目（绝不包含完整 secret）。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    /// 在 key 池中的位置，启用/禁用接口按它寻址。
    pub index: usize,
    pub masked_key: String,
    pub consumed: u32,
    pub budget: u32,
    pub reserved: u32,
    pub status: KeyStatus,
    pub total_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_quota_exceeded: Option<DateTime<Utc>>,
    pub last_reset: NaiveDate,
}

impl UsageEntry {
    pub fn new(index: usize, k: &CredentialKey) -> Self {
        Self {
            index,
            masked_key: k.masked(),
            consumed: k.consumed,
            budget: k.daily_budget,
            reserved: k.reserved,
            status: k.status,
            total_requests: k.total_requests,
            last_used: k.last_used,
            last_quota_exceeded: k.last_quota_exceeded,
            last_reset: k.last_reset,
        }
    }
}

/// 一次尝试的结果，仅用于结构化日志。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Success,
    QuotaRejected,
    TransientError,
    ErrorResponse,
}

impl ChargeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::QuotaRejected => "quota_rejected",
            Self::TransientError => "transient_error",
            Self::ErrorResponse => "error_response",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChargeRecord {
    pub cost: u32,
    pub masked_key: String,
    pub outcome: ChargeOutcome,
}

impl ChargeRecord {
    pub fn emit(&self) {
        tracing::debug!(
            key = %self.masked_key,
            cost = self.cost,
            outcome = self.outcome.as_str(),
            "配额记录"
        );
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("key 已存在: {0}")]
    DuplicateKey(String),

    #[error("无效的 key: {0}")]
    InvalidKey(String),

    #[error("未配置任何 API key")]
    EmptyPool,

    #[error("未知的 key: {0}")]
    UnknownKey(String),

    #[error("key {key} 配额不足：已用 {consumed}/{budget}，本次需要 {requested}")]
    QuotaExceeded {
        key: String,
        consumed: u32,
        budget: u32,
        requested: u32,
    },

    #[error("所有 key 的今日配额已耗尽（需要 {cost} 单位），请在配额重置后再试")]
    NoAvailableKey { cost: u32 },

    #[error("上游暂时不可用（已重试 {attempts} 次）: {message}")]
    UpstreamUnavailable { attempts: u32, message: String },

    #[error("上游拒绝请求: {message}")]
    FatalRequest {
        status: Option<u16>,
        message: String,
    },
}

/// 日志/报告用的脱敏表示：仅保留末 4 位。
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "...".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_only_last_four_chars() {
        assert_eq!(mask_secret("AIzaSyA-abcdef1234"), "...1234");
        assert_eq!(mask_secret("abcd"), "...");
        assert_eq!(mask_secret(""), "...");
    }

    #[test]
    fn headroom_accounts_for_reservations() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut k = CredentialKey::new("secret-1".to_string(), 10, today);
        k.consumed = 4;
        k.reserved = 3;
        assert_eq!(k.headroom(), 3);
        assert!(k.can_serve(3));
        assert!(!k.can_serve(4));

        k.status = KeyStatus::Disabled;
        assert!(!k.can_serve(1));
    }

    #[test]
    fn usage_entry_serializes_masked_key() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let k = CredentialKey::new("super-secret-9876".to_string(), 100, today);
        let v = serde_json::to_value(UsageEntry::new(2, &k)).unwrap();
        assert_eq!(v["index"], 2);
        assert_eq!(v["maskedKey"], "...9876");
        assert_eq!(v["status"], "active");
        assert!(!v.to_string().contains("super-secret"));
    }
}
