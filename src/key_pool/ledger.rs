//! 配额账本：单 key 的扣费与按“配额日”滚动重置。
//!
//! 这里只处理单个 `CredentialKey` 的状态迁移；互斥由 `KeyPool` 的锁保证。

use crate::key_pool::types::{CredentialKey, KeyStatus, QuotaError};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// YouTube 官方文档：配额在太平洋时间午夜重置。
pub const DEFAULT_RESET_TZ: &str = "America/Los_Angeles";

/// 每日重置边界：以指定时区的午夜作为“一天”的开始。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetBoundary {
    tz: Tz,
}

impl ResetBoundary {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self { tz: chrono_tz::UTC }
    }

    pub fn parse(name: &str) -> Result<Self, String> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Self::default());
        }
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|e| format!("无法识别的时区 {name}: {e}"))
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// `now` 所在的配额日。
    pub fn day_of(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// `now` 之后的下一个重置时刻（UTC）。
    pub fn next_reset_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut day = self.day_of(now);
        // 夏令时切换当天午夜可能不存在，顺延到下一天兜底。
        for _ in 0..3 {
            day = day.succ_opt().unwrap_or(day);
            let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
            if let Some(dt) = self.tz.from_local_datetime(&midnight).earliest() {
                return dt.with_timezone(&Utc);
            }
        }
        now + Duration::hours(24)
    }
}

impl Default for ResetBoundary {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Los_Angeles,
        }
    }
}

/// 扣费：不允许部分扣费；成功后若已达预算则转为 exhausted。
pub fn charge(key: &mut CredentialKey, units: u32) -> Result<(), QuotaError> {
    let next = key.consumed.saturating_add(units);
    if next > key.daily_budget {
        return Err(QuotaError::QuotaExceeded {
            key: key.masked(),
            consumed: key.consumed,
            budget: key.daily_budget,
            requested: units,
        });
    }
    key.consumed = next;
    if key.consumed >= key.daily_budget && key.status == KeyStatus::Active {
        key.status = KeyStatus::Exhausted;
    }
    Ok(())
}

/// 跨过重置边界时清零；disabled 保持不变。返回是否发生了重置。
pub fn reset_if_new_day(key: &mut CredentialKey, today: NaiveDate) -> bool {
    if key.last_reset == today {
        return false;
    }
    key.consumed = 0;
    key.last_reset = today;
    key.last_quota_exceeded = None;
    if key.status != KeyStatus::Disabled {
        key.status = KeyStatus::Active;
    }
    true
}
