//! 后台重置任务：在每个配额重置边界醒来，清零各 key 的当日用量。
//!
//! 选择 key 前本来就会检查一次重置；这里保证无流量时运维报告也能及时刷新。

use crate::key_pool::KeyPool;
use std::sync::Arc;
use std::time::Duration;

/// 越过边界后再多等一小会，避免时钟抖动导致提前醒来。
const BOUNDARY_SLACK: Duration = Duration::from_secs(1);
/// 单次 sleep 上限：系统时钟被调整时也能在合理时间内自我纠正。
const MAX_SLEEP: Duration = Duration::from_secs(60 * 60);

pub fn spawn_reset_task(pool: Arc<KeyPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = pool.now();
            let reset = pool.reset_if_new_day(now);
            if reset > 0 {
                tracing::info!("每日配额重置完成：{reset} 个 key");
            }

            let sleep_for = until_next_reset(&pool);
            tracing::debug!("下次配额重置检查将在 {:?} 后", sleep_for);
            tokio::time::sleep(sleep_for).await;
        }
    })
}

fn until_next_reset(pool: &KeyPool) -> Duration {
    let now = pool.now();
    let next = pool.boundary().next_reset_after(now);
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO) + BOUNDARY_SLACK;
    wait.min(MAX_SLEEP)
}

/// 距离下一个重置边界的剩余秒数（用于运维报告）。
pub fn seconds_until_reset(pool: &KeyPool) -> i64 {
    let now = pool.now();
    (pool.boundary().next_reset_after(now) - now).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pool::ResetBoundary;
    use chrono::{DateTime, Utc};

    #[test]
    fn sleep_is_capped_and_includes_slack() {
        let clock = Arc::new(|| {
            DateTime::parse_from_rfc3339("2024-01-01T23:59:30Z")
                .unwrap()
                .with_timezone(&Utc)
        });
        let pool = KeyPool::with_clock(ResetBoundary::utc(), clock);
        assert_eq!(until_next_reset(&pool), Duration::from_secs(31));

        let early = Arc::new(|| {
            DateTime::parse_from_rfc3339("2024-01-01T01:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        });
        let pool = KeyPool::with_clock(ResetBoundary::utc(), early);
        assert_eq!(until_next_reset(&pool), MAX_SLEEP);
    }

    #[tokio::test(start_paused = true)]
    async fn task_resets_stale_keys_when_started() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let start = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
            .unwrap()
            .timestamp();
        let ts = Arc::new(AtomicI64::new(start));
        let t = ts.clone();
        let clock = Arc::new(move || {
            DateTime::from_timestamp(t.load(Ordering::SeqCst), 0).unwrap_or_default()
        });
        let pool = Arc::new(KeyPool::with_clock(ResetBoundary::utc(), clock));
        pool.register("secret-key-0", 5).unwrap();
        pool.charge("secret-key-0", 5).unwrap();

        ts.fetch_add(24 * 3600, Ordering::SeqCst);
        let handle = spawn_reset_task(pool.clone());
        tokio::task::yield_now().await;

        let usage = pool.current_usage("secret-key-0").unwrap();
        assert_eq!(usage.consumed, 0);
        handle.abort();
    }
}
