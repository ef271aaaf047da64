use crate::key_pool::ledger::{self, ResetBoundary};
use crate::key_pool::selector;
use crate::key_pool::types::{
    CredentialKey, KeyStatus, KeyUsage, QuotaError, UsageEntry, mask_secret,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Key 池：集中维护所有 key 的账本与轮询游标。
///
/// 所有状态变更都在同一把锁内完成，且锁内不做任何 I/O：
/// 选择时预占余量，网络请求在锁外进行，结果确认后再回到锁内结算。
pub struct KeyPool {
    inner: Mutex<Inner>,
    boundary: ResetBoundary,
    clock: Clock,
}

#[derive(Debug, Default)]
struct Inner {
    keys: Vec<CredentialKey>,
    /// 下一次轮询的起点（上次选中位置 + 1）。
    cursor: usize,
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("boundary", &self.boundary)
            .field("keys", &self.len())
            .finish()
    }
}

impl KeyPool {
    pub fn new(boundary: ResetBoundary) -> Self {
        Self::with_clock(boundary, Arc::new(Utc::now))
    }

    pub fn with_clock(boundary: ResetBoundary, clock: Clock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            boundary,
            clock,
        }
    }

    /// 按配置构建 key 池；空池属于启动期配置错误。
    pub fn from_entries<I>(entries: I, boundary: ResetBoundary) -> Result<Self, QuotaError>
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let pool = Self::new(boundary);
        for (secret, budget) in entries {
            pool.register(&secret, budget)?;
        }
        if pool.is_empty() {
            return Err(QuotaError::EmptyPool);
        }
        Ok(pool)
    }

    pub fn boundary(&self) -> ResetBoundary {
        self.boundary
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register(&self, secret: &str, daily_budget: u32) -> Result<(), QuotaError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(QuotaError::InvalidKey("secret 为空".to_string()));
        }
        if daily_budget == 0 {
            return Err(QuotaError::InvalidKey(format!(
                "{} 的日配额必须大于 0",
                mask_secret(secret)
            )));
        }

        let today = self.boundary.day_of(self.now());
        let mut inner = self.lock();
        if inner.keys.iter().any(|k| k.secret == secret) {
            return Err(QuotaError::DuplicateKey(mask_secret(secret)));
        }
        inner
            .keys
            .push(CredentialKey::new(secret.to_string(), daily_budget, today));
        tracing::debug!(key = %mask_secret(secret), budget = daily_budget, "注册 API key");
        Ok(())
    }

    pub fn current_usage(&self, secret: &str) -> Result<KeyUsage, QuotaError> {
        let inner = self.lock();
        let k = find(&inner.keys, secret)?;
        Ok(KeyUsage {
            consumed: k.consumed,
            budget: k.daily_budget,
            status: k.status,
        })
    }

    /// 直接扣费（调用方需事先确认余量）。
    pub fn charge(&self, secret: &str, units: u32) -> Result<(), QuotaError> {
        let mut inner = self.lock();
        let k = find_mut(&mut inner.keys, secret)?;
        ledger::charge(k, units)?;
        if k.status == KeyStatus::Exhausted {
            tracing::info!(key = %k.masked(), consumed = k.consumed, "key 今日配额已用尽");
        }
        Ok(())
    }

    /// 跨过重置边界时清零各 key 的用量；返回被重置的 key 数量。
    pub fn reset_if_new_day(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        reset_locked(&mut inner, self.boundary, now)
    }

    /// 按轮询策略选出一个余量足够的 key（不预占）。
    pub fn select_key(&self, estimated_cost: u32) -> Result<String, QuotaError> {
        let now = self.now();
        let mut inner = self.lock();
        let idx = select_locked(&mut inner, self.boundary, now, estimated_cost, &HashSet::new())?;
        Ok(inner.keys[idx].secret.clone())
    }

    /// 选择并预占余量，二者在同一临界区内完成。
    ///
    /// 返回的 `Reservation` 在 `commit` 前被丢弃（失败、取消）时会自动释放预占，不产生扣费。
    pub fn reserve(
        &self,
        estimated_cost: u32,
        exclude: &HashSet<String>,
    ) -> Result<Reservation<'_>, QuotaError> {
        let now = self.now();
        let mut inner = self.lock();
        let idx = select_locked(&mut inner, self.boundary, now, estimated_cost, exclude)?;
        let k = &mut inner.keys[idx];
        k.reserved = k.reserved.saturating_add(estimated_cost);
        Ok(Reservation {
            pool: self,
            secret: k.secret.clone(),
            units: estimated_cost,
            settled: false,
        })
    }

    /// 上游明确返回配额耗尽：无论本地计数如何，立即标记为 exhausted。
    pub fn mark_exhausted(&self, secret: &str) -> Result<(), QuotaError> {
        let now = self.now();
        let mut inner = self.lock();
        let k = find_mut(&mut inner.keys, secret)?;
        k.last_quota_exceeded = Some(now);
        if k.status != KeyStatus::Disabled {
            k.status = KeyStatus::Exhausted;
        }
        tracing::warn!(
            key = %k.masked(),
            consumed = k.consumed,
            budget = k.daily_budget,
            "上游报告 key 配额耗尽，已标记为 exhausted"
        );
        Ok(())
    }

    /// 运维开关：禁用的 key 不参与选择，且不会被每日重置恢复。
    pub fn set_enabled(&self, index: usize, enable: bool) -> Result<UsageEntry, QuotaError> {
        let now = self.now();
        let mut inner = self.lock();
        reset_locked(&mut inner, self.boundary, now);
        let Some(k) = inner.keys.get_mut(index) else {
            return Err(QuotaError::UnknownKey(format!("#{index}")));
        };
        k.status = match (enable, k.status) {
            (false, _) => KeyStatus::Disabled,
            (true, KeyStatus::Disabled) if k.consumed >= k.daily_budget => KeyStatus::Exhausted,
            (true, KeyStatus::Disabled) => KeyStatus::Active,
            (true, s) => s,
        };
        tracing::info!(key = %k.masked(), status = k.status.as_str(), "更新 key 状态");
        Ok(UsageEntry::new(index, k))
    }

    pub fn usage_report(&self) -> Vec<UsageEntry> {
        let now = self.now();
        let mut inner = self.lock();
        reset_locked(&mut inner, self.boundary, now);
        inner
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| UsageEntry::new(i, k))
            .collect()
    }

    fn settle(&self, secret: &str, reserved: u32, actual: Option<u32>) -> Result<(), QuotaError> {
        let mut inner = self.lock();
        let k = find_mut(&mut inner.keys, secret)?;
        k.reserved = k.reserved.saturating_sub(reserved);
        let Some(units) = actual else {
            return Ok(());
        };
        ledger::charge(k, units)?;
        if k.status == KeyStatus::Exhausted {
            tracing::info!(key = %k.masked(), consumed = k.consumed, "key 今日配额已用尽");
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // 锁内只有纯内存的账本操作，即使发生 panic 状态也保持一致。
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 一次进行中请求对某个 key 的余量预占。
#[derive(Debug)]
pub struct Reservation<'a> {
    pool: &'a KeyPool,
    secret: String,
    units: u32,
    settled: bool,
}

impl Reservation<'_> {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    /// 确认成功：释放预占并按实际消耗扣费。
    pub fn commit(mut self, actual_units: u32) -> Result<(), QuotaError> {
        self.settled = true;
        self.pool.settle(&self.secret, self.units, Some(actual_units))
    }

    /// 放弃本次预占，不扣费。
    pub fn release(mut self) {
        self.settled = true;
        let _ = self.pool.settle(&self.secret, self.units, None);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.pool.settle(&self.secret, self.units, None);
        }
    }
}

fn reset_locked(inner: &mut Inner, boundary: ResetBoundary, now: DateTime<Utc>) -> usize {
    let today = boundary.day_of(now);
    let mut count = 0usize;
    for k in &mut inner.keys {
        if ledger::reset_if_new_day(k, today) {
            count += 1;
        }
    }
    if count > 0 {
        tracing::info!(%today, count, "跨过配额重置边界，已重置 key 用量");
    }
    count
}

fn select_locked(
    inner: &mut Inner,
    boundary: ResetBoundary,
    now: DateTime<Utc>,
    cost: u32,
    exclude: &HashSet<String>,
) -> Result<usize, QuotaError> {
    reset_locked(inner, boundary, now);
    let idx = selector::select_round_robin(&inner.keys, inner.cursor, cost, exclude)
        .ok_or(QuotaError::NoAvailableKey { cost })?;
    inner.cursor = (idx + 1) % inner.keys.len();

    let k = &mut inner.keys[idx];
    k.total_requests += 1;
    k.last_used = Some(now);
    tracing::debug!(
        key = %k.masked(),
        cost,
        consumed = k.consumed,
        reserved = k.reserved,
        "选中 API key"
    );
    Ok(idx)
}

fn find<'a>(keys: &'a [CredentialKey], secret: &str) -> Result<&'a CredentialKey, QuotaError> {
    keys.iter()
        .find(|k| k.secret == secret)
        .ok_or_else(|| QuotaError::UnknownKey(mask_secret(secret)))
}

fn find_mut<'a>(
    keys: &'a mut [CredentialKey],
    secret: &str,
) -> Result<&'a mut CredentialKey, QuotaError> {
    keys.iter_mut()
        .find(|k| k.secret == secret)
        .ok_or_else(|| QuotaError::UnknownKey(mask_secret(secret)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fixed_clock(start: &str) -> (Clock, Arc<AtomicI64>) {
        let ts = DateTime::parse_from_rfc3339(start).unwrap().timestamp();
        let cell = Arc::new(AtomicI64::new(ts));
        let c = cell.clone();
        let clock: Clock = Arc::new(move || {
            DateTime::from_timestamp(c.load(Ordering::SeqCst), 0).unwrap_or_default()
        });
        (clock, cell)
    }

    fn pool(budgets: &[u32]) -> (KeyPool, Arc<AtomicI64>) {
        let (clock, cell) = fixed_clock("2024-03-01T12:00:00Z");
        let p = KeyPool::with_clock(ResetBoundary::utc(), clock);
        for (i, b) in budgets.iter().enumerate() {
            p.register(&format!("secret-key-{i}"), *b).unwrap();
        }
        (p, cell)
    }

    #[test]
    fn register_rejects_duplicates_and_blank() {
        let (p, _) = pool(&[10]);
        assert_eq!(
            p.register("secret-key-0", 10),
            Err(QuotaError::DuplicateKey("...ey-0".to_string()))
        );
        assert!(matches!(p.register("  ", 10), Err(QuotaError::InvalidKey(_))));
        assert!(matches!(p.register("other-key", 0), Err(QuotaError::InvalidKey(_))));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn from_entries_requires_at_least_one_key() {
        let err = KeyPool::from_entries(Vec::new(), ResetBoundary::utc()).unwrap_err();
        assert_eq!(err, QuotaError::EmptyPool);

        let p = KeyPool::from_entries(
            vec![("a-key-1".to_string(), 5), ("a-key-2".to_string(), 7)],
            ResetBoundary::utc(),
        )
        .unwrap();
        assert_eq!(p.current_usage("a-key-2").unwrap().budget, 7);
    }

    #[test]
    fn two_key_scenario_routes_to_sibling() {
        let (p, _) = pool(&[5, 5]);
        p.charge("secret-key-0", 3).unwrap();
        assert!(matches!(
            p.charge("secret-key-0", 3),
            Err(QuotaError::QuotaExceeded { .. })
        ));
        assert_eq!(p.current_usage("secret-key-0").unwrap().consumed, 3);
        assert_eq!(p.select_key(3).unwrap(), "secret-key-1");
    }

    #[test]
    fn single_key_search_budget_exhausts_exactly() {
        let (p, _) = pool(&[10_000]);
        for _ in 0..100 {
            let secret = p.select_key(100).unwrap();
            p.charge(&secret, 100).unwrap();
        }
        let usage = p.current_usage("secret-key-0").unwrap();
        assert_eq!(usage.consumed, 10_000);
        assert_eq!(usage.status, KeyStatus::Exhausted);
        assert_eq!(p.select_key(100), Err(QuotaError::NoAvailableKey { cost: 100 }));
    }

    #[test]
    fn round_robin_visits_each_key_once_in_stable_order() {
        let (p, _) = pool(&[100, 100, 100, 100]);
        let first: Vec<String> = (0..4).map(|_| p.select_key(1).unwrap()).collect();
        let second: Vec<String> = (0..4).map(|_| p.select_key(1).unwrap()).collect();
        assert_eq!(
            first,
            vec!["secret-key-0", "secret-key-1", "secret-key-2", "secret-key-3"]
        );
        assert_eq!(first, second);
    }

    #[test]
    fn reset_after_boundary_reactivates_exhausted_keys() {
        let (p, clock) = pool(&[5, 5]);
        p.charge("secret-key-0", 5).unwrap();
        p.charge("secret-key-1", 2).unwrap();
        p.set_enabled(1, false).unwrap();

        assert_eq!(p.reset_if_new_day(p.now()), 0);
        clock.fetch_add(24 * 3600, Ordering::SeqCst);
        assert_eq!(p.reset_if_new_day(p.now()), 2);

        let a = p.current_usage("secret-key-0").unwrap();
        assert_eq!((a.consumed, a.status), (0, KeyStatus::Active));
        let b = p.current_usage("secret-key-1").unwrap();
        assert_eq!((b.consumed, b.status), (0, KeyStatus::Disabled));
    }

    #[test]
    fn selection_triggers_daily_reset() {
        let (p, clock) = pool(&[5]);
        p.charge("secret-key-0", 5).unwrap();
        assert!(p.select_key(1).is_err());
        clock.fetch_add(24 * 3600, Ordering::SeqCst);
        assert_eq!(p.select_key(1).unwrap(), "secret-key-0");
    }

    #[test]
    fn reservations_hold_headroom_until_settled() {
        let (p, _) = pool(&[1]);
        let none = HashSet::new();
        let r = p.reserve(1, &none).unwrap();
        assert_eq!(p.reserve(1, &none).unwrap_err(), QuotaError::NoAvailableKey { cost: 1 });

        drop(r);
        assert_eq!(p.current_usage("secret-key-0").unwrap().consumed, 0);

        let r = p.reserve(1, &none).unwrap();
        r.commit(1).unwrap();
        let usage = p.current_usage("secret-key-0").unwrap();
        assert_eq!((usage.consumed, usage.status), (1, KeyStatus::Exhausted));
        assert_eq!(p.usage_report()[0].reserved, 0);
    }

    #[test]
    fn mark_exhausted_overrides_local_counter() {
        let (p, _) = pool(&[100, 100]);
        p.mark_exhausted("secret-key-0").unwrap();
        let usage = p.current_usage("secret-key-0").unwrap();
        assert_eq!((usage.consumed, usage.status), (0, KeyStatus::Exhausted));
        assert_eq!(p.select_key(1).unwrap(), "secret-key-1");
        assert!(p.usage_report()[0].last_quota_exceeded.is_some());
    }

    #[test]
    fn re_enabling_respects_consumed_units() {
        let (p, _) = pool(&[5, 5]);
        p.charge("secret-key-0", 5).unwrap();
        p.set_enabled(0, false).unwrap();
        assert_eq!(p.set_enabled(0, true).unwrap().status, KeyStatus::Exhausted);
        p.set_enabled(1, false).unwrap();
        assert_eq!(p.set_enabled(1, true).unwrap().status, KeyStatus::Active);
        assert!(matches!(p.set_enabled(9, true), Err(QuotaError::UnknownKey(_))));
    }

    #[test]
    fn usage_report_never_exposes_secrets() {
        let (p, _) = pool(&[5, 5]);
        let report = p.usage_report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[1].masked_key, "...ey-1");
        assert!(p.current_usage("missing").is_err());
    }

    #[test]
    fn concurrent_charges_never_overshoot_budget() {
        let (p, _) = pool(&[10]);
        let p = Arc::new(p);
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || p.charge("secret-key-0", 1).is_ok())
            })
            .collect();
        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|v| *v)
            .count();
        assert_eq!(ok, 10);
        assert_eq!(p.current_usage("secret-key-0").unwrap().consumed, 10);
    }

    #[test]
    fn concurrent_reservations_share_last_unit_once() {
        let (p, _) = pool(&[1]);
        let p = Arc::new(p);
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match p.reserve(1, &HashSet::new()) {
                        Ok(r) => r.commit(1).is_ok(),
                        Err(_) => false,
                    }
                })
            })
            .collect();
        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|v| *v)
            .count();
        assert_eq!(ok, 1);
        assert_eq!(p.current_usage("secret-key-0").unwrap().consumed, 1);
    }
}
