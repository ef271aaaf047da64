//! 故障转移协议：SELECT -> CALL -> {SUCCESS, QUOTA_REJECTED, TRANSIENT_ERROR, FATAL_ERROR}。
//!
//! - 配额拒绝：标记 key 为 exhausted，换下一个 key；每次操作最多选择 key 池大小次
//! - 临时错误：同一个 key 指数退避重试，不扣费、不标记
//! - 致命错误：不重试、不扣费，直接返回
//!
//! 网络调用期间不持有 key 池的锁；调用方取消（future 被丢弃）时预占自动释放。

use crate::key_pool::cost::{CostTable, OperationKind};
use crate::key_pool::manager::{KeyPool, Reservation};
use crate::key_pool::types::{ChargeOutcome, ChargeRecord, QuotaError, UsageEntry};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// 上游失败的分类，由具体客户端的错误类型给出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 上游明确表示该 key 配额耗尽。
    QuotaRejected,
    /// 网络错误、5xx、超时。
    Transient,
    /// 请求本身有问题（参数错误、鉴权失败等），重试无意义。
    Fatal,
    /// 上游已计费，但响应在业务上属于错误（例如资源不存在）。
    ErrorResponse,
}

pub trait UpstreamFailure: fmt::Display {
    fn kind(&self) -> FailureKind;

    fn status(&self) -> Option<u16> {
        None
    }
}

/// 带实际消耗的调用结果（用于成本可变的操作）。
#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub value: T,
    pub units: u32,
}

pub type Sleeper = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn tokio_sleeper() -> Sleeper {
    Arc::new(|d: Duration| tokio::time::sleep(d).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 同一个 key 上的总尝试次数（含首次）。
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 次（从 0 开始）失败后的等待时间：base * 2^attempt，封顶 max_delay。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// 单个 key 上一轮调用（含临时错误重试）的结局。
enum KeyAttempt<T> {
    Served(Metered<T>),
    QuotaRejected(String),
    Unavailable { attempts: u32, message: String },
    Fatal { status: Option<u16>, message: String, billed: bool },
}

/// 对外的调用入口：把 key 选择、扣费、故障转移包装成一次 `perform_call`。
pub struct Dispatcher {
    pool: Arc<KeyPool>,
    costs: CostTable,
    retry: RetryPolicy,
    sleep: Sleeper,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(pool: Arc<KeyPool>, costs: CostTable, retry: RetryPolicy) -> Self {
        Self::with_sleeper(pool, costs, retry, tokio_sleeper())
    }

    pub fn with_sleeper(
        pool: Arc<KeyPool>,
        costs: CostTable,
        retry: RetryPolicy,
        sleep: Sleeper,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        Self {
            pool,
            costs,
            retry,
            sleep,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn cost_of(&self, op: OperationKind) -> u32 {
        self.costs.cost(op)
    }

    pub fn usage_report(&self) -> Vec<UsageEntry> {
        self.pool.usage_report()
    }

    /// 固定成本的调用：成功后按成本表扣费。
    pub async fn perform_call<T, E, F, Fut>(
        &self,
        op: OperationKind,
        mut call: F,
    ) -> Result<T, QuotaError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: UpstreamFailure,
    {
        let units = self.cost_of(op);
        self.perform_metered_call(op, move |key| {
            call(key).map(move |res| res.map(|value| Metered { value, units }))
        })
        .await
    }

    /// 可变成本的调用：成功后按调用方报告的实际消耗扣费。
    pub async fn perform_metered_call<T, E, F, Fut>(
        &self,
        op: OperationKind,
        mut call: F,
    ) -> Result<T, QuotaError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Metered<T>, E>>,
        E: UpstreamFailure,
    {
        let cost = self.cost_of(op);
        let mut exclude: HashSet<String> = HashSet::new();
        let max_selects = self.pool.len().max(1);

        for _ in 0..max_selects {
            let reservation = self.pool.reserve(cost, &exclude)?;
            let secret = reservation.secret().to_string();
            let masked = reservation.masked();

            match self.call_with_retry(op, &reservation, &mut call).await {
                KeyAttempt::Served(m) => {
                    record(cost, &masked, ChargeOutcome::Success);
                    if let Err(e) = reservation.commit(m.units) {
                        // 上游已经响应，结果照常返回；本地账本视该 key 为已耗尽。
                        tracing::warn!(op = op.as_str(), key = %masked, error = %e, "实际消耗超出余量");
                        self.pool.mark_exhausted(&secret)?;
                    }
                    return Ok(m.value);
                }
                KeyAttempt::QuotaRejected(message) => {
                    record(cost, &masked, ChargeOutcome::QuotaRejected);
                    reservation.release();
                    tracing::warn!(op = op.as_str(), key = %masked, %message, "key 配额被上游拒绝，切换下一个 key");
                    self.pool.mark_exhausted(&secret)?;
                    exclude.insert(secret);
                }
                KeyAttempt::Unavailable { attempts, message } => {
                    reservation.release();
                    return Err(QuotaError::UpstreamUnavailable { attempts, message });
                }
                KeyAttempt::Fatal {
                    status,
                    message,
                    billed,
                } => {
                    if billed {
                        record(cost, &masked, ChargeOutcome::ErrorResponse);
                        if let Err(e) = reservation.commit(cost) {
                            tracing::warn!(key = %masked, error = %e, "错误响应扣费失败");
                        }
                    } else {
                        reservation.release();
                    }
                    return Err(QuotaError::FatalRequest { status, message });
                }
            }
        }

        Err(QuotaError::NoAvailableKey { cost })
    }

    async fn call_with_retry<T, E, F, Fut>(
        &self,
        op: OperationKind,
        reservation: &Reservation<'_>,
        call: &mut F,
    ) -> KeyAttempt<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Metered<T>, E>>,
        E: UpstreamFailure,
    {
        let masked = reservation.masked();
        let mut last_message = String::new();

        for attempt in 0..self.retry.max_attempts {
            let err = match call(reservation.secret().to_string()).await {
                Ok(m) => return KeyAttempt::Served(m),
                Err(e) => e,
            };

            match err.kind() {
                FailureKind::QuotaRejected => return KeyAttempt::QuotaRejected(err.to_string()),
                FailureKind::Fatal => {
                    return KeyAttempt::Fatal {
                        status: err.status(),
                        message: err.to_string(),
                        billed: false,
                    };
                }
                FailureKind::ErrorResponse => {
                    return KeyAttempt::Fatal {
                        status: err.status(),
                        message: err.to_string(),
                        billed: true,
                    };
                }
                FailureKind::Transient => {
                    record(reservation.units(), &masked, ChargeOutcome::TransientError);
                    last_message = err.to_string();
                    if attempt + 1 >= self.retry.max_attempts {
                        break;
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::info!(
                        op = op.as_str(),
                        key = %masked,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_message,
                        "上游临时错误，退避后重试"
                    );
                    (self.sleep)(delay).await;
                }
            }
        }

        tracing::warn!(
            op = op.as_str(),
            key = %masked,
            attempts = self.retry.max_attempts,
            "上游临时错误已达到最大重试次数"
        );
        KeyAttempt::Unavailable {
            attempts: self.retry.max_attempts,
            message: last_message,
        }
    }
}

fn record(cost: u32, masked: &str, outcome: ChargeOutcome) {
    ChargeRecord {
        cost,
        masked_key: masked.to_string(),
        outcome,
    }
    .emit();
}
