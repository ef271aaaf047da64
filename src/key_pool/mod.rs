//! API key 池模块。
//!
//! 目标：把对上游的只读调用分摊到多个 API key 上，按“配额日”记账，
//! 在单个 key 配额耗尽或出错时自动切换，并在每日边界滚动重置。
//!
//! 账本只存在于内存中，进程重启后按配置重建；多个进程共享同一个 key 时，
//! 本地账本看不到其他进程的消耗，计数只是近似值（上游的配额拒绝仍会被正确处理）。

mod cost;
mod failover;
mod ledger;
mod manager;
mod reset_task;
mod selector;
mod types;

pub use cost::{CostTable, OperationKind};
pub use failover::{
    Dispatcher, FailureKind, Metered, RetryPolicy, Sleeper, UpstreamFailure, tokio_sleeper,
};
pub use ledger::{DEFAULT_RESET_TZ, ResetBoundary};
pub use manager::{Clock, KeyPool, Reservation};
pub use reset_task::{seconds_until_reset, spawn_reset_task};
pub use types::{
    ChargeOutcome, ChargeRecord, CredentialKey, DEFAULT_DAILY_BUDGET, KeyStatus, KeyUsage,
    QuotaError, UsageEntry, mask_secret,
};
