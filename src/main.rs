pub mod config;
pub mod error;
pub mod gateway;
pub mod key_pool;
pub mod logging;
pub mod util;
pub mod youtube;

use anyhow::Context;
use key_pool::{CostTable, Dispatcher, KeyPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load().context("读取配置失败")?;

    init_tracing(&cfg);

    let boundary = cfg
        .reset_boundary()
        .map_err(anyhow::Error::msg)
        .context("解析 QUOTA_RESET_TZ 失败")?;

    // 空池、重复 key 都在这里直接失败，不带病启动。
    let pool = Arc::new(
        KeyPool::from_entries(cfg.key_budgets(), boundary).context("初始化 key 池失败")?,
    );
    tracing::info!(
        "已加载 {} 个 API key，配额重置时区 {}",
        pool.len(),
        boundary.tz().name()
    );
    for entry in pool.usage_report() {
        tracing::debug!(key = %entry.masked_key, budget = entry.budget, "key 已注册");
    }

    // 无流量时也按边界清零，运维报告始终是当日数据。
    key_pool::spawn_reset_task(pool.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        CostTable::default(),
        cfg.retry_policy(),
    ));
    let youtube =
        youtube::YouTubeClient::new(&cfg, dispatcher).context("初始化 YouTubeClient 失败")?;

    let state = Arc::new(gateway::AppState {
        youtube,
        pool,
        log_level: cfg.log_level(),
    });
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // 依赖库日志默认 warn；本项目自身日志至少为 info，
    // 避免环境中预设的 RUST_LOG=warn 把配额相关日志过滤掉。
    let filter = {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,ytquota=info")
        } else if env.contains("ytquota") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},ytquota=info"))
        }
    };
    let filter = if cfg.log_level().upstream_enabled() {
        filter.add_directive(
            "ytquota=debug"
                .parse()
                .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
    } else {
        filter
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
