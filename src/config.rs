use crate::key_pool::{DEFAULT_DAILY_BUDGET, DEFAULT_RESET_TZ, ResetBoundary, RetryPolicy};
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// 单个 API key 的配置项：`secret` 或 `secret:budget`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub secret: String,
    pub budget: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_keys: Vec<KeyEntry>,
    pub daily_quota: u32,
    /// 配额重置边界的 IANA 时区，需与上游公布的重置时间核对。
    pub quota_reset_tz: String,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub api_base: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "YOUTUBE_API_KEYS")]
    youtube_api_keys: Option<String>,
    #[serde(alias = "YOUTUBE_DAILY_QUOTA")]
    youtube_daily_quota: Option<u32>,
    #[serde(alias = "QUOTA_RESET_TZ")]
    quota_reset_tz: Option<String>,

    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,
    #[serde(alias = "RETRY_BASE_DELAY_MS")]
    retry_base_delay_ms: Option<u64>,
    #[serde(alias = "RETRY_MAX_DELAY_MS")]
    retry_max_delay_ms: Option<u64>,

    #[serde(alias = "YOUTUBE_API_BASE")]
    youtube_api_base: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    /// 任一变量无法解析（例如 `YOUTUBE_DAILY_QUOTA=abc`）时直接报错，
    /// 不回退到默认值，否则会连带丢掉 `YOUTUBE_API_KEYS` 等其他配置。
    pub fn load() -> Result<Self, figment::Error> {
        load_dotenv();
        Self::from_figment(Figment::from(Env::raw()))
    }

    fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        figment.extract::<RawEnv>().map(Self::from_raw)
    }

    fn from_raw(raw: RawEnv) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_keys: parse_key_entries(raw.youtube_api_keys.as_deref().unwrap_or_default()),
            daily_quota: raw
                .youtube_daily_quota
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_DAILY_BUDGET),
            quota_reset_tz: raw
                .quota_reset_tz
                .unwrap_or_else(|| DEFAULT_RESET_TZ.to_string()),
            retry_max_attempts: raw.retry_max_attempts.unwrap_or(defaults.max_attempts),
            retry_base_delay_ms: raw
                .retry_base_delay_ms
                .unwrap_or(defaults.base_delay.as_millis() as u64),
            retry_max_delay_ms: raw
                .retry_max_delay_ms
                .unwrap_or(defaults.max_delay.as_millis() as u64),
            api_base: raw
                .youtube_api_base
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    /// (secret, 日配额)，未单独配置的 key 使用全局默认配额。
    pub fn key_budgets(&self) -> Vec<(String, u32)> {
        self.api_keys
            .iter()
            .map(|e| (e.secret.clone(), e.budget.unwrap_or(self.daily_quota)))
            .collect()
    }

    pub fn reset_boundary(&self) -> Result<ResetBoundary, String> {
        ResetBoundary::parse(&self.quota_reset_tz)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// 解析逗号分隔的 key 列表；`secret:budget` 的后缀不是数字时整体视为 secret。
pub fn parse_key_entries(value: &str) -> Vec<KeyEntry> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.rsplit_once(':') {
            Some((secret, budget)) if !secret.trim().is_empty() => {
                match budget.trim().parse::<u32>() {
                    Ok(n) => KeyEntry {
                        secret: secret.trim().to_string(),
                        budget: Some(n),
                    },
                    Err(_) => KeyEntry {
                        secret: p.to_string(),
                        budget: None,
                    },
                }
            }
            _ => KeyEntry {
                secret: p.to_string(),
                budget: None,
            },
        })
        .collect()
}

fn load_dotenv() {
    let Some(path) = find_dotenv_path() else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(&path) else {
        return;
    };

    for (key, value) in content.lines().filter_map(parse_dotenv_line) {
        // 已由真实环境变量提供的值优先，.env 只做补充。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量为 unsafe；这里在启动阶段、其他线程读取环境变量之前调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        // 不越过仓库根目录。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }
        dir = dir.parent()?;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }
    Some((key.to_string(), strip_inline_comment(raw).to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_entries_support_per_key_budget() {
        let entries = parse_key_entries(" AIzaA , AIzaB:500,, AIzaC:notanumber ");
        assert_eq!(
            entries,
            vec![
                KeyEntry {
                    secret: "AIzaA".to_string(),
                    budget: None
                },
                KeyEntry {
                    secret: "AIzaB".to_string(),
                    budget: Some(500)
                },
                KeyEntry {
                    secret: "AIzaC:notanumber".to_string(),
                    budget: None
                },
            ]
        );
        assert!(parse_key_entries("").is_empty());
    }

    #[test]
    fn defaults_apply_when_env_missing() {
        let cfg = Config::from_raw(RawEnv {
            youtube_api_keys: Some("k1,k2:20".to_string()),
            youtube_daily_quota: Some(0),
            ..Default::default()
        });
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert_eq!(
            cfg.key_budgets(),
            vec![("k1".to_string(), 10_000), ("k2".to_string(), 20)]
        );
        assert_eq!(cfg.reset_boundary().unwrap(), ResetBoundary::default());
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn retry_policy_is_sanitized() {
        let cfg = Config::from_raw(RawEnv {
            retry_max_attempts: Some(0),
            retry_base_delay_ms: Some(2_000),
            retry_max_delay_ms: Some(10),
            youtube_api_base: Some("http://127.0.0.1:9000/".to_string()),
            ..Default::default()
        });
        let p = cfg.retry_policy();
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.max_delay, Duration::from_millis(2_000));
        assert_eq!(cfg.api_base, "http://127.0.0.1:9000");
    }

    #[test]
    fn unparsable_value_is_reported_not_defaulted() {
        let err = Config::from_figment(
            Figment::new()
                .merge(("youtube_api_keys", "k1,k2"))
                .merge(("youtube_daily_quota", "abc")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("youtube_daily_quota"));

        let cfg = Config::from_figment(
            Figment::new()
                .merge(("youtube_api_keys", "k1,k2"))
                .merge(("youtube_daily_quota", 500u32)),
        )
        .unwrap();
        assert_eq!(
            cfg.key_budgets(),
            vec![("k1".to_string(), 500), ("k2".to_string(), 500)]
        );
    }

    #[test]
    fn dotenv_lines() {
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=x"), None);
        assert_eq!(
            parse_dotenv_line("export YOUTUBE_API_KEYS=\"a,b\""),
            Some(("YOUTUBE_API_KEYS".to_string(), "a,b".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("PORT=8080 # local"),
            Some(("PORT".to_string(), "8080".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("QUOTA_RESET_TZ=UTC"),
            Some(("QUOTA_RESET_TZ".to_string(), "UTC".to_string()))
        );
    }
}
