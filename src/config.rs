//! 환경 변수 기반 설정

use crate::connection::ConnectionConfig;
use crate::error::{Result, WatchError};
use crate::events::SubscriptionFilter;
use crate::sink::{ChangeSink, JsonLinesSink, LogSink};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// 변경 레코드 출력 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// tracing 로그
    Log,
    /// 표준 출력에 JSON Lines
    Json,
}

impl FromStr for SinkKind {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(SinkKind::Log),
            "json" => Ok(SinkKind::Json),
            other => Err(WatchError::ConfigError(format!("알 수 없는 싱크: {}", other))),
        }
    }
}

impl SinkKind {
    pub fn build(&self) -> Arc<dyn ChangeSink> {
        match self {
            SinkKind::Log => Arc::new(LogSink),
            SinkKind::Json => Arc::new(JsonLinesSink::stdout()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub connection: ConnectionConfig,
    pub subscription: SubscriptionFilter,
    pub sink: SinkKind,
}

impl WatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 변수 조회 함수를 받아 설정 생성 (없는 값은 기본값 사용)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ConnectionConfig::default();

        let connection = ConnectionConfig {
            hostname: lookup("DB_HOST").unwrap_or(defaults.hostname),
            port: parse_or("DB_PORT", &lookup, defaults.port)?,
            username: lookup("DB_USER").unwrap_or(defaults.username),
            password: lookup("DB_PASSWORD").unwrap_or(defaults.password),
            server_id: parse_or("DB_SERVER_ID", &lookup, defaults.server_id)?,
            timeout: Duration::from_secs(parse_or(
                "DB_CONNECT_TIMEOUT_SECS",
                &lookup,
                defaults.timeout.as_secs(),
            )?),
        };

        let subscription = match lookup("WATCHDOG_EVENTS") {
            Some(list) => SubscriptionFilter::parse(&list)?,
            None => SubscriptionFilter::all(),
        };

        let sink = match lookup("WATCHDOG_SINK") {
            Some(value) => value.parse()?,
            None => SinkKind::Log,
        };

        Ok(WatchConfig {
            connection,
            subscription,
            sink,
        })
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| WatchError::ConfigError(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
