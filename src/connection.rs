//! MySQL 연결 설정 및 메타데이터 조회 연결

use crate::error::{Result, WatchError};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// MySQL 연결 설정
#[derive(Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 복제 클라이언트 server_id (MySQL 서버와 겹치지 않아야 함)
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("server_id", &self.server_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn build_opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()));
        Opts::from(builder)
    }
}

/// 현재 binlog 파일과 위치
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u64,
}

impl fmt::Display for BinlogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

/// 스트리밍 시작 전 서버 상태 조회용 연결
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = tokio::time::timeout(config.timeout, Conn::new(config.build_opts()))
            .await
            .map_err(|_| {
                WatchError::SourceUnavailable(format!(
                    "Timed out connecting to {}",
                    config.address()
                ))
            })?
            .map_err(|e| {
                WatchError::SourceUnavailable(format!(
                    "Failed to connect to {}: {}",
                    config.address(),
                    e
                ))
            })?;

        Ok(MySqlConnection { conn })
    }

    /// Binlog 상태 조회 (8.4+ 구문 실패 시 이전 구문 사용)
    pub async fn get_binlog_status(&mut self) -> Result<BinlogStatus> {
        let row: Option<Row> = match self.conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), trying SHOW MASTER STATUS", e);
                self.conn
                    .query_first("SHOW MASTER STATUS")
                    .await
                    .map_err(|e| {
                        WatchError::QueryError(format!("Failed to query binlog status: {}", e))
                    })?
            }
        };

        let row = row.ok_or_else(|| {
            WatchError::QueryError("No binlog status available (is log_bin enabled?)".to_string())
        })?;

        let file: Option<String> = row.get(0usize);
        let position: Option<u64> = row.get(1usize);
        match (file, position) {
            (Some(file), Some(position)) => Ok(BinlogStatus { file, position }),
            _ => Err(WatchError::QueryError(
                "Unexpected binlog status row".to_string(),
            )),
        }
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&mut self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| WatchError::QueryError("Binlog format not found".to_string()))
    }

    pub async fn get_server_version(&mut self) -> Result<String> {
        let version: Option<String> = self
            .conn
            .query_first("SELECT VERSION()")
            .await
            .map_err(|e| WatchError::QueryError(format!("Failed to query version: {}", e)))?;

        Ok(version.unwrap_or_default())
    }

    async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let query = format!("SELECT @@global.{}", name);
        self.conn
            .query_first(query)
            .await
            .map_err(|e| WatchError::QueryError(format!("Failed to query {}: {}", name, e)))
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| WatchError::QueryError(format!("Failed to disconnect: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.address(), "localhost:3306");
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("127.0.0.1", "video-api-user")
            .with_password("secret")
            .with_port(3307)
            .with_server_id(42);
        assert_eq!(config.username, "video-api-user");
        assert_eq!(config.address(), "127.0.0.1:3307");
        assert_eq!(config.server_id, 42);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig::new("db", "root").with_password("hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_binlog_status_display() {
        let status = BinlogStatus {
            file: "mysql-bin.000003".to_string(),
            position: 4097,
        };
        assert_eq!(status.to_string(), "mysql-bin.000003:4097");
    }
}
