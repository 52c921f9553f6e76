//! 워치독 에러 타입

use crate::events::Operation;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    /// 업스트림 소스 연결 실패 또는 유지 실패 (세션 치명적)
    #[error("소스 연결 불가: {0}")]
    SourceUnavailable(String),

    /// 테이블 맵 이벤트 없이 도착한 변경 이벤트
    #[error("확인되지 않은 테이블 ID: {table_id}")]
    UnresolvedTable { table_id: u64 },

    /// 싱크 전달 실패
    #[error("{operation} 핸들러 전달 에러: {reason}")]
    HandlerDelivery { operation: Operation, reason: String },

    #[error("{0} 연산에 등록된 핸들러가 없습니다")]
    MissingHandler(Operation),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("잘못된 상태: {0}")]
    InvalidState(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl From<io::Error> for WatchError {
    fn from(err: io::Error) -> Self {
        WatchError::IoError(err.to_string())
    }
}

impl WatchError {
    /// 세션 전체를 중단시키는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatchError::SourceUnavailable(_) | WatchError::InvalidState(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
