//! MySQL Binlog 변경 감시 (Change Data Capture)
//!
//! 복제 스트림의 테이블 ID 기반 행 이벤트를 스키마/테이블 이름이 채워진
//! 변경 레코드로 바꾸어 연산별 핸들러로 전달합니다.
//! 주요 기능:
//! - 테이블 맵 메타데이터 캐시
//! - 태그 기반 이벤트 분류
//! - 연산별 핸들러와 교체 가능한 싱크
//! - 수명 주기를 가진 스트림 컨트롤러

pub mod binlog;
pub mod binlog_client;
pub mod builder;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod events;
pub mod handler;
pub mod protocol;
pub mod sink;
pub mod source;
pub mod table_map;

pub use binlog_client::BinlogSource;
pub use builder::RecordBuilder;
pub use classifier::{Classification, Classifier};
pub use config::{SinkKind, WatchConfig};
pub use connection::ConnectionConfig;
pub use controller::{ControllerState, SessionStats, StreamController};
pub use error::{Result, WatchError};
pub use events::{ChangeRecord, EventCategory, Operation, RawEvent, SubscriptionFilter};
pub use handler::{HandlerTable, OperationHandler};
pub use sink::ChangeSink;
pub use source::EventSource;
pub use table_map::TableMetadataCache;
