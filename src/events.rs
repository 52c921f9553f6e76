//! 워치독 이벤트 타입 및 데이터 구조 정의
//!
//! - `RawEvent`: 이벤트 소스가 전달하는 원시 이벤트 (테이블 ID 기준)
//! - `ChangeRecord`: 스키마/테이블 이름이 채워진 정규화된 변경 레코드
//! - `SubscriptionFilter`: 소스가 전달할 이벤트 범주

use crate::error::{Result, WatchError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 원시 이벤트 타입 태그
pub mod tags {
    pub const TABLE_MAP: &str = "TableMap";
    pub const WRITE_ROWS: &str = "WriteRows";
    pub const UPDATE_ROWS: &str = "UpdateRows";
    pub const DELETE_ROWS: &str = "DeleteRows";
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 소스가 전달할 수 있는 이벤트 범주
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventCategory {
    TableMap,
    WriteRows,
    UpdateRows,
    DeleteRows,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::TableMap,
        EventCategory::WriteRows,
        EventCategory::UpdateRows,
        EventCategory::DeleteRows,
    ];

    /// 설정 문자열 이름 (`tablemap`, `writerows`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            EventCategory::TableMap => "tablemap",
            EventCategory::WriteRows => "writerows",
            EventCategory::UpdateRows => "updaterows",
            EventCategory::DeleteRows => "deleterows",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// 구독 필터 - 세션 시작 시 고정됨
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    categories: BTreeSet<EventCategory>,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        SubscriptionFilter::all()
    }
}

impl SubscriptionFilter {
    pub fn new(categories: impl IntoIterator<Item = EventCategory>) -> Self {
        SubscriptionFilter {
            categories: categories.into_iter().collect(),
        }
    }

    /// 테이블 맵 + 모든 행 이벤트
    pub fn all() -> Self {
        Self::new(EventCategory::ALL)
    }

    /// 쉼표로 구분된 범주 목록 파싱 (예: "tablemap,writerows")
    pub fn parse(list: &str) -> Result<Self> {
        let mut categories = BTreeSet::new();
        for name in list.split(',').filter(|s| !s.trim().is_empty()) {
            let category = EventCategory::from_name(name).ok_or_else(|| {
                WatchError::ConfigError(format!("알 수 없는 이벤트 범주: {}", name.trim()))
            })?;
            categories.insert(category);
        }

        if categories.is_empty() {
            return Err(WatchError::ConfigError(
                "구독할 이벤트 범주가 없습니다".to_string(),
            ));
        }

        Ok(SubscriptionFilter { categories })
    }

    pub fn includes(&self, category: EventCategory) -> bool {
        self.categories.contains(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = EventCategory> + '_ {
        self.categories.iter().copied()
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.categories().map(|c| c.name()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// 스키마(데이터베이스) + 테이블 이름
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableName {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// 원시 이벤트 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventBody {
    /// 테이블 ID → 스키마/테이블 매핑 알림
    TableMap(TableName),
    /// 행 변경 이벤트 (행 내용은 다루지 않고 개수만 유지)
    Rows { row_count: usize },
    Other,
}

/// 이벤트 소스가 전달하는 원시 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// 타입 태그 ("TableMap", "WriteRows", ...)
    pub type_name: String,
    /// 업스트림 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 현재 메타데이터 캐시 기준으로만 의미 있는 테이블 ID
    pub table_id: u64,
    pub body: RawEventBody,
}

impl RawEvent {
    pub fn table_map(
        timestamp: u32,
        table_id: u64,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        RawEvent {
            type_name: tags::TABLE_MAP.to_string(),
            timestamp,
            table_id,
            body: RawEventBody::TableMap(TableName::new(schema, table)),
        }
    }

    pub fn rows(type_name: impl Into<String>, timestamp: u32, table_id: u64, row_count: usize) -> Self {
        RawEvent {
            type_name: type_name.into(),
            timestamp,
            table_id,
            body: RawEventBody::Rows { row_count },
        }
    }

    pub fn other(type_name: impl Into<String>, timestamp: u32) -> Self {
        RawEvent {
            type_name: type_name.into(),
            timestamp,
            table_id: 0,
            body: RawEventBody::Other,
        }
    }

    /// 영향받은 행 수 (행 이벤트가 아니면 0)
    pub fn row_count(&self) -> usize {
        match self.body {
            RawEventBody::Rows { row_count } => row_count,
            _ => 0,
        }
    }
}

/// 정규화된 변경 레코드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub timestamp: u32,
    pub schema_name: String,
    pub table_name: String,
    pub operation: Operation,
    pub affected_row_count: usize,
    pub summary: String,
}

impl ChangeRecord {
    /// 업스트림 타임스탬프를 UTC 시각으로 변환
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::from(self.timestamp), 0).single()
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
