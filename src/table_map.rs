//! 테이블 메타데이터 캐시
//!
//! 복제 프로토콜이 부여한 테이블 ID를 스키마/테이블 이름에 매핑합니다.
//! ID는 세션 중 다른 테이블에 재할당될 수 있으므로 항상 현재 상태로 조회합니다.

use crate::error::{Result, WatchError};
use crate::events::TableName;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct TableMetadataCache {
    tables: HashMap<u64, TableName>,
}

impl TableMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 매핑 등록 또는 덮어쓰기
    pub fn observe(&mut self, table_id: u64, schema: &str, table: &str) {
        let name = TableName::new(schema, table);
        match self.tables.insert(table_id, name) {
            Some(previous) if previous.schema != schema || previous.table != table => {
                debug!(
                    "Table id {} reassigned: {} -> {}.{}",
                    table_id, previous, schema, table
                );
            }
            Some(_) => {}
            None => debug!("Table id {} mapped to {}.{}", table_id, schema, table),
        }
    }

    pub fn resolve(&self, table_id: u64) -> Result<&TableName> {
        self.tables
            .get(&table_id)
            .ok_or(WatchError::UnresolvedTable { table_id })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
