//! 원시 이벤트를 `ChangeRecord`로 변환

use crate::error::Result;
use crate::events::{ChangeRecord, Operation, RawEvent};
use crate::table_map::TableMetadataCache;

pub struct RecordBuilder;

impl RecordBuilder {
    /// 현재 메타데이터 캐시 기준으로 변경 레코드 생성
    ///
    /// 테이블 ID가 캐시에 없으면 `UnresolvedTable` 에러를 반환합니다.
    pub fn build(
        event: &RawEvent,
        operation: Operation,
        cache: &TableMetadataCache,
    ) -> Result<ChangeRecord> {
        let table = cache.resolve(event.table_id)?;
        let affected_row_count = event.row_count();

        Ok(ChangeRecord {
            timestamp: event.timestamp,
            schema_name: table.schema.clone(),
            table_name: table.table.clone(),
            operation,
            affected_row_count,
            summary: format!("affected rows: {}", affected_row_count),
        })
    }
}
