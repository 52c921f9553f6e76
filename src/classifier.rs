//! 이벤트 분류기 - 타입 태그를 변경 연산으로 매핑

use crate::events::{tags, Operation};
use std::collections::HashMap;

/// 분류 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Operation(Operation),
    Unknown,
}

/// 태그 → 연산 디스패치 테이블
///
/// 새로운 이벤트 범주는 `register`로 테이블 항목을 추가해서 지원합니다.
#[derive(Debug, Clone)]
pub struct Classifier {
    table: HashMap<String, Operation>,
}

impl Default for Classifier {
    fn default() -> Self {
        let mut classifier = Classifier {
            table: HashMap::new(),
        };
        classifier
            .register(tags::DELETE_ROWS, Operation::Delete)
            .register(tags::WRITE_ROWS, Operation::Insert)
            .register(tags::UPDATE_ROWS, Operation::Update);
        classifier
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, operation: Operation) -> &mut Self {
        self.table.insert(type_name.into(), operation);
        self
    }

    /// 테이블에 등록된 연산 (중복 제거, 정렬됨)
    pub fn operations(&self) -> Vec<Operation> {
        let mut operations: Vec<Operation> = self.table.values().copied().collect();
        operations.sort();
        operations.dedup();
        operations
    }

    pub fn classify(&self, type_name: &str) -> Classification {
        self.table
            .get(type_name)
            .map_or(Classification::Unknown, |op| Classification::Operation(*op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tags() {
        let classifier = Classifier::new();
        assert_eq!(
            classifier.classify("DeleteRows"),
            Classification::Operation(Operation::Delete)
        );
        assert_eq!(
            classifier.classify("WriteRows"),
            Classification::Operation(Operation::Insert)
        );
        assert_eq!(
            classifier.classify("UpdateRows"),
            Classification::Operation(Operation::Update)
        );
    }

    #[test]
    fn test_unknown_tags() {
        let classifier = Classifier::new();
        for tag in ["TableMap", "Query", "Rotate", "", "writerows", "DeleteRowsV1"] {
            assert_eq!(classifier.classify(tag), Classification::Unknown);
        }
    }

    #[test]
    fn test_register_extends_table() {
        let mut classifier = Classifier::new();
        classifier.register("PartialUpdateRows", Operation::Update);
        assert_eq!(
            classifier.classify("PartialUpdateRows"),
            Classification::Operation(Operation::Update)
        );
        assert_eq!(
            classifier.classify("WriteRows"),
            Classification::Operation(Operation::Insert)
        );
        assert_eq!(
            classifier.operations(),
            vec![Operation::Insert, Operation::Update, Operation::Delete]
        );
    }
}
