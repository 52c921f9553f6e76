//! 연산별 핸들러 및 디스패치 테이블

use crate::error::{Result, WatchError};
use crate::events::{ChangeRecord, Operation};
use crate::sink::ChangeSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// 이 핸들러가 처리하는 연산
    fn operation(&self) -> Operation;

    async fn handle(&self, record: ChangeRecord) -> Result<()>;
}

async fn deliver_to(sink: &dyn ChangeSink, record: ChangeRecord) -> Result<()> {
    let operation = record.operation;
    sink.deliver(record)
        .await
        .map_err(|e| WatchError::HandlerDelivery {
            operation,
            reason: e.to_string(),
        })
}

/// INSERT 레코드를 싱크로 전달
pub struct InsertHandler {
    sink: Arc<dyn ChangeSink>,
}

impl InsertHandler {
    pub fn new(sink: Arc<dyn ChangeSink>) -> Self {
        InsertHandler { sink }
    }
}

#[async_trait]
impl OperationHandler for InsertHandler {
    fn operation(&self) -> Operation {
        Operation::Insert
    }

    async fn handle(&self, record: ChangeRecord) -> Result<()> {
        debug!("insert: {}", record.qualified_table());
        deliver_to(self.sink.as_ref(), record).await
    }
}

/// DELETE 레코드를 싱크로 전달
pub struct DeleteHandler {
    sink: Arc<dyn ChangeSink>,
}

impl DeleteHandler {
    pub fn new(sink: Arc<dyn ChangeSink>) -> Self {
        DeleteHandler { sink }
    }
}

#[async_trait]
impl OperationHandler for DeleteHandler {
    fn operation(&self) -> Operation {
        Operation::Delete
    }

    async fn handle(&self, record: ChangeRecord) -> Result<()> {
        debug!("delete: {}", record.qualified_table());
        deliver_to(self.sink.as_ref(), record).await
    }
}

/// UPDATE 레코드는 받기만 하고 아무것도 내보내지 않음
///
/// 변경 전/후 행 데이터가 없으므로 비교(diff)도 하지 않습니다.
#[derive(Debug, Default)]
pub struct UpdateHandler;

#[async_trait]
impl OperationHandler for UpdateHandler {
    fn operation(&self) -> Operation {
        Operation::Update
    }

    async fn handle(&self, record: ChangeRecord) -> Result<()> {
        debug!(
            "update on {} ({}) not forwarded",
            record.qualified_table(),
            record.summary
        );
        Ok(())
    }
}

/// 연산 → 핸들러 테이블
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<Operation, Box<dyn OperationHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 핸들러 세 개를 하나의 싱크에 연결
    pub fn with_sink(sink: Arc<dyn ChangeSink>) -> Self {
        let mut table = HandlerTable::new();
        table
            .register(InsertHandler::new(sink.clone()))
            .register(UpdateHandler)
            .register(DeleteHandler::new(sink));
        table
    }

    /// 같은 연산의 기존 핸들러는 교체됨
    pub fn register(&mut self, handler: impl OperationHandler + 'static) -> &mut Self {
        self.handlers.insert(handler.operation(), Box::new(handler));
        self
    }

    pub fn contains(&self, operation: Operation) -> bool {
        self.handlers.contains_key(&operation)
    }

    pub async fn dispatch(&self, record: ChangeRecord) -> Result<()> {
        let handler = self
            .handlers
            .get(&record.operation)
            .ok_or(WatchError::MissingHandler(record.operation))?;
        handler.handle(record).await
    }
}
