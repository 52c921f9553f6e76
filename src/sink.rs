//! 변경 레코드 싱크
//!
//! 핸들러는 `ChangeSink`를 통해서만 레코드를 내보냅니다. 출력, 저장, 알림 등
//! 실제 동작은 싱크 구현이 결정합니다.

use crate::error::{Result, WatchError};
use crate::events::ChangeRecord;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn deliver(&self, record: ChangeRecord) -> Result<()>;
}

/// tracing 로그로 레코드 출력
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ChangeSink for LogSink {
    async fn deliver(&self, record: ChangeRecord) -> Result<()> {
        let at = record
            .occurred_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| record.timestamp.to_string());

        info!(
            operation = record.operation.as_str(),
            db_name = %record.schema_name,
            table_name = %record.table_name,
            at = %at,
            "{}",
            record.summary
        );
        Ok(())
    }
}

/// 레코드마다 JSON 한 줄씩 기록
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> ChangeSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, record: ChangeRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// 프로세스 내부 소비자에게 채널로 전달
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ChangeRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ChangeRecord>) -> Self {
        ChannelSink { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChangeRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelSink { tx }, rx)
    }
}

#[async_trait]
impl ChangeSink for ChannelSink {
    async fn deliver(&self, record: ChangeRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| WatchError::ChannelClosed)
    }
}
