//! MySQL Binlog 이벤트 소스
//!
//! 복제 클라이언트로 접속해 현재 binlog 위치부터 이벤트를 받아 `RawEvent`로
//! 전달합니다. 전송 채널 용량이 1이므로 컨트롤러가 이전 이벤트를 끝낼
//! 때까지 다음 패킷을 읽지 않습니다.

use crate::binlog::BinlogDecoder;
use crate::connection::{BinlogStatus, ConnectionConfig, MySqlConnection};
use crate::error::{Result, WatchError};
use crate::events::{RawEvent, SubscriptionFilter};
use crate::protocol::{self, ErrPacket, PacketChannel};
use crate::source::{EventSource, EVENT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

pub struct BinlogSource {
    config: ConnectionConfig,
    stop: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl BinlogSource {
    pub fn new(config: ConnectionConfig) -> Self {
        BinlogSource {
            config,
            stop: CancellationToken::new(),
            task: None,
        }
    }

    /// 서버의 현재 binlog 위치 조회
    async fn current_position(&self) -> Result<BinlogStatus> {
        let mut conn = MySqlConnection::connect(&self.config).await?;

        let version = conn.get_server_version().await?;
        let format = conn.get_binlog_format().await?;
        if !format.eq_ignore_ascii_case("ROW") {
            warn!(
                "binlog_format is {} (server {}); row events will not be emitted",
                format, version
            );
        }

        let status = conn.get_binlog_status().await?;
        conn.close().await?;
        Ok(status)
    }

    /// 복제 연결 생성 및 COM_BINLOG_DUMP 전송
    async fn open_dump(&self, status: &BinlogStatus) -> Result<PacketChannel> {
        let mut channel = PacketChannel::connect(&self.config.address(), self.config.timeout).await?;
        protocol::authenticate(&mut channel, &self.config.username, &self.config.password).await?;

        match channel.execute("SET @master_binlog_checksum='NONE'").await {
            Ok(()) => debug!("Binlog checksum set to NONE"),
            Err(e) => warn!("Failed to disable binlog checksum: {}", e),
        }

        let command = create_binlog_dump_command(self.config.server_id, status)?;
        channel.send_command(&command).await?;
        info!(
            "Sent COM_BINLOG_DUMP: position={}, server_id={}",
            status, self.config.server_id
        );

        Ok(channel)
    }
}

#[async_trait]
impl EventSource for BinlogSource {
    async fn start(&mut self, filter: &SubscriptionFilter) -> Result<mpsc::Receiver<RawEvent>> {
        if self.task.is_some() || self.stop.is_cancelled() {
            return Err(WatchError::InvalidState(
                "Binlog source can only be started once".to_string(),
            ));
        }

        info!("Connecting to {}", self.config.address());
        let unavailable = |e: WatchError| match e {
            WatchError::SourceUnavailable(_) => e,
            other => WatchError::SourceUnavailable(other.to_string()),
        };

        let status = self.current_position().await.map_err(unavailable)?;
        let channel = self.open_dump(&status).await.map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.task = Some(tokio::spawn(stream_events(
            channel,
            filter.clone(),
            tx,
            self.stop.clone(),
        )));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| WatchError::SourceUnavailable(format!("Binlog reader task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

/// 패킷을 읽어 구독 범주의 이벤트만 전달
async fn stream_events(
    mut channel: PacketChannel,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<RawEvent>,
    stop: CancellationToken,
) -> Result<()> {
    let mut decoder = BinlogDecoder::new();
    let mut event_count: u64 = 0;

    info!("Binlog event streaming started");
    loop {
        // 중지 시 읽던 패킷은 버려지므로 이 채널은 다시 쓰지 않음
        let packet = tokio::select! {
            _ = stop.cancelled() => break,
            packet = channel.read_packet() => packet.map_err(|e| {
                WatchError::SourceUnavailable(format!("Binlog connection lost: {}", e))
            })?,
        };

        if protocol::is_error_packet(&packet) {
            let err = ErrPacket::parse(&packet)?;
            return Err(WatchError::SourceUnavailable(format!(
                "Server ended binlog stream: {}",
                err
            )));
        }
        if protocol::is_eof_packet(&packet) {
            return Err(WatchError::SourceUnavailable(
                "Server closed the binlog stream".to_string(),
            ));
        }
        if !protocol::is_ok_packet(&packet) {
            warn!("Skipping unexpected packet ({:02x?})", packet.first());
            continue;
        }

        event_count += 1;
        let Some(event) = subscribed_event(&mut decoder, &filter, &packet[1..]) else {
            continue;
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            sent = tx.send(event) => {
                if sent.is_err() {
                    debug!("Event receiver dropped");
                    break;
                }
            }
        }
    }

    info!("Binlog streaming ended after {} events", event_count);
    Ok(())
}

/// 이벤트를 디코딩하고 구독 범주에 속할 때만 반환
///
/// 테이블 맵은 구독하지 않아도 디코더가 컬럼 구조를 기억합니다.
fn subscribed_event(
    decoder: &mut BinlogDecoder,
    filter: &SubscriptionFilter,
    data: &[u8],
) -> Option<RawEvent> {
    let (category, event) = match decoder.decode(data) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Skipping undecodable binlog event: {}", e);
            return None;
        }
    };

    match category {
        Some(category) if filter.includes(category) => Some(event),
        _ => None,
    }
}

/// COM_BINLOG_DUMP 명령어 생성
fn create_binlog_dump_command(server_id: u32, status: &BinlogStatus) -> Result<Vec<u8>> {
    let position = u32::try_from(status.position).map_err(|_| {
        WatchError::ProtocolError(format!("Binlog position {} exceeds 4 bytes", status.position))
    })?;

    let mut buffer = Vec::with_capacity(11 + status.file.len());
    buffer.write_u8(COM_BINLOG_DUMP)?;
    buffer.write_u32::<LittleEndian>(position)?;
    buffer.write_u16::<LittleEndian>(0)?; // blocking
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(status.file.as_bytes())?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_binlog_dump_command() {
        let status = BinlogStatus {
            file: "mysql-bin.000001".to_string(),
            position: 4,
        };
        let cmd = create_binlog_dump_command(1001, &status).unwrap();

        assert_eq!(cmd[0], COM_BINLOG_DUMP);
        assert_eq!(&cmd[1..5], &4u32.to_le_bytes());
        assert_eq!(&cmd[7..11], &1001u32.to_le_bytes());
        assert_eq!(&cmd[11..], b"mysql-bin.000001");
    }

    #[test]
    fn test_dump_command_rejects_large_position() {
        let status = BinlogStatus {
            file: "mysql-bin.000001".to_string(),
            position: u64::from(u32::MAX) + 1,
        };
        assert!(matches!(
            create_binlog_dump_command(1, &status),
            Err(WatchError::ProtocolError(_))
        ));
    }

    fn event(event_type: u8, body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        data.push(event_type);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&((19 + body.len()) as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(body);
        data
    }

    /// shop.orders (id INT)
    fn table_map(table_id: u8) -> Vec<u8> {
        let mut body = vec![table_id, 0, 0, 0, 0, 0, 1, 0];
        body.push(4);
        body.extend_from_slice(b"shop\0");
        body.push(6);
        body.extend_from_slice(b"orders\0");
        body.extend_from_slice(&[1, 3, 0, 0]);
        event(19, &body)
    }

    /// v2 행 이벤트, INT 값 `ids.len()`개
    fn rows(event_type: u8, table_id: u8, ids: &[i32]) -> Vec<u8> {
        let mut body = vec![table_id, 0, 0, 0, 0, 0, 1, 0, 2, 0, 1, 0b1];
        for id in ids {
            body.push(0);
            body.extend_from_slice(&id.to_le_bytes());
        }
        event(event_type, &body)
    }

    #[test]
    fn test_subscribed_event_filters_categories() {
        let filter = SubscriptionFilter::parse("tablemap,writerows").unwrap();
        let mut decoder = BinlogDecoder::new();

        let announced = subscribed_event(&mut decoder, &filter, &table_map(7)).unwrap();
        assert_eq!(announced.table_id, 7);

        let inserted = subscribed_event(&mut decoder, &filter, &rows(30, 7, &[1, 2])).unwrap();
        assert_eq!(inserted.type_name, "WriteRows");
        assert_eq!(inserted.row_count(), 2);

        assert!(subscribed_event(&mut decoder, &filter, &rows(32, 7, &[1])).is_none());
        assert!(subscribed_event(&mut decoder, &filter, &event(4, &[0; 8])).is_none());
        assert!(subscribed_event(&mut decoder, &filter, &[0; 5]).is_none());
    }

    #[test]
    fn test_unsubscribed_table_map_still_learned() {
        let filter = SubscriptionFilter::parse("deleterows").unwrap();
        let mut decoder = BinlogDecoder::new();

        assert!(subscribed_event(&mut decoder, &filter, &table_map(9)).is_none());
        assert!(decoder.layout(9).is_some());

        let deleted = subscribed_event(&mut decoder, &filter, &rows(32, 9, &[4, 5, 6])).unwrap();
        assert_eq!(deleted.type_name, "DeleteRows");
        assert_eq!(deleted.row_count(), 3);
    }

    #[tokio::test]
    async fn test_start_unreachable_server() {
        let config = ConnectionConfig::new("127.0.0.1", "root")
            .with_port(1)
            .with_server_id(1001);
        let mut source = BinlogSource::new(config);

        let err = source.start(&SubscriptionFilter::all()).await.unwrap_err();
        assert!(matches!(err, WatchError::SourceUnavailable(_)));
        assert!(source.stop().await.is_ok());
    }
}
