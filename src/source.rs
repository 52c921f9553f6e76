//! 업스트림 이벤트 소스 트레이트

use crate::error::Result;
use crate::events::{RawEvent, SubscriptionFilter};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 컨트롤러가 한 번에 하나 이상 미리 버퍼링하지 않도록 채널 용량은 1
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// 원시 이벤트 스트림을 제공하는 소스
///
/// 구현체는 `start`가 반환되기 전에 핸드셰이크를 마쳐야 하며, 실패 시
/// `SourceUnavailable`을 반환합니다. 구독하지 않은 범주는 전달하지 않습니다.
/// 연결이 끊기면 채널을 닫고, 원인은 `stop`에서 반환합니다.
#[async_trait]
pub trait EventSource: Send {
    async fn start(&mut self, filter: &SubscriptionFilter) -> Result<mpsc::Receiver<RawEvent>>;

    async fn stop(&mut self) -> Result<()>;
}
