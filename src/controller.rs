//! 스트림 컨트롤러 - 이벤트 소스 수명 주기와 처리 파이프라인
//!
//! 상태 전이: IDLE → STARTING → RUNNING → STOPPING → STOPPED
//!
//! 이벤트는 도착 순서대로 하나씩 처리됩니다. 현재 이벤트의 핸들러가 끝나기
//! 전에는 다음 이벤트를 소스에서 꺼내지 않으므로, 테이블 맵 이벤트가 항상
//! 그 뒤의 행 이벤트보다 먼저 캐시에 반영됩니다.

use crate::builder::RecordBuilder;
use crate::classifier::{Classification, Classifier};
use crate::error::{Result, WatchError};
use crate::events::{EventCategory, Operation, RawEvent, RawEventBody, SubscriptionFilter};
use crate::handler::HandlerTable;
use crate::source::EventSource;
use crate::table_map::TableMetadataCache;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 컨트롤러 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// 다른 태스크에서 컨트롤러 상태를 조회하기 위한 핸들
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<RwLock<ControllerState>>);

impl StateHandle {
    pub fn get(&self) -> ControllerState {
        *self.0.read()
    }
}

/// 세션 처리 통계
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub events_received: u64,
    pub table_maps: u64,
    pub records_handled: u64,
    pub discarded: u64,
    pub unresolved: u64,
    pub delivery_failures: u64,
}

enum StopReason {
    Requested,
    SourceClosed,
}

pub struct StreamController<S> {
    session_id: Uuid,
    source: S,
    classifier: Classifier,
    cache: TableMetadataCache,
    handlers: HandlerTable,
    state: Arc<RwLock<ControllerState>>,
    stats: SessionStats,
}

impl<S: EventSource> StreamController<S> {
    pub fn new(source: S, handlers: HandlerTable) -> Self {
        StreamController {
            session_id: Uuid::new_v4(),
            source,
            classifier: Classifier::default(),
            cache: TableMetadataCache::new(),
            handlers,
            state: Arc::new(RwLock::new(ControllerState::Idle)),
            stats: SessionStats::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> ControllerState {
        *self.state.read()
    }

    pub fn state_handle(&self) -> StateHandle {
        StateHandle(self.state.clone())
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// 분류기가 만들 수 있지만 핸들러가 없는 연산
    pub fn unhandled_operations(&self) -> Vec<Operation> {
        self.classifier
            .operations()
            .into_iter()
            .filter(|op| !self.handlers.contains(*op))
            .collect()
    }

    /// 세션 실행
    ///
    /// `shutdown`이 취소되거나 소스 채널이 닫힐 때까지 이벤트를 처리합니다.
    /// 취소는 다음 이벤트를 기다리는 지점에서만 확인되므로 처리 중인 이벤트는
    /// 항상 끝까지 진행됩니다. 한 컨트롤러는 한 번만 실행할 수 있습니다.
    pub async fn run(
        &mut self,
        filter: SubscriptionFilter,
        shutdown: CancellationToken,
    ) -> Result<SessionStats> {
        let span = info_span!("session", id = %self.session_id);
        self.run_session(filter, shutdown).instrument(span).await
    }

    async fn run_session(
        &mut self,
        filter: SubscriptionFilter,
        shutdown: CancellationToken,
    ) -> Result<SessionStats> {
        let current = self.state();
        if current != ControllerState::Idle {
            return Err(WatchError::InvalidState(format!(
                "세션은 IDLE 상태에서만 시작할 수 있습니다 (현재: {:?})",
                current
            )));
        }

        self.set_state(ControllerState::Starting);
        info!("Starting session with subscription {}", filter);
        if !filter.includes(EventCategory::TableMap) {
            warn!("Subscription excludes table map events; row events cannot be resolved");
        }
        for operation in self.unhandled_operations() {
            warn!("No handler registered for {}; those records will fail delivery", operation);
        }

        let mut events = match self.source.start(&filter).await {
            Ok(rx) => rx,
            Err(e) => {
                self.set_state(ControllerState::Stopped);
                let err = match e {
                    WatchError::SourceUnavailable(_) => e,
                    other => WatchError::SourceUnavailable(other.to_string()),
                };
                error!("Failed to start event source: {}", err);
                return Err(err);
            }
        };

        self.set_state(ControllerState::Running);
        info!("Session running");

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break StopReason::Requested,
                event = events.recv() => event,
            };

            match next {
                Some(event) => self.process(event).await,
                None => break StopReason::SourceClosed,
            }
        };

        self.set_state(ControllerState::Stopping);
        match reason {
            StopReason::Requested => info!("Shutdown requested"),
            StopReason::SourceClosed => info!("Event stream closed by source"),
        }

        // 소스가 채널 전송에서 대기 중이면 수신자를 먼저 놓아야 종료됨
        drop(events);
        let stopped = self.source.stop().await;
        self.set_state(ControllerState::Stopped);

        info!(
            "Session stopped: {} events, {} records handled, {} unresolved, {} delivery failures",
            self.stats.events_received,
            self.stats.records_handled,
            self.stats.unresolved,
            self.stats.delivery_failures
        );

        match (reason, stopped) {
            (_, Ok(())) => Ok(self.stats.clone()),
            (StopReason::Requested, Err(e)) => {
                warn!("Event source reported an error while stopping: {}", e);
                Ok(self.stats.clone())
            }
            (StopReason::SourceClosed, Err(e)) => {
                let err = match e {
                    WatchError::SourceUnavailable(_) => e,
                    other => WatchError::SourceUnavailable(other.to_string()),
                };
                error!("Event source failed: {}", err);
                Err(err)
            }
        }
    }

    async fn process(&mut self, event: RawEvent) {
        self.stats.events_received += 1;

        if let RawEventBody::TableMap(name) = &event.body {
            self.cache.observe(event.table_id, &name.schema, &name.table);
            self.stats.table_maps += 1;
            return;
        }

        let operation = match self.classifier.classify(&event.type_name) {
            Classification::Operation(op) => op,
            Classification::Unknown => {
                warn!(
                    "Discarding event with unhandled type {:?} (timestamp {})",
                    event.type_name, event.timestamp
                );
                self.stats.discarded += 1;
                return;
            }
        };

        let record = match RecordBuilder::build(&event, operation, &self.cache) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Dropping {} event (timestamp {}): {}",
                    event.type_name, event.timestamp, e
                );
                self.stats.unresolved += 1;
                return;
            }
        };

        debug!(
            "{} on {}: {}",
            operation,
            record.qualified_table(),
            record.summary
        );

        match self.handlers.dispatch(record).await {
            Ok(()) => self.stats.records_handled += 1,
            Err(e) => {
                error!("Failed to handle {} record: {}", operation, e);
                self.stats.delivery_failures += 1;
            }
        }
    }

    fn set_state(&self, next: ControllerState) {
        let mut state = self.state.write();
        debug!("State {:?} -> {:?}", *state, next);
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{tags, ChangeRecord};
    use crate::handler::InsertHandler;
    use crate::sink::ChangeSink;
    use crate::source::EVENT_CHANNEL_CAPACITY;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::{mpsc, Notify};
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct SourceLog {
        started_with: Option<SubscriptionFilter>,
        stopped: bool,
    }

    /// 정해진 이벤트를 순서대로 보내는 소스
    #[derive(Default)]
    struct ScriptedSource {
        events: Vec<RawEvent>,
        hold_open: bool,
        fail_start: bool,
        stop_error: Option<String>,
        stop: CancellationToken,
        task: Option<JoinHandle<()>>,
        log: Arc<Mutex<SourceLog>>,
    }

    impl ScriptedSource {
        fn new(events: Vec<RawEvent>) -> Self {
            ScriptedSource {
                events,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn start(&mut self, filter: &SubscriptionFilter) -> Result<mpsc::Receiver<RawEvent>> {
            if self.fail_start {
                return Err(WatchError::SourceUnavailable("connection refused".to_string()));
            }
            self.log.lock().started_with = Some(filter.clone());

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let events = std::mem::take(&mut self.events);
            let hold_open = self.hold_open;
            let stop = self.stop.clone();

            self.task = Some(tokio::spawn(async move {
                for event in events {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                if hold_open {
                    stop.cancelled().await;
                }
            }));

            Ok(rx)
        }

        async fn stop(&mut self) -> Result<()> {
            self.stop.cancel();
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
            self.log.lock().stopped = true;
            match &self.stop_error {
                Some(message) => Err(WatchError::SourceUnavailable(message.clone())),
                None => Ok(()),
            }
        }
    }

    #[derive(Default, Clone)]
    struct RecordingSink {
        records: Arc<Mutex<Vec<ChangeRecord>>>,
    }

    #[async_trait]
    impl ChangeSink for RecordingSink {
        async fn deliver(&self, record: ChangeRecord) -> Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }

    /// 해제될 때까지 전달을 붙잡아 두는 싱크
    struct GatedSink {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        records: Arc<Mutex<Vec<ChangeRecord>>>,
    }

    #[async_trait]
    impl ChangeSink for GatedSink {
        async fn deliver(&self, record: ChangeRecord) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            self.records.lock().push(record);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ChangeSink for FailingSink {
        async fn deliver(&self, _record: ChangeRecord) -> Result<()> {
            Err(WatchError::ChannelClosed)
        }
    }

    fn controller_with(
        events: Vec<RawEvent>,
    ) -> (StreamController<ScriptedSource>, RecordingSink) {
        let sink = RecordingSink::default();
        let handlers = HandlerTable::with_sink(Arc::new(sink.clone()));
        (StreamController::new(ScriptedSource::new(events), handlers), sink)
    }

    #[tokio::test]
    async fn test_table_map_then_delete() {
        let (mut controller, sink) = controller_with(vec![
            RawEvent::table_map(100, 7, "orders", "line_items"),
            RawEvent::rows(tags::DELETE_ROWS, 101, 7, 3),
        ]);

        let stats = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].schema_name, "orders");
        assert_eq!(records[0].table_name, "line_items");
        assert_eq!(records[0].operation, Operation::Delete);
        assert_eq!(records[0].affected_row_count, 3);
        assert_eq!(records[0].timestamp, 101);
        assert_eq!(stats.table_maps, 1);
        assert_eq!(stats.records_handled, 1);
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_table_id_reassignment() {
        let (mut controller, sink) = controller_with(vec![
            RawEvent::table_map(1, 7, "a", "t1"),
            RawEvent::rows(tags::WRITE_ROWS, 2, 7, 1),
            RawEvent::table_map(3, 7, "b", "t2"),
            RawEvent::rows(tags::WRITE_ROWS, 4, 7, 2),
        ]);

        controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        let tables: Vec<String> = sink
            .records
            .lock()
            .iter()
            .map(|r| r.qualified_table())
            .collect();
        assert_eq!(tables, vec!["a.t1", "b.t2"]);
    }

    #[tokio::test]
    async fn test_unresolved_event_dropped_and_processing_continues() {
        let (mut controller, sink) = controller_with(vec![
            RawEvent::rows(tags::WRITE_ROWS, 1, 9, 1),
            RawEvent::table_map(2, 9, "shop", "videos"),
            RawEvent::rows(tags::WRITE_ROWS, 3, 9, 5),
        ]);

        let stats = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 3);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.events_received, 3);
    }

    #[tokio::test]
    async fn test_unknown_and_update_events_not_delivered() {
        let (mut controller, sink) = controller_with(vec![
            RawEvent::table_map(1, 7, "a", "t1"),
            RawEvent::other("Query", 2),
            RawEvent::rows("PartialUpdateRows", 3, 7, 1),
            RawEvent::rows(tags::UPDATE_ROWS, 4, 7, 1),
        ]);

        let stats = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        assert!(sink.records.lock().is_empty());
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.records_handled, 1);
    }

    #[tokio::test]
    async fn test_registered_tag_reaches_handler() {
        let (controller, sink) = controller_with(vec![
            RawEvent::table_map(1, 7, "a", "t1"),
            RawEvent::rows("WriteRowsV1", 2, 7, 1),
        ]);
        let mut classifier = Classifier::new();
        classifier.register("WriteRowsV1", Operation::Insert);
        let mut controller = controller.with_classifier(classifier);

        controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.records.lock()[0].operation, Operation::Insert);
    }

    #[tokio::test]
    async fn test_missing_handler_reported_and_session_continues() {
        let sink = RecordingSink::default();
        let mut handlers = HandlerTable::new();
        handlers.register(InsertHandler::new(Arc::new(sink.clone())));
        let mut controller = StreamController::new(
            ScriptedSource::new(vec![
                RawEvent::table_map(1, 7, "a", "t1"),
                RawEvent::rows(tags::DELETE_ROWS, 2, 7, 1),
                RawEvent::rows(tags::WRITE_ROWS, 3, 7, 1),
            ]),
            handlers,
        );
        assert_eq!(
            controller.unhandled_operations(),
            vec![Operation::Update, Operation::Delete]
        );

        let stats = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.delivery_failures, 1);
        assert_eq!(stats.records_handled, 1);
        assert_eq!(sink.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_stop_session() {
        let handlers = HandlerTable::with_sink(Arc::new(FailingSink));
        let mut controller = StreamController::new(
            ScriptedSource::new(vec![
                RawEvent::table_map(1, 7, "a", "t1"),
                RawEvent::rows(tags::WRITE_ROWS, 2, 7, 1),
                RawEvent::rows(tags::DELETE_ROWS, 3, 7, 1),
            ]),
            handlers,
        );

        let stats = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.delivery_failures, 2);
        assert_eq!(stats.events_received, 3);
    }

    #[tokio::test]
    async fn test_source_unavailable_on_start() {
        let (mut controller, _sink) = controller_with(Vec::new());
        controller.source.fail_start = true;

        let err = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WatchError::SourceUnavailable(_)));
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_source_failure_while_running() {
        let (mut controller, _sink) = controller_with(vec![RawEvent::table_map(1, 7, "a", "t1")]);
        controller.source.stop_error = Some("connection reset by peer".to_string());

        let err = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(controller.stats().table_maps, 1);
    }

    #[tokio::test]
    async fn test_no_restart_after_stop() {
        let (mut controller, _sink) = controller_with(Vec::new());
        controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap();

        let err = controller
            .run(SubscriptionFilter::all(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_filter_passed_to_source() {
        let (mut controller, _sink) = controller_with(Vec::new());
        let log = controller.source.log.clone();
        let filter = SubscriptionFilter::new([EventCategory::TableMap, EventCategory::WriteRows]);

        controller
            .run(filter.clone(), CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock();
        assert_eq!(log.started_with.as_ref(), Some(&filter));
        assert!(log.stopped);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_event() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = GatedSink {
            entered: entered.clone(),
            release: release.clone(),
            records: records.clone(),
        };

        let mut source = ScriptedSource::new(vec![
            RawEvent::table_map(1, 7, "a", "t1"),
            RawEvent::rows(tags::WRITE_ROWS, 2, 7, 1),
            RawEvent::rows(tags::WRITE_ROWS, 3, 7, 1),
            RawEvent::rows(tags::DELETE_ROWS, 4, 7, 1),
        ]);
        source.hold_open = true;

        let mut controller =
            StreamController::new(source, HandlerTable::with_sink(Arc::new(sink)));
        let state = controller.state_handle();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let session = tokio::spawn(async move {
            let result = controller.run(SubscriptionFilter::all(), token).await;
            (controller, result)
        });

        entered.notified().await;
        shutdown.cancel();
        assert_eq!(state.get(), ControllerState::Running);
        release.notify_one();

        let (controller, result) = session.await.unwrap();
        let stats = result.unwrap();

        assert_eq!(records.lock().len(), 1);
        assert_eq!(records.lock()[0].timestamp, 2);
        assert_eq!(stats.records_handled, 1);
        assert_eq!(stats.events_received, 2);
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(controller.source.log.lock().stopped);
    }
}
