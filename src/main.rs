/// MySQL binlog 변경 감시 프로그램
///
/// 환경 변수(DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, WATCHDOG_EVENTS, WATCHDOG_SINK)로
/// 설정하고, Ctrl+C로 종료합니다.
use binlog_watchdog::{BinlogSource, HandlerTable, StreamController, WatchConfig};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = match WatchConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("start...");
    info!("Watching {} for {}", config.connection.address(), config.subscription);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Got SIGINT.");
            signal.cancel();
        }
    });

    let source = BinlogSource::new(config.connection.clone());
    let handlers = HandlerTable::with_sink(config.sink.build());
    let mut controller = StreamController::new(source, handlers);

    match controller.run(config.subscription, shutdown).await {
        Ok(stats) => {
            info!("Watcher stopped cleanly: {:?}", stats);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Watcher failed (fatal: {}): {}", e.is_fatal(), e);
            ExitCode::FAILURE
        }
    }
}
