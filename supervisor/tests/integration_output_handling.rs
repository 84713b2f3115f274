// 子プロセス出力の解析・エラー判定・通知の統合テスト
#![cfg(unix)]

mod common;

use std::time::Duration;

use botvisor_shared::{ParserKind, ProcessStatus, TradeSide};
use botvisor_supervisor::watchdog::WatchdogOptions;
use botvisor_supervisor::{Supervisor, SupervisorError};
use common::{bot_config, wait_for_notification, wait_for_record, TestEnv};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_current_price_is_merged_into_state() {
    let env = TestEnv::new();
    env.write_bot_script("p1", "echo 'Current Price: 50000.5'\nexec sleep 30\n");
    let supervisor = env.supervisor().await;

    let started = assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let record = wait_for_record(&supervisor, "p1", |r| r.state.current_price.is_some()).await;

    assert_eq!(record.state.current_price, Some(50000.5));
    assert_eq!(record.status, ProcessStatus::Running);
    assert!(record.last_updated >= started.last_updated);
    // 他のフィールドは変わらない
    assert!(record.state.upper_breakout.is_none());
    assert_eq!(record.performance.total_trades, 0);

    // 永続化されている
    assert_eq!(
        env.read_registry().await["p1"].state.current_price,
        Some(50000.5)
    );

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_invalid_utf8_output_keeps_bot_alive() {
    let env = TestEnv::new();
    env.write_bot_script(
        "p1",
        "printf 'noise \\377\\n'\nsleep 0.3\necho 'Current Price: 123.5'\nexec sleep 30\n",
    );
    let supervisor = env.supervisor().await;

    let started = assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let record = wait_for_record(&supervisor, "p1", |r| r.state.current_price.is_some()).await;

    // 不正なバイトの後の行も読まれ、ボットは動き続ける
    assert_eq!(record.state.current_price, Some(123.5));
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.pid, started.pid);
    assert!(botvisor_supervisor::child::is_alive(started.pid.unwrap()));

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_state_updates_accumulate() {
    let env = TestEnv::new();
    env.write_bot_script(
        "p1",
        "echo 'Upper Breakout: 51000'\necho 'Trade State: BUY'\necho 'Total Trades: 2'\necho 'Current Price: 50500'\nexec sleep 30\n",
    );
    let supervisor = env.supervisor().await;

    assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let record = wait_for_record(&supervisor, "p1", |r| r.state.current_price.is_some()).await;

    // 行は順に処理されるので最後の行の時点で前の行も反映済み
    assert_eq!(record.state.upper_breakout, Some(51000.0));
    assert_eq!(record.state.trade_state, Some(TradeSide::Buy));
    assert_eq!(record.performance.total_trades, 2);

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_json_parser_option() {
    let env = TestEnv::new();
    env.write_bot_script(
        "p1",
        "echo '{\"state\":{\"currentPrice\":101.5},\"performance\":{\"maxProfit\":7.5}}'\nexec sleep 30\n",
    );
    let mut options = env.options();
    options.parser = ParserKind::Json;
    let supervisor = assert_ok!(Supervisor::start(options).await);

    assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let record = wait_for_record(&supervisor, "p1", |r| r.state.current_price.is_some()).await;
    assert_eq!(record.state.current_price, Some(101.5));
    assert_eq!(record.performance.max_profit, 7.5);

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_benign_stderr_keeps_running() {
    let env = TestEnv::new();
    env.write_bot_script(
        "p1",
        "echo '(node:123) DeprecationWarning: Buffer() is deprecated' >&2\nsleep 0.3\necho 'Current Price: 1'\nexec sleep 30\n",
    );
    let supervisor = env.supervisor().await;

    assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let record = wait_for_record(&supervisor, "p1", |r| r.state.current_price.is_some()).await;
    assert_eq!(record.status, ProcessStatus::Running);
    assert!(record.error.is_empty());
    assert!(record.pid.is_some());

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_stderr_marks_error_and_stop_still_kills() {
    let env = TestEnv::new();
    env.write_bot_script(
        "p1",
        "echo 'Strategy execution error: timeout' >&2\nexec sleep 30\n",
    );
    let supervisor = env.supervisor().await;

    let started = assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let pid = started.pid.unwrap();

    let record = wait_for_record(&supervisor, "p1", |r| r.status == ProcessStatus::Error).await;
    assert_eq!(record.error, "Strategy execution error: timeout");
    assert!(record.pid.is_none());

    // pid はレコードから消えても stop で止められる
    assert_ok!(supervisor.stop_process("p1").await);
    assert!(common::wait_until(|| async move { !botvisor_supervisor::child::is_alive(pid) }).await);
}

#[tokio::test]
async fn test_error_status_survives_exit() {
    let env = TestEnv::new();
    env.write_bot_script("p1", "echo 'fatal: bad config' >&2\nexit 1\n");
    let supervisor = env.supervisor().await;

    assert_ok!(supervisor.start_process(bot_config("p1")).await);
    let record = wait_for_record(&supervisor, "p1", |r| r.exit_code.is_some()).await;
    assert_eq!(record.status, ProcessStatus::Error);
    assert_eq!(record.exit_code, Some(1));
    assert_eq!(record.error, "fatal: bad config");

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_error_and_exit_notifications() {
    let env = TestEnv::new();
    env.write_bot_script("p1", "echo 'boom' >&2\nsleep 0.2\nexit 2\n");
    let supervisor = assert_ok!(Supervisor::start(env.options_with_notifications(None)).await);

    assert_ok!(supervisor.start_process(bot_config("p1")).await);
    assert!(wait_for_notification(&env, "error p1").await);
    assert!(wait_for_notification(&env, "stopped p1").await);

    assert_ok!(supervisor.stop_process("p1").await);
}

#[tokio::test]
async fn test_watchdog_reports_silent_bot_once() {
    let env = TestEnv::new();
    env.write_bot_script("quiet", "exec sleep 30\n");
    let watchdog = WatchdogOptions {
        interval: Duration::from_millis(100),
        stale_after: Duration::from_millis(200),
    };
    let supervisor =
        assert_ok!(Supervisor::start(env.options_with_notifications(Some(watchdog))).await);

    assert_ok!(supervisor.start_process(bot_config("quiet")).await);
    assert!(wait_for_notification(&env, "stale quiet").await);

    // 報告は1回だけ、状態は変えない
    tokio::time::sleep(Duration::from_millis(500)).await;
    let log = std::fs::read_to_string(env.notify_log()).unwrap();
    assert_eq!(log.lines().filter(|l| *l == "stale quiet").count(), 1);
    let record = assert_ok!(supervisor.get_process_by_key("quiet").await);
    assert_eq!(record.status, ProcessStatus::Running);

    assert_ok!(supervisor.stop_process("quiet").await);
    let err = assert_err!(supervisor.get_process_by_key("quiet").await);
    assert!(matches!(err, SupervisorError::NotFound(_)));
}
