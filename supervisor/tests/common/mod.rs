// 統合テスト用の共通環境
// 各統合テストは個別にコンパイルされるため、使われない関数の警告を抑制。

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use botvisor_shared::{BotConfig, BotMode, ParserKind, ProcessRecord};
use botvisor_supervisor::child::ChildLauncher;
use botvisor_supervisor::notification::NotificationManager;
use botvisor_supervisor::watchdog::WatchdogOptions;
use botvisor_supervisor::{Registry, StateStore, Supervisor, SupervisorOptions};
use tempfile::TempDir;

/// 待機の上限
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// 一時ディレクトリ上の supervisor 実行環境
///
/// ボットは `sh <dir>/bots/<key>.sh <dir>/<key>.json` として起動される。
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        std::fs::create_dir_all(dir.path().join("bots")).expect("create bots dir");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn registry_path(&self) -> PathBuf {
        self.path().join("bot-processes.json")
    }

    pub fn config_path(&self, process_key: &str) -> PathBuf {
        self.path().join(format!("{process_key}.json"))
    }

    /// ボットスクリプトを配置
    pub fn write_bot_script(&self, process_key: &str, body: &str) {
        let path = self.path().join("bots").join(format!("{process_key}.sh"));
        std::fs::write(path, body).expect("write bot script");
    }

    pub fn options(&self) -> SupervisorOptions {
        SupervisorOptions {
            registry_path: self.registry_path(),
            launcher: ChildLauncher::new("sh", self.path().join("bots"), "sh", self.path()),
            benign_stderr_patterns: vec!["DeprecationWarning".to_string()],
            parser: ParserKind::Labels,
            watchdog: None,
            notifications: NotificationManager::disabled(),
        }
    }

    /// 短い間隔の watchdog と通知スクリプト付き
    pub fn options_with_notifications(&self, watchdog: Option<WatchdogOptions>) -> SupervisorOptions {
        let script = self.path().join("notify.sh");
        std::fs::write(
            &script,
            format!("echo \"$1 $2\" >> {}\n", self.notify_log().display()),
        )
        .expect("write notify script");

        SupervisorOptions {
            watchdog,
            notifications: NotificationManager::new(Some(script)),
            ..self.options()
        }
    }

    pub fn notify_log(&self) -> PathBuf {
        self.path().join("notify.log")
    }

    pub async fn supervisor(&self) -> Supervisor {
        Supervisor::start(self.options())
            .await
            .expect("start supervisor")
    }

    /// ディスク上のレジストリ
    pub async fn read_registry(&self) -> Registry {
        StateStore::new(self.registry_path()).read().await
    }
}

pub fn bot_config(process_key: &str) -> BotConfig {
    BotConfig::new(process_key, "BTC/USDT", BotMode::Watcher)
}

/// 条件が真になるまでポーリング
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// レコードが条件を満たすまで待って返す
pub async fn wait_for_record<F>(supervisor: &Supervisor, process_key: &str, predicate: F) -> ProcessRecord
where
    F: Fn(&ProcessRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let record = supervisor
            .get_process_by_key(process_key)
            .await
            .expect("record exists");
        if predicate(&record) {
            return record;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {process_key}: {record:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// 通知ログに行が現れるまで待つ
pub async fn wait_for_notification(env: &TestEnv, expected: &str) -> bool {
    let log = env.notify_log();
    wait_until(|| {
        let log = log.clone();
        async move {
            std::fs::read_to_string(&log)
                .map(|text| text.lines().any(|line| line == expected))
                .unwrap_or(false)
        }
    })
    .await
}
