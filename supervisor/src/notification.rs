// notification.rs - ユーザースクリプトによる簡易通知

use std::path::{Path, PathBuf};

use botvisor_shared::logging::LogCategory;
use botvisor_shared::log_debug;
use tokio::process::Command;

/// 通知イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Error,
    Stopped,
    Stale,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationManager {
    script_path: Option<PathBuf>,
}

impl NotificationManager {
    /// 設定されたスクリプト、なければ ~/.botvisor/notify.sh を使う
    pub fn new(configured: Option<PathBuf>) -> Self {
        let script_path = configured
            .map(expand_home)
            .filter(|p| p.is_file())
            .or_else(Self::find_default_script);
        Self { script_path }
    }

    /// 通知しない
    pub fn disabled() -> Self {
        Self { script_path: None }
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    fn find_default_script() -> Option<PathBuf> {
        let script = home::home_dir()?.join(".botvisor").join("notify.sh");
        script.is_file().then_some(script)
    }

    /// `sh <script> <event> <processKey> <message>` を投げっぱなしで実行
    pub fn notify(&self, event: NotifyEvent, process_key: &str, message: &str) {
        let Some(script_path) = self.script_path.clone() else {
            return;
        };
        let process_key = process_key.to_string();
        let message = message.to_string();

        tokio::spawn(async move {
            let result = Command::new("sh")
                .arg(&script_path)
                .arg(event.as_str())
                .arg(&process_key)
                .arg(&message)
                .output()
                .await;

            // 失敗しても supervisor には影響させない
            if let Err(e) = result {
                log_debug!(LogCategory::Notification, "Notification script failed: {e}");
            }
        });
    }
}

fn expand_home(path: PathBuf) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or(path),
        Err(_) => path,
    }
}
