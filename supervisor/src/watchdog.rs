// watchdog.rs - lastUpdated が止まったボットの検出

use std::collections::HashSet;
use std::time::Duration;

use botvisor_shared::WatchdogSettings;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::state_store::Registry;
use crate::supervisor::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogOptions {
    pub interval: Duration,
    pub stale_after: Duration,
}

impl WatchdogOptions {
    /// 無効化されていれば None
    pub fn from_settings(settings: &WatchdogSettings) -> Option<Self> {
        if !settings.enabled || settings.interval_secs == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(settings.interval_secs),
            stale_after: Duration::from_secs(settings.stale_after_secs),
        })
    }
}

/// 無応答と判定されたボット
#[derive(Debug, Clone, PartialEq)]
pub struct StaleProcess {
    pub process_key: String,
    pub silent_for: chrono::Duration,
}

/// 同じ起動を二度報告しないための記録
#[derive(Debug, Default)]
pub struct StaleTracker {
    reported: HashSet<String>,
}

impl StaleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新たに無応答になった running レコードを返す
    pub fn sweep(
        &mut self,
        registry: &Registry,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Vec<StaleProcess> {
        let threshold = chrono::Duration::from_std(stale_after)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut still_stale = HashSet::new();
        let mut newly_stale = Vec::new();

        for (key, record) in registry {
            if !record.is_running() {
                continue;
            }
            let silent_for = now.signed_duration_since(record.last_updated);
            if silent_for < threshold {
                continue;
            }

            let run_id = record.run_id.clone().unwrap_or_else(|| key.clone());
            if !self.reported.contains(&run_id) {
                newly_stale.push(StaleProcess {
                    process_key: key.clone(),
                    silent_for,
                });
            }
            still_stale.insert(run_id);
        }

        // 復帰した・消えた起動は忘れる
        self.reported = still_stale;
        newly_stale
    }
}

/// 一定間隔で Sweep を送るタスク
pub(crate) fn spawn_ticker(interval: Duration, commands: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // 初回は即時に返るので読み捨て
        loop {
            ticker.tick().await;
            if commands.send(Command::Sweep).await.is_err() {
                break;
            }
        }
    })
}
