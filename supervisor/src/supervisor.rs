// supervisor.rs - ボットプロセスの起動・停止・状態管理
//
// レジストリを変更するのはアクタータスク1つだけ。API 呼び出しも子プロセスの
// イベントもキュー経由で直列化し、変更のたびにファイルへ書き出す。

use std::collections::HashMap;
use std::path::PathBuf;

use botvisor_shared::logging::LogCategory;
use botvisor_shared::{
    log_child, log_info, log_supervisor, log_warn, BotConfig, Config, ParserKind, ProcessRecord,
    ProcessStatus,
};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::child::{self, ChildEvent, ChildLauncher, Termination};
use crate::error::{Result, SupervisorError};
use crate::notification::{NotificationManager, NotifyEvent};
use crate::output_parser::{create_output_parser, OutputParser};
use crate::state_store::{Registry, StateStore};
use crate::watchdog::{self, StaleTracker, WatchdogOptions};

const COMMAND_QUEUE_SIZE: usize = 64;
const EVENT_QUEUE_SIZE: usize = 1024;

/// supervisor の起動パラメータ
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub registry_path: PathBuf,
    pub launcher: ChildLauncher,
    /// この文字列を含む stderr 行はエラー扱いしない
    pub benign_stderr_patterns: Vec<String>,
    pub parser: ParserKind,
    pub watchdog: Option<WatchdogOptions>,
    pub notifications: NotificationManager,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        let runtime = &config.runtime;
        Self {
            registry_path: runtime.registry_path(),
            launcher: ChildLauncher::new(
                runtime.interpreter.clone(),
                runtime.resolved_bots_dir(),
                runtime.script_extension.clone(),
                runtime.work_dir.clone(),
            ),
            benign_stderr_patterns: runtime.benign_stderr_patterns.clone(),
            parser: runtime.parser,
            watchdog: WatchdogOptions::from_settings(&config.watchdog),
            notifications: NotificationManager::new(config.notification.script_path.clone()),
        }
    }
}

/// アクターへの要求
pub(crate) enum Command {
    Start {
        config: BotConfig,
        reply: oneshot::Sender<Result<ProcessRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<ProcessRecord>>,
    },
    Get {
        process_key: String,
        reply: oneshot::Sender<Result<ProcessRecord>>,
    },
    Stop {
        process_key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        process_key: String,
        reply: oneshot::Sender<Result<ProcessRecord>>,
    },
    Sweep,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// supervisor へのハンドル。複製して複数タスクから使える
#[derive(Debug, Clone)]
pub struct Supervisor {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start { .. } => "Start",
            Self::List { .. } => "List",
            Self::Get { .. } => "Get",
            Self::Stop { .. } => "Stop",
            Self::Restart { .. } => "Restart",
            Self::Sweep => "Sweep",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Supervisor {
    /// レジストリを読み込み、前回の状態を整合させてからアクターを起動
    pub async fn start(options: SupervisorOptions) -> Result<Self> {
        let store = StateStore::new(&options.registry_path);
        let mut registry = store.read().await;
        if reconcile(&mut registry) {
            store.write(&registry).await?;
        }
        log_supervisor!(
            info,
            "Loaded {} record(s) from {}",
            registry.len(),
            store.registry_path().display()
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        let ticker = options
            .watchdog
            .map(|w| watchdog::spawn_ticker(w.interval, command_tx.clone()));

        let actor = SupervisorActor {
            store,
            registry,
            live: HashMap::new(),
            launcher: options.launcher,
            parser: create_output_parser(options.parser),
            benign_stderr_patterns: options.benign_stderr_patterns,
            notifications: options.notifications,
            stale: StaleTracker::new(),
            stale_after: options.watchdog.map(|w| w.stale_after),
            events_tx: event_tx,
        };
        tokio::spawn(actor.run(command_rx, event_rx, ticker));

        Ok(Self {
            commands: command_tx,
        })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Unavailable)?;
        response.await.map_err(|_| SupervisorError::Unavailable)
    }

    /// 新しいボットを起動
    pub async fn start_process(&self, config: BotConfig) -> Result<ProcessRecord> {
        self.request(|reply| Command::Start { config, reply })
            .await?
    }

    /// 全レコード（processKey 順）
    pub async fn get_all_processes(&self) -> Result<Vec<ProcessRecord>> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn get_process_by_key(&self, process_key: &str) -> Result<ProcessRecord> {
        let process_key = process_key.to_string();
        self.request(|reply| Command::Get { process_key, reply })
            .await?
    }

    /// 強制終了してレコードと設定ファイルを削除
    pub async fn stop_process(&self, process_key: &str) -> Result<()> {
        let process_key = process_key.to_string();
        self.request(|reply| Command::Stop { process_key, reply })
            .await?
    }

    /// 保存済みの設定で停止→起動。パフォーマンスはリセットされる
    pub async fn restart_process(&self, process_key: &str) -> Result<ProcessRecord> {
        let process_key = process_key.to_string();
        self.request(|reply| Command::Restart { process_key, reply })
            .await?
    }

    /// アクターを止める。子プロセスはそのまま残る
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            log_supervisor!(debug, "Supervisor already stopped");
        }
    }
}

/// 前回終了時の running レコードを実プロセスと突き合わせる
///
/// 変更があれば true。
fn reconcile(registry: &mut Registry) -> bool {
    let mut changed = false;
    for (key, record) in registry.iter_mut() {
        match (record.status, record.pid) {
            (ProcessStatus::Running, Some(pid)) if child::is_alive(pid) => {
                log_supervisor!(
                    warn,
                    "[Bot {key}] pid {pid} from a previous run is still alive; output is no longer monitored"
                );
            }
            (ProcessStatus::Running, _) => {
                log_supervisor!(info, "[Bot {key}] Process is gone; marking as stopped");
                record.mark_exited(None);
                changed = true;
            }
            (_, Some(_)) => {
                record.pid = None;
                changed = true;
            }
            (_, None) => {}
        }
    }
    changed
}

/// 停止結果をまとめる
///
/// 書き込みに失敗した場合はそのエラーを返す。kill の失敗はログにだけ残る。
fn settle_stop(
    process_key: &str,
    failure: Option<SupervisorError>,
    flushed: Result<()>,
) -> Result<()> {
    if let Err(err) = flushed {
        if let Some(lost) = failure {
            log_supervisor!(
                error,
                "[Bot {process_key}] {lost}; the process may still be running but its record could not be saved"
            );
        }
        return Err(err);
    }

    log_supervisor!(info, "[Bot {process_key}] Stopped and removed");
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// エラー状態でも kill できるよう保持する、実行中の子プロセス
#[derive(Debug, Clone)]
struct LiveChild {
    run_id: String,
    pid: u32,
}

struct SupervisorActor {
    store: StateStore,
    registry: Registry,
    live: HashMap<String, LiveChild>,
    launcher: ChildLauncher,
    parser: Box<dyn OutputParser>,
    benign_stderr_patterns: Vec<String>,
    notifications: NotificationManager,
    stale: StaleTracker,
    stale_after: Option<std::time::Duration>,
    events_tx: mpsc::Sender<ChildEvent>,
}

impl SupervisorActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<ChildEvent>,
        ticker: Option<JoinHandle<()>>,
    ) {
        log_supervisor!(
            debug,
            "Supervisor started (parser: {})",
            self.parser.name()
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        log_supervisor!(info, "Supervisor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        // 呼び出し側が待つのをやめていても処理自体は完了させる
        match command {
            Command::Start { config, reply } => {
                let _ = reply.send(self.start_process(config).await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.values().cloned().collect());
            }
            Command::Get { process_key, reply } => {
                let result = self
                    .registry
                    .get(&process_key)
                    .cloned()
                    .ok_or(SupervisorError::NotFound(process_key));
                let _ = reply.send(result);
            }
            Command::Stop { process_key, reply } => {
                let _ = reply.send(self.stop_process(&process_key).await);
            }
            Command::Restart { process_key, reply } => {
                let _ = reply.send(self.restart_process(&process_key).await);
            }
            Command::Sweep => self.sweep_stale(),
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn start_process(&mut self, config: BotConfig) -> Result<ProcessRecord> {
        config.validate()?;
        let process_key = config.process_key.clone();
        if self.registry.contains_key(&process_key) {
            return Err(SupervisorError::DuplicateProcess(process_key));
        }

        let config_path = self.store.write_bot_config(&config).await?;
        let run_id = Uuid::new_v4().to_string();

        let pid = match self.launcher.spawn(
            &process_key,
            &run_id,
            &config_path,
            self.events_tx.clone(),
        ) {
            Ok(pid) => pid,
            Err(e) => {
                self.discard_bot_config(&process_key).await;
                log_supervisor!(error, "[Bot {process_key}] Failed to spawn: {e}");
                return Err(SupervisorError::SpawnFailure(e.to_string()));
            }
        };

        let record = ProcessRecord::running(config, pid, run_id.clone());
        self.registry.insert(process_key.clone(), record.clone());

        if let Err(e) = self.flush().await {
            // 記録できない子プロセスは残さない
            self.registry.remove(&process_key);
            if let Err(reason) = child::terminate(pid) {
                log_supervisor!(error, "[Bot {process_key}] Failed to kill pid {pid}: {reason}");
            }
            self.discard_bot_config(&process_key).await;
            return Err(e);
        }

        self.live
            .insert(process_key.clone(), LiveChild { run_id, pid });
        log_supervisor!(info, "[Bot {process_key}] Started (pid {pid})");
        Ok(record)
    }

    async fn stop_process(&mut self, process_key: &str) -> Result<()> {
        let record = self
            .registry
            .get(process_key)
            .ok_or_else(|| SupervisorError::NotFound(process_key.to_string()))?;

        let pid = self
            .live
            .remove(process_key)
            .map(|live| live.pid)
            .or(record.pid);

        let failure = match pid.map(|pid| (pid, child::terminate(pid))) {
            Some((pid, Ok(Termination::Killed))) => {
                log_supervisor!(info, "[Bot {process_key}] Killed pid {pid}");
                None
            }
            Some((pid, Ok(Termination::AlreadyGone))) => {
                log_supervisor!(debug, "[Bot {process_key}] pid {pid} had already exited");
                None
            }
            Some((pid, Err(reason))) => {
                log_supervisor!(error, "[Bot {process_key}] Failed to kill pid {pid}: {reason}");
                Some(SupervisorError::TerminationFailure { pid, reason })
            }
            None => None,
        };

        self.discard_bot_config(process_key).await;
        self.registry.remove(process_key);
        let flushed = self.flush().await;
        settle_stop(process_key, failure, flushed)
    }

    async fn restart_process(&mut self, process_key: &str) -> Result<ProcessRecord> {
        let config = self
            .registry
            .get(process_key)
            .map(|record| record.config.clone())
            .ok_or_else(|| SupervisorError::NotFound(process_key.to_string()))?;

        match self.stop_process(process_key).await {
            Ok(()) => {}
            Err(err @ SupervisorError::TerminationFailure { .. }) => {
                log_supervisor!(warn, "[Bot {process_key}] Restarting anyway: {err}");
            }
            Err(err) => return Err(err),
        }

        self.start_process(config).await
    }

    async fn handle_event(&mut self, event: ChildEvent) {
        let process_key = event.process_key().to_string();
        let owned = self
            .registry
            .get(&process_key)
            .is_some_and(|record| record.belongs_to(event.run_id()));
        if !owned {
            log_supervisor!(trace, "[Bot {process_key}] Ignoring event from a previous run");
            return;
        }

        match event {
            ChildEvent::Output { line, .. } => {
                log_child!(debug, "[Bot {process_key}] Output: {line}");
                let parsed = self.parser.parse_line(&line);
                if let Some(record) = self.registry.get_mut(&process_key) {
                    record.apply_output(parsed.state, parsed.performance);
                }
            }
            ChildEvent::Diagnostic { line, .. } => {
                if self.is_benign(&line) {
                    log_child!(debug, "[Bot {process_key}] Warning: {line}");
                    return;
                }
                log_child!(warn, "[Bot {process_key}] Error: {line}");
                let Some(record) = self.registry.get_mut(&process_key) else {
                    return;
                };
                let first_error = record.status != ProcessStatus::Error;
                record.mark_error(line.clone());
                if first_error {
                    self.notifications
                        .notify(NotifyEvent::Error, &process_key, &line);
                }
            }
            ChildEvent::Exited { run_id, code, .. } => {
                if self
                    .live
                    .get(&process_key)
                    .is_some_and(|live| live.run_id == run_id)
                {
                    self.live.remove(&process_key);
                }
                let Some(record) = self.registry.get_mut(&process_key) else {
                    return;
                };
                record.mark_exited(code);

                let message = match code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                };
                if code == Some(0) {
                    log_supervisor!(info, "[Bot {process_key}] Process {message}");
                } else {
                    log_supervisor!(warn, "[Bot {process_key}] Process {message}");
                }
                self.notifications
                    .notify(NotifyEvent::Stopped, &process_key, &message);
            }
        }

        if let Err(e) = self.flush().await {
            log_supervisor!(error, "[Bot {process_key}] Failed to persist update: {e}");
        }
    }

    fn is_benign(&self, line: &str) -> bool {
        self.benign_stderr_patterns
            .iter()
            .any(|pattern| line.contains(pattern.as_str()))
    }

    fn sweep_stale(&mut self) {
        let Some(stale_after) = self.stale_after else {
            return;
        };
        for stale in self.stale.sweep(&self.registry, Utc::now(), stale_after) {
            let message = format!("no output for {}s", stale.silent_for.num_seconds());
            log_warn!(
                LogCategory::Watchdog,
                "[Bot {}] Possibly hung: {message}",
                stale.process_key
            );
            self.notifications
                .notify(NotifyEvent::Stale, &stale.process_key, &message);
        }
    }

    async fn flush(&self) -> Result<()> {
        self.store.write(&self.registry).await?;
        Ok(())
    }

    /// 設定ファイルの削除。失敗してもログのみ
    async fn discard_bot_config(&self, process_key: &str) {
        if let Err(e) = self.store.remove_bot_config(process_key).await {
            log_info!(
                LogCategory::Registry,
                "[Bot {process_key}] Could not remove config file: {e}"
            );
        }
    }
}
