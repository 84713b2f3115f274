// child.rs - ボットスクリプトの子プロセス起動と終了

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use botvisor_shared::log_child;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// 終了後、出力の読み残しを待つ上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 子プロセスから supervisor へ届くイベント
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// 標準出力の1行
    Output {
        process_key: String,
        run_id: String,
        line: String,
    },
    /// 標準エラーの1行
    Diagnostic {
        process_key: String,
        run_id: String,
        line: String,
    },
    /// プロセス終了
    Exited {
        process_key: String,
        run_id: String,
        code: Option<i32>,
    },
}

impl ChildEvent {
    pub fn process_key(&self) -> &str {
        match self {
            Self::Output { process_key, .. }
            | Self::Diagnostic { process_key, .. }
            | Self::Exited { process_key, .. } => process_key,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Output { run_id, .. }
            | Self::Diagnostic { run_id, .. }
            | Self::Exited { run_id, .. } => run_id,
        }
    }
}

/// 子プロセスの起動方法
#[derive(Debug, Clone)]
pub struct ChildLauncher {
    interpreter: String,
    bots_dir: PathBuf,
    script_extension: String,
    work_dir: PathBuf,
}

impl ChildLauncher {
    pub fn new(
        interpreter: impl Into<String>,
        bots_dir: impl Into<PathBuf>,
        script_extension: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            bots_dir: bots_dir.into(),
            script_extension: script_extension.into(),
            work_dir: work_dir.into(),
        }
    }

    /// 生成済みスクリプトのパス
    pub fn script_path(&self, process_key: &str) -> PathBuf {
        self.bots_dir
            .join(format!("{process_key}.{}", self.script_extension))
    }

    /// `<interpreter> <script> <config>` で起動し、出力と終了をイベントとして流す
    ///
    /// 戻り値は OS のプロセスID。
    pub fn spawn(
        &self,
        process_key: &str,
        run_id: &str,
        config_path: &Path,
        events: mpsc::Sender<ChildEvent>,
    ) -> std::io::Result<u32> {
        let script_path = self.script_path(process_key);
        if !script_path.exists() {
            log_child!(
                warn,
                "[Bot {process_key}] Script not found at {}; the interpreter will report it",
                script_path.display()
            );
        }

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&script_path)
            .arg(config_path)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before reporting a pid",
            )
        })?;

        log_child!(
            info,
            "[Bot {process_key}] Spawned {} {} (pid {pid})",
            self.interpreter,
            script_path.display()
        );

        let stdout_task = child.stdout.take().map(|stdout| {
            let key = process_key.to_string();
            let run = run_id.to_string();
            let tx = events.clone();
            tokio::spawn(forward_lines(stdout, move |line| ChildEvent::Output {
                process_key: key.clone(),
                run_id: run.clone(),
                line,
            }, tx))
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let key = process_key.to_string();
            let run = run_id.to_string();
            let tx = events.clone();
            tokio::spawn(forward_lines(stderr, move |line| ChildEvent::Diagnostic {
                process_key: key.clone(),
                run_id: run.clone(),
                line,
            }, tx))
        });

        let process_key = process_key.to_string();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    log_child!(warn, "[Bot {process_key}] Failed to wait for exit: {e}");
                    None
                }
            };

            // 終了イベントより先に出力を流し切る
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                    log_child!(
                        debug,
                        "[Bot {process_key}] Output stream still open after exit; not waiting further"
                    );
                }
            }

            let _ = events
                .send(ChildEvent::Exited {
                    process_key,
                    run_id,
                    code,
                })
                .await;
        });

        Ok(pid)
    }
}

/// 1行ずつ読み、順序どおりにイベントとして送る
///
/// 不正な UTF-8 は置換文字に変換して読み続ける。パイプを閉じると子プロセスが
/// SIGPIPE で落ちるため、EOF と I/O エラー以外では読み取りをやめない。
async fn forward_lines<R, F>(stream: R, make_event: F, events: mpsc::Sender<ChildEvent>)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> ChildEvent,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if events.send(make_event(line.to_string())).await.is_err() {
                    break; // supervisor 終了
                }
            }
            Err(e) => {
                log_child!(debug, "Error reading child output: {e}");
                break;
            }
        }
    }
}

/// 強制終了の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Killed,
    AlreadyGone,
}

/// SIGKILL を送る。既に存在しないプロセスは終了済みとみなす
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<Termination, String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => Ok(Termination::Killed),
        Err(Errno::ESRCH) => Ok(Termination::AlreadyGone),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<Termination, String> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() {
        Ok(Termination::Killed)
    } else {
        Ok(Termination::AlreadyGone)
    }
}

/// プロセスが生きているか（シグナル0で確認）
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // 権限がないだけで存在はしている
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}
