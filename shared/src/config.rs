use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::logging::LogLevel;
use crate::transport::ConnectionConfig;

/// メインの設定構造体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 接続設定
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// ログ設定
    #[serde(default)]
    pub logging: LoggingSettings,

    /// ボット実行環境の設定
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// 無応答検知の設定
    #[serde(default)]
    pub watchdog: WatchdogSettings,

    /// 通知設定
    #[serde(default)]
    pub notification: NotificationSettings,
}

/// 接続関連の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// 接続タイプ ("unix" または "tcp")
    #[serde(default = "default_connection_type")]
    pub r#type: String,

    /// TCP接続時のバインドアドレス
    #[serde(default = "default_tcp_bind_addr")]
    pub tcp_bind_addr: String,

    /// Unix socket接続時のソケットパス
    pub unix_socket_path: Option<PathBuf>,
}

/// ログ関連の設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// 詳細ログを有効にするか（level より優先して debug にする）
    #[serde(default)]
    pub verbose: bool,

    /// ログレベル ("error" / "warn" / "info" / "debug" / "trace")
    pub level: Option<String>,

    /// ログファイルのパス（未指定なら stderr）
    pub log_file: Option<PathBuf>,
}

/// 出力パーサの種類
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// "Current Price: 123.4" 形式のラベル付きテキスト
    #[default]
    Labels,
    /// 1行1イベントの JSON
    Json,
}

/// ボット実行環境
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// レジストリと設定ファイルを置くディレクトリ
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// レジストリファイル名（work_dir からの相対）
    #[serde(default = "default_registry_file")]
    pub registry_file: String,

    /// 生成済みボットスクリプトのディレクトリ（work_dir からの相対も可）
    #[serde(default = "default_bots_dir")]
    pub bots_dir: PathBuf,

    /// スクリプトを実行するインタプリタ
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// スクリプトの拡張子
    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    /// エラー扱いしない stderr のパターン
    #[serde(default = "default_benign_stderr_patterns")]
    pub benign_stderr_patterns: Vec<String>,

    /// 出力パーサ
    #[serde(default)]
    pub parser: ParserKind,
}

/// 無応答検知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// チェック間隔（秒）
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,

    /// この秒数 lastUpdated が更新されなければ無応答とみなす
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

/// 通知関連の設定（未指定なら ~/.botvisor/notify.sh が存在する場合のみ動作）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub script_path: Option<PathBuf>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            r#type: default_connection_type(),
            tcp_bind_addr: default_tcp_bind_addr(),
            unix_socket_path: None,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            registry_file: default_registry_file(),
            bots_dir: default_bots_dir(),
            interpreter: default_interpreter(),
            script_extension: default_script_extension(),
            benign_stderr_patterns: default_benign_stderr_patterns(),
            parser: ParserKind::default(),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_watchdog_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

// デフォルト値関数
fn default_connection_type() -> String {
    "unix".to_string()
}

fn default_tcp_bind_addr() -> String {
    "127.0.0.1:3017".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_registry_file() -> String {
    "bot-processes.json".to_string()
}

fn default_bots_dir() -> PathBuf {
    PathBuf::from("src").join("public").join("bots")
}

fn default_interpreter() -> String {
    "node".to_string()
}

fn default_script_extension() -> String {
    "js".to_string()
}

fn default_benign_stderr_patterns() -> Vec<String> {
    vec!["DeprecationWarning".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    300
}

impl RuntimeSettings {
    /// レジストリファイルの絶対/相対パス
    pub fn registry_path(&self) -> PathBuf {
        self.work_dir.join(&self.registry_file)
    }

    /// スクリプトディレクトリ（相対なら work_dir 基準）
    pub fn resolved_bots_dir(&self) -> PathBuf {
        if self.bots_dir.is_absolute() {
            self.bots_dir.clone()
        } else {
            self.work_dir.join(&self.bots_dir)
        }
    }
}

impl LoggingSettings {
    /// 有効なログレベル
    pub fn effective_level(&self) -> LogLevel {
        if self.verbose {
            return LogLevel::Debug;
        }
        self.level
            .as_deref()
            .map(LogLevel::from)
            .unwrap_or(LogLevel::Info)
    }
}

impl Config {
    /// 設定ファイルから読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// 設定ファイルに保存
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// 設定ファイルパスの候補を取得（優先順位順）
    pub fn config_path_candidates() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. カレントディレクトリの .botvisor/config.toml
        if let Ok(current_dir) = std::env::current_dir() {
            paths.push(current_dir.join(".botvisor").join("config.toml"));
        }

        // 2. ホームディレクトリの .botvisor/config.toml
        if let Some(home_dir) = home::home_dir() {
            paths.push(home_dir.join(".botvisor").join("config.toml"));
        }

        // 3. XDG規格に従った設定ディレクトリ
        if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(
                PathBuf::from(xdg_config_home)
                    .join("botvisor")
                    .join("config.toml"),
            );
        } else if let Some(home_dir) = home::home_dir() {
            paths.push(home_dir.join(".config").join("botvisor").join("config.toml"));
        }

        paths
    }

    /// 設定ファイルを自動検出して読み込み
    pub fn load_auto() -> Result<Option<(Self, PathBuf)>> {
        for path in Self::config_path_candidates() {
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }
        Ok(None)
    }

    /// 明示パス → 自動検出 → デフォルトの順に読み込み、環境変数を適用
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => Self::load_auto()?.map(|(c, _)| c).unwrap_or_default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// 環境変数で設定を上書き
    pub fn apply_env_overrides(&mut self) {
        if let Ok(tcp_addr) = std::env::var("BOTVISOR_TCP_ADDR") {
            self.connection.r#type = "tcp".to_string();
            self.connection.tcp_bind_addr = tcp_addr;
        }

        if let Ok(socket_path) = std::env::var("BOTVISOR_SOCKET_PATH") {
            self.connection.r#type = "unix".to_string();
            self.connection.unix_socket_path = Some(PathBuf::from(socket_path));
        }

        if let Ok(verbose) = std::env::var("BOTVISOR_VERBOSE") {
            self.logging.verbose = verbose == "1" || verbose.to_lowercase() == "true";
        }

        if let Ok(level) = std::env::var("BOTVISOR_LOG_LEVEL") {
            self.logging.level = Some(level);
        }

        if let Ok(log_file) = std::env::var("BOTVISOR_LOG_FILE") {
            self.logging.log_file = Some(PathBuf::from(log_file));
        }

        if let Ok(work_dir) = std::env::var("BOTVISOR_WORK_DIR") {
            self.runtime.work_dir = PathBuf::from(work_dir);
        }

        if let Ok(interpreter) = std::env::var("BOTVISOR_INTERPRETER") {
            self.runtime.interpreter = interpreter;
        }
    }

    /// 設定からConnectionConfigを生成
    pub fn to_connection_config(&self) -> ConnectionConfig {
        match self.connection.r#type.as_str() {
            "tcp" => ConnectionConfig::Tcp {
                bind_addr: self.connection.tcp_bind_addr.clone(),
            },
            _ => ConnectionConfig::Unix {
                socket_path: self
                    .connection
                    .unix_socket_path
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("botvisor.sock")),
            },
        }
    }

    /// 設定のサンプルを生成
    pub fn sample() -> Self {
        let mut config = Self::default();

        config.connection.unix_socket_path = Some(PathBuf::from("/tmp/botvisor.sock"));
        config.logging.level = Some("info".to_string());
        config.logging.log_file = Some(PathBuf::from("botvisor.log"));
        config.notification.script_path = Some(PathBuf::from("~/.botvisor/notify.sh"));

        config
    }
}
