use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// ログレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Trace => write!(f, "TRACE"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// ログカテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    System,
    Transport,
    Supervisor,
    Registry,
    Child,
    Parser,
    Watchdog,
    Notification,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCategory::System => write!(f, "SYSTEM"),
            LogCategory::Transport => write!(f, "TRANSPORT"),
            LogCategory::Supervisor => write!(f, "SUPERVISOR"),
            LogCategory::Registry => write!(f, "REGISTRY"),
            LogCategory::Child => write!(f, "CHILD"),
            LogCategory::Parser => write!(f, "PARSER"),
            LogCategory::Watchdog => write!(f, "WATCHDOG"),
            LogCategory::Notification => write!(f, "NOTIFY"),
        }
    }
}

/// グローバルログレベル
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// ログメッセージの出力先
static LOG_OUTPUT: OnceLock<Box<dyn Fn(&str) + Send + Sync>> = OnceLock::new();

/// ログレベルを設定
pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// 現在のログレベルを取得
pub fn get_log_level() -> LogLevel {
    match GLOBAL_LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        4 => LogLevel::Trace,
        _ => LogLevel::Info,
    }
}

/// ログ出力先を設定（最初の1回のみ有効）
pub fn set_log_output<F>(output: F) -> bool
where
    F: Fn(&str) + Send + Sync + 'static,
{
    LOG_OUTPUT.set(Box::new(output)).is_ok()
}

/// ログをファイルへ追記する
pub fn set_log_file(path: &Path) -> std::io::Result<bool> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let file = Mutex::new(file);

    Ok(set_log_output(move |line| {
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }))
}

/// ログメッセージの出力
pub fn log_message(level: LogLevel, category: LogCategory, message: &str) {
    if level > get_log_level() {
        return;
    }

    let timestamp = chrono::Utc::now().format("%H:%M:%S%.3f");
    let formatted = format!("[{timestamp}] [{level}] [{category}] {message}");

    if let Some(output) = LOG_OUTPUT.get() {
        output(&formatted);
    } else {
        eprintln!("{formatted}");
    }
}

/// ログマクロ
#[macro_export]
macro_rules! log_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            $category,
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            $category,
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            $category,
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Debug,
            $category,
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_trace {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Trace,
            $category,
            &format!($($arg)*)
        )
    };
}

/// 便利なマクロ - よく使うカテゴリ別
#[macro_export]
macro_rules! log_system {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::System, $($arg)*)
        }
    };
}

#[macro_export]
macro_rules! log_transport {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Transport, $($arg)*)
        }
    };
}

#[macro_export]
macro_rules! log_supervisor {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Supervisor, $($arg)*)
        }
    };
}

#[macro_export]
macro_rules! log_registry {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Registry, $($arg)*)
        }
    };
}

#[macro_export]
macro_rules! log_child {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Child, $($arg)*)
        }
    };
}
