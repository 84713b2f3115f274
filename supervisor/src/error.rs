use botvisor_shared::ConfigError;

/// レジストリ入出力のエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// supervisor 操作のエラー
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Bot already running for this process key: {0}")]
    DuplicateProcess(String),

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn bot process: {0}")]
    SpawnFailure(String),

    #[error("Failed to terminate process {pid}: {reason}")]
    TerminationFailure { pid: u32, reason: String },

    #[error("Invalid bot config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Storage(#[from] StoreError),

    #[error("Supervisor is not running")]
    Unavailable,
}

impl SupervisorError {
    /// API レスポンスのステータスコード
    pub fn status_code(&self) -> u16 {
        match self {
            Self::DuplicateProcess(_) | Self::InvalidConfig(_) => 400,
            Self::NotFound(_) => 404,
            Self::Unavailable => 503,
            Self::SpawnFailure(_) | Self::TerminationFailure { .. } | Self::Storage(_) => 500,
        }
    }

    /// 利用者側で修正できるエラーか
    pub fn is_user_error(&self) -> bool {
        self.status_code() < 500
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
