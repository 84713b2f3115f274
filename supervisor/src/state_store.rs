// state_store.rs - レジストリ（processKey → ProcessRecord）の永続化

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use botvisor_shared::{log_registry, BotConfig, ProcessRecord};
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// processKey 順に並んだレジストリ
pub type Registry = BTreeMap<String, ProcessRecord>;

/// JSONファイル1つに保存されるレジストリ
#[derive(Debug, Clone)]
pub struct StateStore {
    registry_path: PathBuf,
    config_dir: PathBuf,
}

impl StateStore {
    /// ボット設定ファイルはレジストリと同じディレクトリに置く
    pub fn new<P: Into<PathBuf>>(registry_path: P) -> Self {
        let registry_path = registry_path.into();
        let config_dir = registry_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            registry_path,
            config_dir,
        }
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// 読み込み。ファイルがない・壊れている場合は空
    pub async fn read(&self) -> Registry {
        let data = match tokio::fs::read_to_string(&self.registry_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Registry::new(),
            Err(e) => {
                log_registry!(
                    warn,
                    "Failed to read {}: {e}; starting with an empty registry",
                    self.registry_path.display()
                );
                return Registry::new();
            }
        };

        match serde_json::from_str(&data) {
            Ok(registry) => registry,
            Err(e) => {
                log_registry!(
                    warn,
                    "Unparsable registry {}: {e}; starting with an empty registry",
                    self.registry_path.display()
                );
                Registry::new()
            }
        }
    }

    /// 一時ファイルに書いてから rename で置き換える
    pub async fn write(&self, registry: &Registry) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(registry)?;
        let tmp_path = self.tmp_path();

        // 設定の認証情報も入るので所有者のみ読める状態で置き換える
        write_private(&tmp_path, json.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.registry_path)
            .await
            .map_err(|e| StoreError::io(&self.registry_path, e))?;

        log_registry!(trace, "Flushed {} record(s)", registry.len());
        Ok(())
    }

    /// 子プロセスが読む設定ファイルのパス
    pub fn config_path(&self, process_key: &str) -> PathBuf {
        self.config_dir.join(format!("{process_key}.json"))
    }

    /// 設定スナップショットを書き出す（認証情報を含みうるので所有者のみ読める）
    pub async fn write_bot_config(&self, config: &BotConfig) -> Result<PathBuf, StoreError> {
        let path = self.config_path(&config.process_key);
        let json = serde_json::to_string_pretty(config)?;

        write_private(&path, json.as_bytes()).await?;
        Ok(path)
    }

    /// 設定ファイルを削除（存在しない場合も成功扱い）
    pub async fn remove_bot_config(&self, process_key: &str) -> Result<(), StoreError> {
        let path = self.config_path(process_key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .registry_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.registry_path.with_file_name(name)
    }
}

/// パーミッション 0600 でファイルを書く
///
/// 既存ファイルは作成時のモードが効かないので書いた後にも設定し直す。
async fn write_private(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.flush().await.map_err(|e| StoreError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| StoreError::io(path, e))?;
    }
    Ok(())
}
