use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// process key の最大長（ファイル名にも使われる）
pub const MAX_PROCESS_KEY_LEN: usize = 128;

/// 応答に載せる際に認証情報を置き換える文字列
pub const REDACTED: &str = "[redacted]";

/// ボットの動作モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    /// 監視のみ（発注しない）
    Watcher,
    /// 実際に発注する
    Action,
}

/// 売買方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// 個別トレード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub entry: f64,
    pub exit: Option<f64>,
    pub quantity: f64,
    pub pnl: Option<f64>,
    pub time: i64,
}

/// ボット起動設定
///
/// 子プロセスはこの内容を `<processKey>.json` から読むため、JSON表現は
/// 生成スクリプト側の期待する camelCase に揃えている。未知のフィールドは
/// `extra` にそのまま保持して子プロセスへ渡す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub process_key: String,
    pub symbol: String,
    pub mode: BotMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binance_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binance_api_secret: Option<String>,
    /// 欠落・整数でない値は 0 になり validate で弾かれる
    #[serde(default, deserialize_with = "deserialize_period")]
    pub atr_period: u32,
    #[serde(default)]
    pub deposit_amount: f64,
    #[serde(default)]
    pub state_timeout: u64,
    #[serde(default)]
    pub trade_frequency_threshold: u32,
    #[serde(default)]
    pub trade_frequency_window: u64,
    #[serde(default)]
    pub trades: Vec<Trade>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 設定検証エラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Process key is required")]
    MissingProcessKey,

    #[error("Process key is longer than {} characters", MAX_PROCESS_KEY_LEN)]
    ProcessKeyTooLong,

    #[error("Process key may only contain letters, digits, '-' and '_': {0}")]
    InvalidProcessKey(String),

    #[error("Symbol is required")]
    MissingSymbol,

    #[error("atrPeriod must be a positive integer")]
    InvalidAtrPeriod,

    #[error("depositAmount must be a finite, non-negative number")]
    InvalidDepositAmount,

    #[error("binanceApiKey and binanceApiSecret must be provided together")]
    IncompleteCredentials,
}

impl BotConfig {
    /// 最小構成の設定を作成
    pub fn new(process_key: impl Into<String>, symbol: impl Into<String>, mode: BotMode) -> Self {
        Self {
            process_key: process_key.into(),
            symbol: symbol.into(),
            mode,
            binance_api_key: None,
            binance_api_secret: None,
            atr_period: 14,
            deposit_amount: 0.0,
            state_timeout: 0,
            trade_frequency_threshold: 0,
            trade_frequency_window: 0,
            trades: Vec::new(),
            extra: Map::new(),
        }
    }

    /// レジストリ境界での検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_process_key(&self.process_key)?;

        if self.symbol.trim().is_empty() {
            return Err(ConfigError::MissingSymbol);
        }
        if self.atr_period == 0 {
            return Err(ConfigError::InvalidAtrPeriod);
        }
        if !self.deposit_amount.is_finite() || self.deposit_amount < 0.0 {
            return Err(ConfigError::InvalidDepositAmount);
        }
        if self.binance_api_key.is_some() != self.binance_api_secret.is_some() {
            return Err(ConfigError::IncompleteCredentials);
        }

        Ok(())
    }

    /// 認証情報を持っているか
    pub fn has_credentials(&self) -> bool {
        self.binance_api_key.is_some() && self.binance_api_secret.is_some()
    }

    /// 認証情報を伏せたコピー（有無は残す）
    pub fn redacted(&self) -> Self {
        let mask = |value: &Option<String>| value.as_ref().map(|_| REDACTED.to_string());
        Self {
            binance_api_key: mask(&self.binance_api_key),
            binance_api_secret: mask(&self.binance_api_secret),
            ..self.clone()
        }
    }
}

/// `14` も `14.0` も受け付ける。表せない値は 0
fn deserialize_period<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(match value {
        Some(v) if v.is_finite() && v.fract() == 0.0 && v >= 1.0 && v <= f64::from(u32::MAX) => {
            v as u32
        }
        _ => 0,
    })
}

/// process key はファイル名になるので使える文字を制限する
pub fn validate_process_key(key: &str) -> Result<(), ConfigError> {
    if key.is_empty() {
        return Err(ConfigError::MissingProcessKey);
    }
    if key.len() > MAX_PROCESS_KEY_LEN {
        return Err(ConfigError::ProcessKeyTooLong);
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::InvalidProcessKey(key.to_string()));
    }
    Ok(())
}
