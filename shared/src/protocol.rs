use crate::bot::{BotConfig, Trade, TradeSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// プロセス状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running, // 🟢 実行中
    Stopped, // ⚪ 停止
    Error,   // 🔴 エラー
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.icon(), self.label())
    }
}

impl ProcessStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Running => "🟢",
            Self::Stopped => "⚪",
            Self::Error => "🔴",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// 子プロセスが報告する最新の売買状態（疎・差分マージ）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_breakout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_breakout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_state: Option<TradeSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moving_average: Option<f64>,
}

impl BotState {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 値を持つフィールドだけ上書きする
    pub fn merge(&mut self, update: BotState) {
        merge_field(&mut self.upper_breakout, update.upper_breakout);
        merge_field(&mut self.lower_breakout, update.lower_breakout);
        merge_field(&mut self.current_price, update.current_price);
        merge_field(&mut self.trade_state, update.trade_state);
        merge_field(&mut self.entry_price, update.entry_price);
        merge_field(&mut self.trade_quantity, update.trade_quantity);
        merge_field(&mut self.atr, update.atr);
        merge_field(&mut self.atr_multiplier, update.atr_multiplier);
        merge_field(&mut self.moving_average, update.moving_average);
    }
}

fn merge_field<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

fn apply_field<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// バックテスト/履歴のパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParameters {
    pub atr_period: u32,
    pub deposit_amount: f64,
    pub interval: String,
}

/// トレード履歴
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeHistory {
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub win_rate: f64,
    #[serde(rename = "totalPnL")]
    pub total_pnl: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    pub asset_high: f64,
    pub asset_low: f64,
    pub trades: Vec<Trade>,
    pub parameters: HistoryParameters,
}

impl TradeHistory {
    /// 起動直後の空の履歴
    pub fn empty_for(config: &BotConfig, now: DateTime<Utc>) -> Self {
        Self {
            symbol: config.symbol.clone(),
            start_time: now,
            end_time: now,
            total_trades: 0,
            winning_trades: 0,
            win_rate: 0.0,
            total_pnl: 0.0,
            max_profit: 0.0,
            max_loss: 0.0,
            asset_high: 0.0,
            asset_low: 0.0,
            trades: Vec::new(),
            parameters: HistoryParameters {
                atr_period: config.atr_period,
                deposit_amount: config.deposit_amount,
                interval: "1h".to_string(),
            },
        }
    }
}

/// 累積パフォーマンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_trades: u64,
    pub profitable_trades: u64,
    #[serde(rename = "totalPnL")]
    pub total_pnl: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    pub asset_high: f64,
    pub asset_low: f64,
    pub trade_history: TradeHistory,
}

impl PerformanceMetrics {
    /// カウンタをゼロにした初期値
    pub fn zeroed(config: &BotConfig, now: DateTime<Utc>) -> Self {
        Self {
            total_trades: 0,
            profitable_trades: 0,
            total_pnl: 0.0,
            max_profit: 0.0,
            max_loss: 0.0,
            asset_high: 0.0,
            asset_low: 0.0,
            trade_history: TradeHistory::empty_for(config, now),
        }
    }

    /// 値を持つフィールドだけ上書きする
    pub fn apply(&mut self, update: PerformanceUpdate) {
        apply_field(&mut self.total_trades, update.total_trades);
        apply_field(&mut self.profitable_trades, update.profitable_trades);
        apply_field(&mut self.total_pnl, update.total_pnl);
        apply_field(&mut self.max_profit, update.max_profit);
        apply_field(&mut self.max_loss, update.max_loss);
        apply_field(&mut self.asset_high, update.asset_high);
        apply_field(&mut self.asset_low, update.asset_low);
    }
}

/// パフォーマンスの部分更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_trades: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profitable_trades: Option<u64>,
    #[serde(default, rename = "totalPnL", skip_serializing_if = "Option::is_none")]
    pub total_pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_low: Option<f64>,
}

impl PerformanceUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// ボットプロセス1件分のレコード
///
/// `pid` は `status == Running` の間だけ保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub config: BotConfig,
    #[serde(default)]
    pub error: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub state: BotState,
    pub performance: PerformanceMetrics,
    /// このレコードを所有する起動の識別子
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ProcessRecord {
    /// 起動直後のレコード
    pub fn running(config: BotConfig, pid: u32, run_id: String) -> Self {
        let now = Utc::now();
        let performance = PerformanceMetrics::zeroed(&config, now);
        Self {
            pid: Some(pid),
            status: ProcessStatus::Running,
            config,
            error: String::new(),
            last_updated: now,
            state: BotState::default(),
            performance,
            run_id: Some(run_id),
            started_at: now,
            exit_code: None,
        }
    }

    pub fn process_key(&self) -> &str {
        &self.config.process_key
    }

    /// 外部に返すためのコピー。設定の認証情報を伏せる
    pub fn redacted(&self) -> Self {
        Self {
            config: self.config.redacted(),
            ..self.clone()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    pub fn belongs_to(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id)
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// 出力からの差分を反映（lastUpdated は常に更新）
    pub fn apply_output(&mut self, state: Option<BotState>, performance: Option<PerformanceUpdate>) {
        if let Some(state) = state {
            self.state.merge(state);
        }
        if let Some(performance) = performance {
            self.performance.apply(performance);
        }
        self.touch();
    }

    /// 診断出力によるエラー遷移
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = ProcessStatus::Error;
        self.error = message.into();
        self.pid = None;
        self.touch();
    }

    /// 終了通知。エラー状態は維持する
    pub fn mark_exited(&mut self, exit_code: Option<i32>) {
        if self.status != ProcessStatus::Error {
            self.status = ProcessStatus::Stopped;
        }
        self.pid = None;
        self.exit_code = exit_code;
        self.touch();
    }
}

/// クライアント → supervisor へのリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Start {
        config: BotConfig,
    },
    List,
    Get {
        #[serde(rename = "processKey")]
        process_key: String,
    },
    Stop {
        #[serde(rename = "processKey")]
        process_key: String,
    },
    Restart {
        #[serde(rename = "processKey")]
        process_key: String,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::List => "list",
            Self::Get { .. } => "get",
            Self::Stop { .. } => "stop",
            Self::Restart { .. } => "restart",
        }
    }
}

/// supervisor → クライアントへのレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(status_code: u16, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            status_code,
            data,
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            status_code,
            data: None,
        }
    }

    /// data を型付きで取り出す
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::BotMode;

    fn sample_record() -> ProcessRecord {
        let config = BotConfig::new("p1", "BTC/USDT", BotMode::Watcher);
        ProcessRecord::running(config, 4242, "run-1".to_string())
    }

    #[test]
    fn test_state_merge_is_additive() {
        let mut state = BotState::default();
        state.merge(BotState {
            current_price: Some(100.0),
            ..Default::default()
        });
        state.merge(BotState {
            trade_state: Some(TradeSide::Buy),
            ..Default::default()
        });

        assert_eq!(state.current_price, Some(100.0));
        assert_eq!(state.trade_state, Some(TradeSide::Buy));

        // 新しい値は上書き
        state.merge(BotState {
            current_price: Some(101.5),
            ..Default::default()
        });
        assert_eq!(state.current_price, Some(101.5));
        assert_eq!(state.trade_state, Some(TradeSide::Buy));
    }

    #[test]
    fn test_performance_apply_keeps_absent_fields() {
        let mut record = sample_record();
        record.performance.apply(PerformanceUpdate {
            total_trades: Some(3),
            profitable_trades: Some(2),
            ..Default::default()
        });
        record.performance.apply(PerformanceUpdate {
            total_pnl: Some(-12.5),
            ..Default::default()
        });

        assert_eq!(record.performance.total_trades, 3);
        assert_eq!(record.performance.profitable_trades, 2);
        assert_eq!(record.performance.total_pnl, -12.5);
        assert_eq!(record.performance.trade_history.parameters.interval, "1h");
    }

    #[test]
    fn test_pid_follows_status() {
        let mut record = sample_record();
        assert!(record.is_running());
        assert_eq!(record.pid, Some(4242));

        record.mark_error("Strategy execution error: timeout");
        assert_eq!(record.status, ProcessStatus::Error);
        assert!(record.pid.is_none());

        // エラー後の終了ではエラー状態を維持
        record.mark_exited(Some(1));
        assert_eq!(record.status, ProcessStatus::Error);
        assert_eq!(record.exit_code, Some(1));

        let mut clean = sample_record();
        clean.mark_exited(Some(0));
        assert_eq!(clean.status, ProcessStatus::Stopped);
        assert!(clean.pid.is_none());
    }

    #[test]
    fn test_record_json_layout() {
        let mut record = sample_record();
        record.apply_output(
            Some(BotState {
                current_price: Some(50000.5),
                ..Default::default()
            }),
            None,
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["config"]["processKey"], "p1");
        assert_eq!(value["state"]["currentPrice"], 50000.5);
        assert_eq!(value["performance"]["totalPnL"], 0.0);
        assert!(value["state"].get("upperBreakout").is_none());

        let back: ProcessRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_request_wire_format() {
        let request = Request::Get {
            process_key: "p1".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"op":"get","processKey":"p1"}"#);

        let list: Request = serde_json::from_str(r#"{"op":"list"}"#).unwrap();
        assert_eq!(list, Request::List);
        assert_eq!(list.name(), "list");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Running.to_string(), "🟢 running");
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Error).unwrap(),
            r#""error""#
        );
    }
}
