// output_parser.rs - 子プロセスの出力行から状態・成績を取り出す

use std::sync::OnceLock;

use botvisor_shared::logging::LogCategory;
use botvisor_shared::{log_trace, BotState, ParserKind, PerformanceUpdate, TradeSide};
use regex::Regex;
use serde::Deserialize;

/// 1行分の解析結果。どちらもマッチしたフィールドだけを持つ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub state: Option<BotState>,
    pub performance: Option<PerformanceUpdate>,
}

impl ParsedOutput {
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.performance.is_none()
    }

    fn from_parts(state: BotState, performance: PerformanceUpdate) -> Self {
        Self {
            state: (!state.is_empty()).then_some(state),
            performance: (!performance.is_empty()).then_some(performance),
        }
    }
}

/// 出力パーサの共通インターフェース
pub trait OutputParser: Send + Sync {
    /// 1行を解析する。何もマッチしなければ空の結果
    fn parse_line(&self, line: &str) -> ParsedOutput;

    fn name(&self) -> &'static str;
}

/// ラベル付き数値のパターン
struct LabelPatterns {
    current_price: Regex,
    upper_breakout: Regex,
    lower_breakout: Regex,
    trade_state: Regex,
    entry_price: Regex,
    atr: Regex,
    moving_average: Regex,
    trade_pnl: Regex,
    total_trades: Regex,
    profitable_trades: Regex,
    max_profit: Regex,
    max_loss: Regex,
    asset_high: Regex,
    asset_low: Regex,
}

static LABEL_PATTERNS: OnceLock<LabelPatterns> = OnceLock::new();

const DECIMAL: &str = r"(-?\d+(?:\.\d+)?)";
const COUNT: &str = r"(\d+)";

fn label_regex(label: &str, value: &str) -> Regex {
    Regex::new(&format!(r"{}:\s*{}", regex::escape(label), value))
        .expect("label pattern is a valid regex")
}

fn label_patterns() -> &'static LabelPatterns {
    LABEL_PATTERNS.get_or_init(|| LabelPatterns {
        current_price: label_regex("Current Price", DECIMAL),
        upper_breakout: label_regex("Upper Breakout", DECIMAL),
        lower_breakout: label_regex("Lower Breakout", DECIMAL),
        trade_state: label_regex("Trade State", r"(BUY|SELL)\b"),
        entry_price: label_regex("Entry Price", DECIMAL),
        atr: Regex::new(&format!(r"\bATR:\s*{DECIMAL}")).expect("ATR pattern is a valid regex"),
        moving_average: label_regex("Moving Average", DECIMAL),
        trade_pnl: label_regex("Trade PnL", DECIMAL),
        total_trades: label_regex("Total Trades", COUNT),
        profitable_trades: label_regex("Profitable Trades", COUNT),
        max_profit: label_regex("Max Profit", DECIMAL),
        max_loss: label_regex("Max Loss", DECIMAL),
        asset_high: label_regex("Asset High", DECIMAL),
        asset_low: label_regex("Asset Low", DECIMAL),
    })
}

fn capture<T: std::str::FromStr>(pattern: &Regex, line: &str) -> Option<T> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// "Current Price: 50000.5" のようなラベル付きテキストを解析
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelParser;

impl LabelParser {
    pub fn new() -> Self {
        Self
    }
}

impl OutputParser for LabelParser {
    fn parse_line(&self, line: &str) -> ParsedOutput {
        let p = label_patterns();

        let state = BotState {
            current_price: capture(&p.current_price, line),
            upper_breakout: capture(&p.upper_breakout, line),
            lower_breakout: capture(&p.lower_breakout, line),
            trade_state: p
                .trade_state
                .captures(line)
                .and_then(|caps| caps.get(1))
                .and_then(|m| TradeSide::from_label(m.as_str())),
            entry_price: capture(&p.entry_price, line),
            atr: capture(&p.atr, line),
            moving_average: capture(&p.moving_average, line),
            ..Default::default()
        };

        // "Trade PnL" は従来どおり totalPnL に反映する
        let performance = PerformanceUpdate {
            total_pnl: capture(&p.trade_pnl, line),
            total_trades: capture(&p.total_trades, line),
            profitable_trades: capture(&p.profitable_trades, line),
            max_profit: capture(&p.max_profit, line),
            max_loss: capture(&p.max_loss, line),
            asset_high: capture(&p.asset_high, line),
            asset_low: capture(&p.asset_low, line),
        };

        ParsedOutput::from_parts(state, performance)
    }

    fn name(&self) -> &'static str {
        "labels"
    }
}

#[derive(Debug, Deserialize)]
struct JsonEvent {
    #[serde(default)]
    state: Option<BotState>,
    #[serde(default)]
    performance: Option<PerformanceUpdate>,
}

/// `{"state": {...}, "performance": {...}}` を1行1イベントで受け取る
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLineParser;

impl JsonLineParser {
    pub fn new() -> Self {
        Self
    }
}

impl OutputParser for JsonLineParser {
    fn parse_line(&self, line: &str) -> ParsedOutput {
        let line = line.trim();
        if !line.starts_with('{') {
            return ParsedOutput::default();
        }

        match serde_json::from_str::<JsonEvent>(line) {
            Ok(event) => ParsedOutput::from_parts(
                event.state.unwrap_or_default(),
                event.performance.unwrap_or_default(),
            ),
            Err(e) => {
                log_trace!(LogCategory::Parser, "Ignoring malformed JSON line: {e}");
                ParsedOutput::default()
            }
        }
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// パーサのファクトリー
pub fn create_output_parser(kind: ParserKind) -> Box<dyn OutputParser> {
    match kind {
        ParserKind::Labels => Box::new(LabelParser::new()),
        ParserKind::Json => Box::new(JsonLineParser::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_price() {
        let parsed = LabelParser.parse_line("Current Price: 50000.5");
        assert_eq!(parsed.state.unwrap().current_price, Some(50000.5));
        assert!(parsed.performance.is_none());
    }

    #[test]
    fn test_multiple_labels_on_one_line() {
        let parsed = LabelParser
            .parse_line("Upper Breakout: 51000.25 | Lower Breakout: 49000.75 | Trade State: SELL");
        let state = parsed.state.unwrap();
        assert_eq!(state.upper_breakout, Some(51000.25));
        assert_eq!(state.lower_breakout, Some(49000.75));
        assert_eq!(state.trade_state, Some(TradeSide::Sell));
        assert!(state.current_price.is_none());
    }

    #[test]
    fn test_performance_labels() {
        let parsed =
            LabelParser.parse_line("Trade PnL: -12.34 Total Trades: 7 Profitable Trades: 4");
        let perf = parsed.performance.unwrap();
        assert_eq!(perf.total_pnl, Some(-12.34));
        assert_eq!(perf.total_trades, Some(7));
        assert_eq!(perf.profitable_trades, Some(4));
        assert!(parsed.state.is_none());
    }

    #[test]
    fn test_indicator_labels() {
        let parsed = LabelParser.parse_line("ATR: 120.5, Moving Average: 50210, Entry Price: 50000");
        let state = parsed.state.unwrap();
        assert_eq!(state.atr, Some(120.5));
        assert_eq!(state.moving_average, Some(50210.0));
        assert_eq!(state.entry_price, Some(50000.0));
    }

    #[test]
    fn test_unmatched_line_is_ignored() {
        assert!(LabelParser.parse_line("Starting DCA trading bot...").is_empty());
        assert!(LabelParser.parse_line("").is_empty());
        // 不明な売買状態は無視
        assert!(LabelParser.parse_line("Trade State: HOLD").is_empty());
    }

    #[test]
    fn test_json_line_parser() {
        let parser = JsonLineParser::new();
        let parsed = parser.parse_line(
            r#"{"state":{"currentPrice":101.5,"tradeState":"BUY"},"performance":{"totalTrades":2}}"#,
        );
        let state = parsed.state.unwrap();
        assert_eq!(state.current_price, Some(101.5));
        assert_eq!(state.trade_state, Some(TradeSide::Buy));
        assert_eq!(parsed.performance.unwrap().total_trades, Some(2));

        assert!(parser.parse_line("Current Price: 1.0").is_empty());
        assert!(parser.parse_line("{ broken").is_empty());
        assert!(parser.parse_line(r#"{"state":{}}"#).is_empty());
    }

    #[test]
    fn test_factory() {
        assert_eq!(create_output_parser(ParserKind::Labels).name(), "labels");
        assert_eq!(create_output_parser(ParserKind::Json).name(), "json");
    }
}
