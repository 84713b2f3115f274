// handler.rs - リクエストを supervisor の操作に対応付ける

use async_trait::async_trait;
use botvisor_shared::{log_supervisor, ProcessRecord, Request, Response};
use botvisor_supervisor::{Supervisor, SupervisorError};
use serde::Serialize;
use serde_json::Value;

/// 1リクエストに1レスポンスを返すハンドラー
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Supervisor に委譲するハンドラー
pub struct SupervisorHandler {
    supervisor: Supervisor,
}

impl SupervisorHandler {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl RequestHandler for SupervisorHandler {
    async fn handle(&self, request: Request) -> Response {
        let op = request.name();
        let result = match request {
            Request::Start { config } => self
                .supervisor
                .start_process(config)
                .await
                .map(|record| Response::ok(201, "Process started successfully", record_data(&record))),
            Request::List => self.supervisor.get_all_processes().await.map(|records| {
                let records: Vec<ProcessRecord> = records.iter().map(ProcessRecord::redacted).collect();
                Response::ok(200, "Processes retrieved successfully", to_data(&records))
            }),
            Request::Get { process_key } => self
                .supervisor
                .get_process_by_key(&process_key)
                .await
                .map(|record| Response::ok(200, "Process retrieved successfully", record_data(&record))),
            Request::Stop { process_key } => self
                .supervisor
                .stop_process(&process_key)
                .await
                .map(|()| Response::ok(200, "Process stopped successfully", None)),
            Request::Restart { process_key } => self
                .supervisor
                .restart_process(&process_key)
                .await
                .map(|record| Response::ok(200, "Process restarted successfully", record_data(&record))),
        };

        result.unwrap_or_else(|err| error_response(op, &err))
    }
}

/// 認証情報はクライアントへ返さない
fn record_data(record: &ProcessRecord) -> Option<Value> {
    to_data(&record.redacted())
}

fn to_data<T: Serialize>(value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            log_supervisor!(error, "Failed to serialize response data: {e}");
            None
        }
    }
}

/// エラーを API レスポンスに変換
pub fn error_response(op: &str, err: &SupervisorError) -> Response {
    if err.is_user_error() {
        log_supervisor!(debug, "{op} rejected: {err}");
    } else {
        log_supervisor!(error, "{op} failed: {err}");
    }
    Response::error(err.status_code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use botvisor_shared::{BotConfig, BotMode, REDACTED};

    #[test]
    fn test_record_data_redacts_credentials() {
        let mut config = BotConfig::new("p1", "BTC/USDT", BotMode::Action);
        config.binance_api_key = Some("live-key".to_string());
        config.binance_api_secret = Some("live-secret".to_string());
        let record = ProcessRecord::running(config, 42, "run-1".to_string());

        let data = record_data(&record).unwrap();
        assert_eq!(data["config"]["binanceApiSecret"], REDACTED);
        assert_eq!(data["config"]["binanceApiKey"], REDACTED);
        assert_eq!(data["pid"], 42);
        assert!(!data.to_string().contains("live-secret"));
    }

    #[test]
    fn test_error_response() {
        let response = error_response("get", &SupervisorError::NotFound("p1".to_string()));
        assert!(!response.success);
        assert_eq!(response.status_code, 404);
        assert_eq!(response.message, "Process not found: p1");
        assert!(response.data.is_none());

        let response = error_response("start", &SupervisorError::SpawnFailure("ENOENT".into()));
        assert_eq!(response.status_code, 500);
    }
}
