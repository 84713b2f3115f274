// サーバー統合テストの共通フィクスチャ

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use botvisor_daemon::{RequestHandler, SupervisorServer};
use botvisor_shared::{ConnectionConfig, Request, Response};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// 受け取ったリクエストを記録して固定の応答を返す
#[derive(Default)]
pub struct RecordingHandler {
    pub requests: Mutex<Vec<Request>>,
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, request: Request) -> Response {
        let message = format!("handled {}", request.name());
        self.requests.lock().unwrap().push(request);
        Response::ok(200, message, None)
    }
}

/// 起動中のテストサーバー
pub struct RunningServer {
    pub config: ConnectionConfig,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    /// 終了させて run_until の結果を返す
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.expect("server task panicked")
    }
}

/// 一時ディレクトリの unix socket でサーバーを起動
pub async fn spawn_server(dir: &Path, handler: Arc<dyn RequestHandler>) -> RunningServer {
    let config = ConnectionConfig::Unix {
        socket_path: dir.join("botvisor.sock"),
    };
    let server = SupervisorServer::bind(&config, handler)
        .await
        .expect("bind test server");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    RunningServer {
        config,
        shutdown: Some(shutdown_tx),
        task,
    }
}
