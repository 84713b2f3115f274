// server.rs - ローカルソケットでリクエストを受け付けるサーバー

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use botvisor_shared::{
    log_transport, Connection, ConnectionConfig, Request, Response, ServerTransport,
};

use crate::handler::RequestHandler;

pub struct SupervisorServer {
    transport: ServerTransport,
    description: String,
    handler: Arc<dyn RequestHandler>,
}

impl SupervisorServer {
    /// ソケットをバインドする（この時点で接続を受け付け可能）
    pub async fn bind(config: &ConnectionConfig, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let transport = ServerTransport::bind(config).await?;
        log_transport!(info, "Listening on {}", config.describe());
        Ok(Self {
            transport,
            description: config.describe(),
            handler,
        })
    }

    /// Ctrl-C / SIGTERM まで受け付ける
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// `shutdown` が完了するまで接続ごとにタスクを起動する
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(connection) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(handle_connection(connection, handler));
                    }
                    Err(e) => log_transport!(warn, "Rejected connection: {e}"),
                },
                _ = &mut shutdown => {
                    log_transport!(info, "Shutting down {}", self.description);
                    break;
                }
            }
        }

        self.transport.shutdown().await
    }
}

/// 1接続分の処理：1行のリクエストに1行のレスポンス
async fn handle_connection(mut connection: Connection, handler: Arc<dyn RequestHandler>) {
    let peer = connection.peer_addr().to_string();
    log_transport!(debug, "Client connected: {peer}");

    loop {
        let response = match connection.receive::<Request>().await {
            Ok(Some(request)) => {
                log_transport!(debug, "{peer} -> {}", request.name());
                handler.handle(request).await
            }
            Ok(None) => break,
            Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                Response::error(400, format!("Invalid request: {e:#}"))
            }
            Err(e) => {
                log_transport!(warn, "Read error from {peer}: {e}");
                break;
            }
        };

        if let Err(e) = connection.send(&response).await {
            log_transport!(debug, "Failed to reply to {peer}: {e}");
            break;
        }
    }

    log_transport!(debug, "Client disconnected: {peer}");
}

/// Ctrl-C または SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
