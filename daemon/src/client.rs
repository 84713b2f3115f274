// client.rs - supervisor サーバーへのクライアント

use anyhow::{anyhow, Context, Result};
use botvisor_shared::{BotConfig, ClientTransport, ConnectionConfig, Request, Response};

/// 1リクエストごとに接続して応答を1つ受け取る
#[derive(Debug, Clone)]
pub struct SupervisorClient {
    config: ConnectionConfig,
}

impl SupervisorClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub async fn send(&self, request: &Request) -> Result<Response> {
        let mut connection = ClientTransport::connect(&self.config)
            .await
            .with_context(|| format!("Is `botvisor serve` running on {}?", self.config.describe()))?;

        connection.send(request).await?;
        connection
            .receive::<Response>()
            .await?
            .ok_or_else(|| anyhow!("Connection closed before a response was received"))
    }

    pub async fn start(&self, config: BotConfig) -> Result<Response> {
        self.send(&Request::Start { config }).await
    }

    pub async fn list(&self) -> Result<Response> {
        self.send(&Request::List).await
    }

    pub async fn get(&self, process_key: &str) -> Result<Response> {
        self.send(&Request::Get {
            process_key: process_key.to_string(),
        })
        .await
    }

    pub async fn stop(&self, process_key: &str) -> Result<Response> {
        self.send(&Request::Stop {
            process_key: process_key.to_string(),
        })
        .await
    }

    pub async fn restart(&self, process_key: &str) -> Result<Response> {
        self.send(&Request::Restart {
            process_key: process_key.to_string(),
        })
        .await
    }
}
