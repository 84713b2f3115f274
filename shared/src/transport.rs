use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// 接続設定
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionConfig {
    Unix {
        socket_path: PathBuf,
    },
    Tcp {
        bind_addr: String, // "127.0.0.1:3017" など
    },
}

impl ConnectionConfig {
    /// デフォルトのUnix socket設定
    pub fn default_unix() -> Self {
        Self::Unix {
            socket_path: std::env::temp_dir().join("botvisor.sock"),
        }
    }

    /// 表示用のアドレス
    pub fn describe(&self) -> String {
        match self {
            ConnectionConfig::Unix { socket_path } => format!("unix:{}", socket_path.display()),
            ConnectionConfig::Tcp { bind_addr } => format!("tcp:{bind_addr}"),
        }
    }
}

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 改行区切りJSONでやり取りする接続
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer_addr: String,
}

impl Connection {
    fn new<R, W>(reader: R, writer: W, peer_addr: String) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// 1メッセージを1行として送信
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut json = serde_json::to_vec(message).context("Failed to serialize message")?;
        json.push(b'\n');
        self.writer.write_all(&json).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 1行読んでデシリアライズ。接続が閉じていれば None
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            // 空行は読み飛ばす
            if !line.trim().is_empty() {
                break;
            }
        }

        let message = serde_json::from_str(line.trim())
            .with_context(|| format!("Invalid message from {}", self.peer_addr))?;
        Ok(Some(message))
    }
}

/// サーバー側のトランスポート
pub enum ServerTransport {
    Unix {
        listener: tokio::net::UnixListener,
        socket_path: PathBuf,
    },
    Tcp {
        listener: tokio::net::TcpListener,
    },
}

impl ServerTransport {
    pub async fn bind(config: &ConnectionConfig) -> Result<Self> {
        match config {
            ConnectionConfig::Unix { socket_path } => {
                // 前回の異常終了で残ったソケットファイルを削除
                if socket_path.exists() {
                    tokio::fs::remove_file(socket_path).await?;
                }

                let listener = tokio::net::UnixListener::bind(socket_path)
                    .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
                Ok(Self::Unix {
                    listener,
                    socket_path: socket_path.clone(),
                })
            }
            ConnectionConfig::Tcp { bind_addr } => {
                let listener = tokio::net::TcpListener::bind(bind_addr)
                    .await
                    .with_context(|| format!("Failed to bind {bind_addr}"))?;
                Ok(Self::Tcp { listener })
            }
        }
    }

    pub async fn accept(&mut self) -> Result<Connection> {
        match self {
            ServerTransport::Unix {
                listener,
                socket_path,
            } => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                let peer_addr = format!("unix:{}", socket_path.display());
                Ok(Connection::new(reader, writer, peer_addr))
            }
            ServerTransport::Tcp { listener } => {
                let (stream, addr) = listener.accept().await?;
                if !addr.ip().is_loopback() {
                    return Err(anyhow!("Connection from {} is not allowed", addr.ip()));
                }
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(reader, writer, format!("tcp:{addr}")))
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            ServerTransport::Unix { socket_path, .. } => {
                if socket_path.exists() {
                    tokio::fs::remove_file(socket_path).await?;
                }
                Ok(())
            }
            // TCPリスナーはドロップで閉じられる
            ServerTransport::Tcp { .. } => Ok(()),
        }
    }
}

/// クライアント側のトランスポート
pub struct ClientTransport;

impl ClientTransport {
    pub async fn connect(config: &ConnectionConfig) -> Result<Connection> {
        match config {
            ConnectionConfig::Unix { socket_path } => {
                let stream = tokio::net::UnixStream::connect(socket_path)
                    .await
                    .with_context(|| {
                        format!("Failed to connect to {}", socket_path.display())
                    })?;
                let (reader, writer) = stream.into_split();
                let peer_addr = format!("unix:{}", socket_path.display());
                Ok(Connection::new(reader, writer, peer_addr))
            }
            ConnectionConfig::Tcp { bind_addr } => {
                let stream = tokio::net::TcpStream::connect(bind_addr)
                    .await
                    .with_context(|| format!("Failed to connect to {bind_addr}"))?;
                let addr = stream.peer_addr()?;
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(reader, writer, format!("tcp:{addr}")))
            }
        }
    }
}
