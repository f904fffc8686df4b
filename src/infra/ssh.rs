//! SSH 远程执行器
//!
//! 基于 russh client：建立连接、公钥认证、exec 命令并流式读取输出

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{Host, RawLine};

use super::executor::{ExecError, RemoteExecutor};

/// SSH 执行器配置
#[derive(Clone, Debug)]
pub struct SshExecutor {
    /// 主机未指定 credential 时使用的私钥
    default_key: PathBuf,
    /// known_hosts 文件，为空时不校验主机密钥
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(default_key: PathBuf, known_hosts: Option<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            default_key,
            known_hosts,
            connect_timeout,
        }
    }

    fn key_path<'a>(&'a self, host: &'a Host) -> &'a Path {
        host.credential
            .as_deref()
            .map(Path::new)
            .unwrap_or(self.default_key.as_path())
    }

    async fn connect(&self, host: &Host) -> Result<client::Handle<ClientHandler>, ExecError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let handler = ClientHandler {
            host: host.address.clone(),
            port: host.port,
            known_hosts: self.known_hosts.clone(),
        };

        let connect = client::connect(config, (host.address.as_str(), host.port), handler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ExecError::Connect(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| ExecError::Connect(e.to_string()))?;

        let key_path = self.key_path(host);
        let key = russh_keys::load_secret_key(key_path, None).map_err(|e| {
            ExecError::Connect(format!("failed to load key {}: {}", key_path.display(), e))
        })?;

        let authenticated = handle
            .authenticate_publickey(&host.user, Arc::new(key))
            .await
            .map_err(|e| ExecError::Connect(e.to_string()))?;
        if !authenticated {
            return Err(ExecError::Connect(format!(
                "public key authentication rejected for {}@{}",
                host.user, host.address
            )));
        }

        Ok(handle)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        sink: mpsc::Sender<RawLine>,
    ) -> Result<i32, ExecError> {
        let handle = self.connect(host).await?;
        debug!(host = %host.address, "SSH connection established");

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Io(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::Io(e.to_string()))?;

        let mut stdout = LineSplitter::default();
        let mut stderr = LineSplitter::default();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    for line in stdout.push(data) {
                        let _ = sink.send(RawLine::stdout(line)).await;
                    }
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    for line in stderr.push(data) {
                        let _ = sink.send(RawLine::stderr(line)).await;
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                _ => {}
            }
        }

        if let Some(rest) = stdout.finish() {
            let _ = sink.send(RawLine::stdout(rest)).await;
        }
        if let Some(rest) = stderr.finish() {
            let _ = sink.send(RawLine::stderr(rest)).await;
        }

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %host.address, error = %e, "SSH disconnect failed");
        }

        exit_code.ok_or_else(|| ExecError::Io("channel closed without exit status".to_string()))
    }
}

/// russh client 回调
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let Some(ref path) = self.known_hosts else {
            return Ok(true);
        };

        match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(known) => {
                if !known {
                    warn!(host = %self.host, "Host key not present in known_hosts");
                }
                Ok(known)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

/// 把任意分块的字节流切分为行
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    line.strip_suffix('\r').unwrap_or(&line).to_string()
}
