//! 基于 russh 的传输实现
//!
//! 每个会话对应一个 russh 客户端连接；每个通道由一个泵任务读取 `ChannelMsg`，
//! 按 Data / ExtendedData / ExitStatus 拆分到各自的队列，使 stdout 和 stderr 可以被独立读取

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, Result};
use crate::transport::{RemoteChannel, RemoteSession, Transport};

/// SSH_EXTENDED_DATA_STDERR
const EXTENDED_DATA_STDERR: u32 = 1;

/// 主机密钥验证策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// 严格模式：只接受已知的主机密钥
    Strict,
    /// 接受模式：首次连接时接受新密钥，之后验证
    #[default]
    Accept,
    /// 禁用验证（不安全，仅用于开发/测试）
    Disabled,
}

impl std::str::FromStr for HostKeyVerification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept" => Ok(Self::Accept),
            "disabled" | "none" | "false" => Ok(Self::Disabled),
            _ => Err(format!("Unknown host key verification mode: {}", s)),
        }
    }
}

/// SSH 传输设置
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 握手超时（秒）
    pub handshake_timeout_secs: u64,
    /// 主机密钥验证策略
    pub host_key_verification: HostKeyVerification,
    /// 已知主机指纹：`address:port` -> sha256 hex
    pub known_hosts: HashMap<String, String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            host_key_verification: HostKeyVerification::default(),
            known_hosts: HashMap::new(),
        }
    }
}

/// russh 会话工厂
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    settings: Arc<SshSettings>,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }
}

impl Transport for SshTransport {
    fn open_session(&self) -> Result<Arc<dyn RemoteSession>> {
        Ok(Arc::new(SshSession::new(self.settings.clone())))
    }
}

/// 单个 SSH 会话
pub struct SshSession {
    settings: Arc<SshSettings>,
    handle: Mutex<Option<Handle<HostKeyChecker>>>,
    authenticated: AtomicBool,
}

impl SshSession {
    fn new(settings: Arc<SshSettings>) -> Self {
        Self {
            settings,
            handle: Mutex::new(None),
            authenticated: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn connect(
        &self,
        address: &str,
        port: u16,
        username: &str,
        password: Option<&str>,
    ) -> Result<()> {
        debug!(host = %address, port = port, user = %username, "Connecting SSH session");

        let client_config = Arc::new(Config {
            preferred: russh::Preferred::default(),
            ..Default::default()
        });

        let checker = HostKeyChecker {
            verification_mode: self.settings.host_key_verification.clone(),
            known_hosts: self.settings.known_hosts.clone(),
            host: address.to_string(),
            port,
        };

        let overall_timeout =
            self.settings.connect_timeout_secs + self.settings.handshake_timeout_secs;

        let mut handle = timeout(
            Duration::from_secs(overall_timeout),
            client::connect(client_config, (address.to_string(), port), checker),
        )
        .await
        .map_err(|_| {
            ExecutorError::Transport(format!("SSH connect timed out: {}:{}", address, port))
        })?
        .map_err(|e| {
            error!(error = %e, "SSH connection failed");
            if e.to_string().contains("Host key") || e.to_string().contains("fingerprint") {
                ExecutorError::Transport(format!("Host key verification failed: {}", e))
            } else {
                ExecutorError::Transport(format!("SSH connection failed: {}", e))
            }
        })?;

        let auth_result = match password {
            Some(password) => handle.authenticate_password(username, password).await,
            None => handle.authenticate_none(username).await,
        };

        match auth_result {
            Ok(true) => {}
            Ok(false) => {
                error!(host = %address, user = %username, "SSH authentication rejected");
                return Err(ExecutorError::Authentication(format!(
                    "{}@{}:{}",
                    username, address, port
                )));
            }
            Err(e) => {
                error!(error = %e, "SSH authentication failed");
                return Err(ExecutorError::Authentication(e.to_string()));
            }
        }

        *self.handle.lock().await = Some(handle);
        self.authenticated.store(true, Ordering::SeqCst);
        info!(host = %address, port = port, user = %username, "SSH session authenticated");
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<Arc<dyn RemoteChannel>> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| ExecutorError::transport("session is not connected"))?;

        let channel = handle.channel_open_session().await.map_err(|e| {
            error!(error = %e, "Failed to open SSH channel");
            ExecutorError::Channel(format!("Failed to open SSH channel: {}", e))
        })?;

        Ok(Arc::new(SshChannel::new(channel)))
    }

    async fn close(&self) -> Result<()> {
        self.authenticated.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle
                .disconnect(Disconnect::ByApplication, "Connection closed by client", "en")
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Pending,
    Code(i32),
    /// 通道关闭但未收到退出码
    Lost,
}

/// 泵任务启动前持有的部件
struct PumpParts {
    channel: Channel<Msg>,
    stdout: mpsc::UnboundedSender<Vec<u8>>,
    stderr: mpsc::UnboundedSender<Vec<u8>>,
    exit: watch::Sender<ExitState>,
}

/// 单个流的读取队列，超出 max_bytes 的部分留到下一次读取
struct StreamQueue {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl StreamQueue {
    async fn recv(&mut self, max_bytes: usize) -> Vec<u8> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Vec::new(),
            }
        }
        let take = max_bytes.max(1).min(self.pending.len());
        let rest = self.pending.split_off(take);
        std::mem::replace(&mut self.pending, rest)
    }
}

/// russh 通道适配
pub struct SshChannel {
    parts: parking_lot::Mutex<Option<PumpParts>>,
    stdout: Mutex<StreamQueue>,
    stderr: Mutex<StreamQueue>,
    exit: watch::Receiver<ExitState>,
}

impl SshChannel {
    fn new(channel: Channel<Msg>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(ExitState::Pending);

        Self {
            parts: parking_lot::Mutex::new(Some(PumpParts {
                channel,
                stdout: stdout_tx,
                stderr: stderr_tx,
                exit: exit_tx,
            })),
            stdout: Mutex::new(StreamQueue {
                rx: stdout_rx,
                pending: Vec::new(),
            }),
            stderr: Mutex::new(StreamQueue {
                rx: stderr_rx,
                pending: Vec::new(),
            }),
            exit: exit_rx,
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, command: &str) -> Result<()> {
        let parts = self
            .parts
            .lock()
            .take()
            .ok_or_else(|| ExecutorError::channel("command already executed on this channel"))?;

        parts.channel.exec(true, command).await.map_err(|e| {
            error!(error = %e, "Failed to execute command");
            ExecutorError::Channel(format!("Failed to execute command: {}", e))
        })?;

        tokio::spawn(pump(parts));
        Ok(())
    }

    async fn recv_stdout(&self, max_bytes: usize) -> Result<Vec<u8>> {
        Ok(self.stdout.lock().await.recv(max_bytes).await)
    }

    async fn recv_stderr(&self, max_bytes: usize) -> Result<Vec<u8>> {
        Ok(self.stderr.lock().await.recv(max_bytes).await)
    }

    async fn exit_status(&self) -> Result<i32> {
        let mut exit = self.exit.clone();
        let state = exit
            .wait_for(|state| *state != ExitState::Pending)
            .await
            .map_err(|_| ExecutorError::channel("channel dropped before exit status"))?;

        match *state {
            ExitState::Code(code) => Ok(code),
            _ => Err(ExecutorError::channel("channel closed without exit status")),
        }
    }
}

/// 读取通道消息并分发到 stdout / stderr 队列
async fn pump(parts: PumpParts) {
    let PumpParts {
        mut channel,
        stdout,
        stderr,
        exit,
    } = parts;
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } if !data.is_empty() => {
                if let Some(tx) = &stdout {
                    let _ = tx.send(data.to_vec());
                }
            }
            ChannelMsg::ExtendedData { ref data, ext }
                if ext == EXTENDED_DATA_STDERR && !data.is_empty() =>
            {
                if let Some(tx) = &stderr {
                    let _ = tx.send(data.to_vec());
                }
            }
            ChannelMsg::Eof => {
                stdout.take();
                stderr.take();
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit.send_replace(ExitState::Code(exit_status as i32));
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    drop(stdout);
    drop(stderr);
    exit.send_if_modified(|state| {
        if *state == ExitState::Pending {
            warn!("SSH channel closed without exit status");
            *state = ExitState::Lost;
            true
        } else {
            false
        }
    });
}

/// SSH 客户端主机密钥校验
struct HostKeyChecker {
    verification_mode: HostKeyVerification,
    known_hosts: HashMap<String, String>,
    host: String,
    port: u16,
}

/// 生成主机密钥指纹（base64 公钥的 sha256 hex）
pub fn fingerprint(key_base64: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(key_base64.as_bytes());
    hex::encode(hasher.finalize())
}

/// known hosts 中的主机标识，IPv6 地址加方括号：`[::1]:2222`
pub fn known_host_key(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl HostKeyChecker {
    /// 根据策略判断是否接受指纹
    fn verify(&self, fingerprint: &str) -> bool {
        let host_key = known_host_key(&self.host, self.port);

        match self.verification_mode {
            HostKeyVerification::Disabled => {
                warn!(host = %host_key, "Host key verification DISABLED - accepting all keys");
                true
            }
            HostKeyVerification::Accept | HostKeyVerification::Strict => {
                if let Some(stored) = self.known_hosts.get(&host_key) {
                    if stored == fingerprint {
                        debug!(host = %host_key, "Host key verified");
                        return true;
                    }
                    error!(
                        host = %host_key,
                        expected = %stored,
                        actual = %fingerprint,
                        "Host key mismatch - REJECTING CONNECTION"
                    );
                    return false;
                }

                if self.verification_mode == HostKeyVerification::Strict {
                    error!(host = %host_key, "Unknown host in strict mode - rejecting connection");
                    return false;
                }

                info!(
                    host = %host_key,
                    fingerprint = %fingerprint,
                    "First time connecting - accepting host key"
                );
                true
            }
        }
    }
}

#[async_trait]
impl client::Handler for HostKeyChecker {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = fingerprint(&server_public_key.public_key_base64());
        Ok(self.verify(&fingerprint))
    }
}
