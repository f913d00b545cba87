//! 测试公共模块
//! 提供记录调用顺序的伪传输层和执行器构造函数

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ops_executor::error::{ExecutorError, Result};
use ops_executor::fetch::FetchOptions;
use ops_executor::{ExecSettings, Executor, RemoteChannel, RemoteSession, Transport};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// 调用记录，格式 `event[label]:detail`
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    pub fn contains(&self, event: &str) -> bool {
        self.position(event).is_some()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// 单条命令的模拟行为
#[derive(Clone)]
pub struct Behavior {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    /// 读取 stderr 前的延迟
    pub stderr_delay: Duration,
    /// stdout 在闸门放行前不返回数据
    pub gate: Option<Arc<Semaphore>>,
    pub fail_stderr: bool,
    /// 远程执行请求被拒绝
    pub fail_exec: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
            stderr_delay: Duration::ZERO,
            gate: None,
            fail_stderr: false,
            fail_exec: false,
        }
    }
}

impl Behavior {
    pub fn output(stdout: &[&str], stderr: &[&str], exit_code: i32) -> Self {
        Self {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            exit_code,
            ..Default::default()
        }
    }

    /// 返回行为与放行闸门
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }
}

/// 伪传输层
#[derive(Clone, Default)]
pub struct FakeTransport {
    pub log: EventLog,
    scripts: Arc<Mutex<HashMap<String, Behavior>>>,
    sessions: Arc<Mutex<Vec<Arc<FakeSession>>>>,
    /// 被拒绝的密码
    rejected_passwords: Arc<Mutex<Vec<String>>>,
    /// 打开会话前的阻塞延迟
    open_delay: Arc<Mutex<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为命令文本设定行为，未设定的命令把文本回显到 stdout
    pub fn script(&self, command: &str, behavior: Behavior) {
        self.scripts.lock().insert(command.to_string(), behavior);
    }

    pub fn reject_password(&self, password: &str) {
        self.rejected_passwords.lock().push(password.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    /// 创建一个不经过执行器的会话
    pub fn detached_session(&self) -> Arc<FakeSession> {
        Arc::new(FakeSession::new(self.clone()))
    }

    fn behavior(&self, command: &str) -> Behavior {
        self.scripts
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_else(|| Behavior::output(&[format!("{}\n", command).as_str()], &[], 0))
    }
}

impl Transport for FakeTransport {
    fn open_session(&self) -> Result<Arc<dyn RemoteSession>> {
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let session = Arc::new(FakeSession::new(self.clone()));
        self.sessions.lock().push(session.clone());
        self.log.push("open_session".to_string());
        Ok(session)
    }
}

pub struct FakeSession {
    transport: FakeTransport,
    label: Mutex<String>,
    authenticated: AtomicBool,
}

impl FakeSession {
    fn new(transport: FakeTransport) -> Self {
        Self {
            transport,
            label: Mutex::new(String::new()),
            authenticated: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> String {
        self.label.lock().clone()
    }

    /// 模拟会话失去认证
    pub fn drop_authentication(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn connect(
        &self,
        address: &str,
        port: u16,
        username: &str,
        password: Option<&str>,
    ) -> Result<()> {
        let label = format!("{}@{}:{}", username, address, port);
        self.transport.log.push(format!("connect[{}]", label));
        if let Some(password) = password {
            if self.transport.rejected_passwords.lock().iter().any(|p| p == password) {
                return Err(ExecutorError::Authentication(label));
            }
        }
        *self.label.lock() = label;
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<Arc<dyn RemoteChannel>> {
        if !self.is_authenticated() {
            return Err(ExecutorError::transport("session is not connected"));
        }
        Ok(Arc::new(FakeChannel {
            transport: self.transport.clone(),
            label: self.label(),
            state: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.transport.log.push(format!("close[{}]", self.label()));
        self.authenticated.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct ChannelState {
    command: String,
    behavior: Behavior,
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    gate_passed: bool,
}

pub struct FakeChannel {
    transport: FakeTransport,
    label: String,
    state: Mutex<Option<ChannelState>>,
}

impl FakeChannel {
    fn command(&self) -> String {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.command.clone())
            .unwrap_or_default()
    }

    fn log(&self, event: &str) {
        self.transport
            .log
            .push(format!("{}[{}]:{}", event, self.label, self.command()));
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn exec(&self, command: &str) -> Result<()> {
        let behavior = self.transport.behavior(command);
        if behavior.fail_exec {
            self.transport
                .log
                .push(format!("exec_rejected[{}]:{}", self.label, command));
            return Err(ExecutorError::channel("exec request rejected"));
        }
        *self.state.lock() = Some(ChannelState {
            command: command.to_string(),
            stdout: behavior.stdout.iter().map(|s| s.as_bytes().to_vec()).collect(),
            stderr: behavior.stderr.iter().map(|s| s.as_bytes().to_vec()).collect(),
            behavior,
            gate_passed: false,
        });
        self.log("exec");
        Ok(())
    }

    async fn recv_stdout(&self, max_bytes: usize) -> Result<Vec<u8>> {
        let gate = {
            let state = self.state.lock();
            let state = state.as_ref().ok_or_else(|| ExecutorError::channel("not executed"))?;
            if state.gate_passed {
                None
            } else {
                state.behavior.gate.clone()
            }
        };
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ExecutorError::channel("gate closed"))?;
            permit.forget();
        }

        let chunk = {
            let mut state = self.state.lock();
            let state = state.as_mut().ok_or_else(|| ExecutorError::channel("not executed"))?;
            state.gate_passed = true;
            match state.stdout.pop_front() {
                Some(mut chunk) if chunk.len() > max_bytes => {
                    let rest = chunk.split_off(max_bytes);
                    state.stdout.push_front(rest);
                    chunk
                }
                Some(chunk) => chunk,
                None => Vec::new(),
            }
        };
        if chunk.is_empty() {
            self.log("stdout_eof");
        }
        Ok(chunk)
    }

    async fn recv_stderr(&self, _max_bytes: usize) -> Result<Vec<u8>> {
        let (delay, fail) = {
            let state = self.state.lock();
            let state = state.as_ref().ok_or_else(|| ExecutorError::channel("not executed"))?;
            (state.behavior.stderr_delay, state.behavior.fail_stderr)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ExecutorError::channel("stderr reset by peer"));
        }

        let chunk = self
            .state
            .lock()
            .as_mut()
            .and_then(|s| s.stderr.pop_front())
            .unwrap_or_default();
        if chunk.is_empty() {
            self.log("stderr_eof");
        }
        Ok(chunk)
    }

    async fn exit_status(&self) -> Result<i32> {
        self.log("exit_status");
        let code = self
            .state
            .lock()
            .as_ref()
            .map(|s| s.behavior.exit_code)
            .unwrap_or(-1);
        Ok(code)
    }
}

/// 测试用执行器参数：轮询间隔 1ms
pub fn test_settings() -> ExecSettings {
    ExecSettings {
        fetch: FetchOptions {
            poll_interval: Duration::from_millis(1),
            recv_buffer_size: 4096,
        },
        reconnect_enabled: false,
    }
}

pub fn create_test_executor() -> (Executor, FakeTransport) {
    let transport = FakeTransport::new();
    let executor = Executor::new(Arc::new(transport.clone()), test_settings());
    (executor, transport)
}

/// 创建并连接 `root@address:22`
pub async fn connected(
    executor: &Executor,
    address: &str,
) -> Arc<ops_executor::Connection> {
    let host = executor.create_host(address, 22).expect("host");
    let user = executor.create_user("root", Some("secret")).expect("user");
    let connection = executor
        .create_connection(&host, &user)
        .await
        .expect("connection");
    executor.connect(Some(&connection)).await.expect("connect");
    connection
}
