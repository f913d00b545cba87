//! 连接模型
//! 由 User + Host 派生标识 `username@address:port`，会话句柄在创建时设置且不再改变

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::models::command::CommandInput;
use crate::models::exec_result::ExecResult;
use crate::models::host::Host;
use crate::models::user::User;
use crate::transport::RemoteSession;

/// 连接可调用的执行器操作，在创建连接时注入
#[async_trait]
pub trait ConnectionOps: Send + Sync {
    async fn execute(
        &self,
        connection: &Arc<Connection>,
        command: CommandInput,
    ) -> Result<Arc<ExecResult>>;

    async fn execute_batch(
        &self,
        connection: &Arc<Connection>,
        commands: Vec<CommandInput>,
    ) -> Result<Vec<Arc<ExecResult>>>;

    async fn connect(&self, connection: &Arc<Connection>) -> Result<()>;

    async fn close(&self, connection: &Arc<Connection>) -> Result<()>;
}

#[derive(Default)]
struct ResultQueues {
    /// 已下发但尚未完成，按下发顺序
    incomplete: Vec<Arc<ExecResult>>,
    /// 已完成但调用方尚未取走
    available: Vec<Arc<ExecResult>>,
}

/// 到远程主机的连接
pub struct Connection {
    key: String,
    host: Arc<Host>,
    user: Arc<User>,
    session: Arc<dyn RemoteSession>,
    connected: AtomicBool,
    closed: AtomicBool,
    results: Mutex<ResultQueues>,
    ops: Arc<dyn ConnectionOps>,
}

impl Connection {
    pub(crate) fn new(
        host: Arc<Host>,
        user: Arc<User>,
        session: Arc<dyn RemoteSession>,
        ops: Arc<dyn ConnectionOps>,
    ) -> Self {
        Self {
            key: Self::generate_key(&host, &user),
            host,
            user,
            session,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            results: Mutex::new(ResultQueues::default()),
            ops,
        }
    }

    /// 生成标识：`username@address:port`
    pub fn generate_key(host: &Host, user: &User) -> String {
        format!("{}@{}:{}", user.username(), host.address(), host.port())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 标记关闭，返回之前是否已经关闭
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    /// 未完成结果的快照
    pub fn incomplete_results(&self) -> Vec<Arc<ExecResult>> {
        self.results.lock().incomplete.clone()
    }

    /// 把已完成的结果移到可用列表，返回可用列表快照
    pub fn available_results(&self) -> Vec<Arc<ExecResult>> {
        let mut queues = self.results.lock();
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut queues.incomplete)
            .into_iter()
            .partition(|r| r.result_available());
        queues.incomplete = pending;
        queues.available.extend(done);
        queues.available.clone()
    }

    /// 取走所有可用结果
    pub fn take_available_results(&self) -> Vec<Arc<ExecResult>> {
        self.available_results();
        std::mem::take(&mut self.results.lock().available)
    }

    /// 登记新下发的结果
    ///
    /// 结果可能在登记前就已完成，此时直接放入可用列表
    pub(crate) fn push_incomplete(&self, result: Arc<ExecResult>) {
        let mut queues = self.results.lock();
        if result.result_available() {
            queues.available.push(result);
        } else {
            queues.incomplete.push(result);
        }
    }

    /// 拉取任务完成时回调
    pub(crate) fn mark_available(&self, id: Uuid) {
        let mut queues = self.results.lock();
        if let Some(pos) = queues.incomplete.iter().position(|r| r.id() == id) {
            let result = queues.incomplete.remove(pos);
            queues.available.push(result);
        }
    }

    /// 在此连接上执行命令
    pub async fn execute(
        self: &Arc<Self>,
        command: impl Into<CommandInput> + Send,
    ) -> Result<Arc<ExecResult>> {
        self.ops.execute(self, command.into()).await
    }

    /// 在此连接上批量执行命令
    pub async fn execute_batch<I>(self: &Arc<Self>, commands: I) -> Result<Vec<Arc<ExecResult>>>
    where
        I: IntoIterator + Send,
        I::Item: Into<CommandInput>,
    {
        let commands = commands.into_iter().map(Into::into).collect();
        self.ops.execute_batch(self, commands).await
    }

    /// 重新认证会话
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.ops.connect(self).await
    }

    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.ops.close(self).await
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Connection {}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection {}", self.key)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.results.lock();
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("incomplete", &queues.incomplete.len())
            .field("available", &queues.available.len())
            .finish()
    }
}
