//! 执行器
//!
//! 统一入口：管理主机/用户/连接池、当前活动连接，以及单条、批量、全连接广播执行。
//! 池与活动连接都属于执行器实例，不存在进程级全局状态

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::fetch::FetchOptions;
use crate::models::command::{Command, CommandInput, KillCapability};
use crate::models::connection::{Connection, ConnectionOps};
use crate::models::exec_result::ExecResult;
use crate::models::host::{validate_address, Host};
use crate::models::user::{validate_username, User};
use crate::pool::IdentityPool;
use crate::transport::{same_session, RemoteSession, SshTransport, Transport};

/// 执行器运行参数
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecSettings {
    pub fetch: FetchOptions,
    /// 获取连接时若会话已失去认证则自动重连
    pub reconnect_enabled: bool,
}

/// 执行上下文：保存当前活动连接
///
/// 所有省略连接参数的操作都回退到活动连接
#[derive(Debug, Default)]
pub struct ExecutionContext {
    active: Mutex<Option<Arc<Connection>>>,
}

impl ExecutionContext {
    pub fn active(&self) -> Option<Arc<Connection>> {
        self.active.lock().clone()
    }

    /// 设置活动连接，返回之前的值
    pub fn replace(&self, connection: Option<Arc<Connection>>) -> Option<Arc<Connection>> {
        std::mem::replace(&mut *self.active.lock(), connection)
    }

    /// 若活动连接就是给定连接则清空
    fn clear_if(&self, connection: &Arc<Connection>) -> bool {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(current) if Arc::ptr_eq(current, connection) => {
                *active = None;
                true
            }
            _ => false,
        }
    }

    /// 显式连接优先，否则使用活动连接
    fn resolve(&self, connection: Option<&Arc<Connection>>) -> Result<Arc<Connection>> {
        match connection {
            Some(connection) => Ok(connection.clone()),
            None => self.active().ok_or(ExecutorError::NoActiveConnection),
        }
    }
}

struct ExecutorInner {
    transport: Arc<dyn Transport>,
    settings: ExecSettings,
    hosts: IdentityPool<Host>,
    users: IdentityPool<User>,
    connections: IdentityPool<Connection>,
    context: ExecutionContext,
    /// 注入到命令和连接中的能力句柄
    handle: ExecutorHandle,
}

/// 远程命令执行器
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>, settings: ExecSettings) -> Self {
        let inner = Arc::new_cyclic(|weak| ExecutorInner {
            transport,
            settings,
            hosts: IdentityPool::new("hosts"),
            users: IdentityPool::new("users"),
            connections: IdentityPool::new("connections"),
            context: ExecutionContext::default(),
            handle: ExecutorHandle {
                inner: weak.clone(),
            },
        });
        Self { inner }
    }

    /// 按配置创建基于 russh 的执行器
    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        let transport = SshTransport::new(config.ssh.to_settings()?);
        Ok(Self::new(Arc::new(transport), config.executor.to_settings()))
    }

    pub fn settings(&self) -> &ExecSettings {
        &self.inner.settings
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    // ==================== 实体 ====================

    /// 创建或获取主机
    pub fn create_host(&self, address: &str, port: u16) -> Result<Arc<Host>> {
        validate_address(address)?;
        let key = Host::generate_key(address, port);
        self.inner
            .hosts
            .try_get_or_create(&key, || Host::new(address, port))
    }

    /// 创建或获取用户
    pub fn create_user(&self, username: &str, password: Option<&str>) -> Result<Arc<User>> {
        validate_username(username)?;
        let key = User::generate_key(username, password);
        self.inner
            .users
            .try_get_or_create(&key, || User::new(username, password))
    }

    /// 确认实体来自本执行器的池
    fn ensure_pooled(&self, host: &Arc<Host>, user: &Arc<User>) -> Result<()> {
        match self.inner.hosts.get(host.key()) {
            Some(pooled) if Arc::ptr_eq(&pooled, host) => {}
            _ => return Err(ExecutorError::HostNotFound(host.key().to_string())),
        }
        match self.inner.users.get(user.key()) {
            Some(pooled) if Arc::ptr_eq(&pooled, user) => Ok(()),
            _ => Err(ExecutorError::UserNotFound(user.username().to_string())),
        }
    }

    /// 查找或登记连接并建立反向引用
    ///
    /// 查找与登记在连接池的同一次写锁内完成，`open` 只在标识不存在时调用
    fn register_connection<F>(
        &self,
        key: &str,
        host: &Arc<Host>,
        user: &Arc<User>,
        open: F,
    ) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Result<Arc<dyn RemoteSession>>,
    {
        let mut created = false;
        let connection = self.inner.connections.try_get_or_create(key, || {
            let session = open()?;
            let ops: Arc<dyn ConnectionOps> = Arc::new(self.inner.handle.clone());
            created = true;
            Ok(Connection::new(host.clone(), user.clone(), session, ops))
        })?;

        if created {
            host.attach(&connection);
            user.attach(&connection);
            if connection.session().is_authenticated() {
                connection.set_connected(true);
            }
            debug!(connection = %key, "Connection created");
        }
        Ok(connection)
    }

    /// 创建连接（已存在时直接返回）并设为活动连接
    ///
    /// 新连接只打开会话，不做认证，需要再调用 [`connect`](Self::connect)
    #[instrument(skip_all, fields(host = %host.key(), user = %user.username()))]
    pub async fn create_connection(
        &self,
        host: &Arc<Host>,
        user: &Arc<User>,
    ) -> Result<Arc<Connection>> {
        self.ensure_pooled(host, user)?;
        let key = Connection::generate_key(host, user);
        let connection =
            self.register_connection(&key, host, user, || self.inner.transport.open_session())?;

        self.inner.context.replace(Some(connection.clone()));
        Ok(connection)
    }

    /// 使用调用方提供的会话创建连接
    ///
    /// 标识已存在时忽略传入的会话；新标识的会话不能已属于其他连接
    pub async fn create_connection_with_session(
        &self,
        host: &Arc<Host>,
        user: &Arc<User>,
        session: Arc<dyn RemoteSession>,
    ) -> Result<Arc<Connection>> {
        self.ensure_pooled(host, user)?;
        let key = Connection::generate_key(host, user);

        let connection = match self.inner.connections.get(&key) {
            Some(existing) => existing,
            None => {
                if let Some(owner) = self
                    .inner
                    .connections
                    .find(|c| same_session(c.session(), &session))
                {
                    return Err(ExecutorError::InvalidSessionHandle(format!(
                        "session already belongs to {}",
                        owner.key()
                    )));
                }
                self.register_connection(&key, host, user, || Ok(session))?
            }
        };

        self.inner.context.replace(Some(connection.clone()));
        Ok(connection)
    }

    /// 获取已存在的连接并设为活动连接
    pub async fn get_connection(
        &self,
        host: &Arc<Host>,
        user: &Arc<User>,
    ) -> Result<Arc<Connection>> {
        let key = Connection::generate_key(host, user);
        let connection = self
            .inner
            .connections
            .get(&key)
            .ok_or_else(|| ExecutorError::ConnectionNotFound(key.clone()))?;

        if self.inner.settings.reconnect_enabled
            && connection.is_connected()
            && !connection.session().is_authenticated()
        {
            info!(connection = %key, "Session lost authentication, reconnecting");
            self.authenticate(&connection).await?;
        }

        self.inner.context.replace(Some(connection.clone()));
        Ok(connection)
    }

    async fn authenticate(&self, connection: &Arc<Connection>) -> Result<()> {
        let host = connection.host();
        let user = connection.user();
        connection
            .session()
            .connect(host.address(), host.port(), user.username(), user.password_str())
            .await
            .map_err(|e| {
                error!(connection = %connection.key(), error = %e, "Failed to connect");
                e
            })?;
        connection.set_connected(true);
        info!(connection = %connection.key(), "Connection established");
        Ok(())
    }

    /// 认证连接，已连接时跳过
    pub async fn connect(&self, connection: Option<&Arc<Connection>>) -> Result<()> {
        let connection = self.inner.context.resolve(connection)?;
        if connection.is_closed() {
            return Err(ExecutorError::ConnectionClosed(connection.key().to_string()));
        }
        if connection.is_connected() {
            debug!(connection = %connection.key(), "Already connected");
            return Ok(());
        }
        self.authenticate(&connection).await
    }

    /// 关闭连接：解除反向引用、移出连接池并释放会话
    ///
    /// 关闭的是活动连接时清空活动连接，否则活动连接保持不变
    #[instrument(skip_all)]
    pub async fn close_connection(&self, connection: Option<&Arc<Connection>>) -> Result<()> {
        let connection = self.inner.context.resolve(connection)?;
        let key = connection.key().to_string();

        if connection.mark_closed() {
            return Err(ExecutorError::ConnectionClosed(key));
        }

        if self.inner.context.clear_if(&connection) {
            debug!(connection = %key, "Active connection cleared");
        }

        connection.host().detach(&key);
        connection.user().detach(&key);
        if let Some(pooled) = self.inner.connections.get(&key) {
            if Arc::ptr_eq(&pooled, &connection) {
                self.inner.connections.remove(&key);
            }
        }
        connection.set_connected(false);

        if let Err(e) = connection.session().close().await {
            warn!(connection = %key, error = %e, "Session teardown failed");
            return Err(e);
        }
        info!(connection = %key, "Connection closed");
        Ok(())
    }

    // ==================== 命令 ====================

    /// 创建命令并绑定终止能力
    pub fn create_command(&self, text: &str) -> Result<Arc<Command>> {
        Ok(Arc::new(
            Command::new(text)?.with_kill_capability(self.kill_capability()),
        ))
    }

    /// 创建独占命令
    pub fn create_exclusive_command(&self, text: &str) -> Result<Arc<Command>> {
        Ok(Arc::new(
            Command::exclusive(text)?.with_kill_capability(self.kill_capability()),
        ))
    }

    fn kill_capability(&self) -> Arc<dyn KillCapability> {
        Arc::new(self.inner.handle.clone())
    }

    fn resolve_command(&self, input: CommandInput) -> Result<Arc<Command>> {
        input.resolve(Some(self.kill_capability()))
    }

    /// 校验整个批次，任何一项不合法都不会下发
    fn resolve_batch(&self, inputs: Vec<CommandInput>) -> Result<Vec<Arc<Command>>> {
        let commands = inputs
            .into_iter()
            .map(|input| self.resolve_command(input))
            .collect::<Result<Vec<_>>>()?;

        for (i, command) in commands.iter().enumerate() {
            if commands[..i].iter().any(|prev| Arc::ptr_eq(prev, command)) {
                return Err(ExecutorError::CommandAlreadyDispatched(format!(
                    "{} appears twice in batch",
                    command.text()
                )));
            }
        }
        Ok(commands)
    }

    /// 下发前检查连接可用：未关闭且会话已认证
    fn ensure_ready(&self, connection: &Connection) -> Result<()> {
        if connection.is_closed() {
            return Err(ExecutorError::ConnectionClosed(connection.key().to_string()));
        }
        if !connection.session().is_authenticated() {
            return Err(ExecutorError::transport(&format!(
                "{} is not connected",
                connection.key()
            )));
        }
        Ok(())
    }

    /// 下发单条命令：打开通道、执行并启动输出拉取
    async fn dispatch(
        &self,
        command: Arc<Command>,
        connection: &Arc<Connection>,
    ) -> Result<Arc<ExecResult>> {
        self.ensure_ready(connection)?;

        let channel = connection.session().open_channel().await?;
        let start_time = command.mark_dispatched(connection)?;
        debug!(connection = %connection.key(), command = %command.text(), "Dispatching command");
        channel.exec(command.text()).await?;

        let result = ExecResult::start(
            command,
            connection,
            start_time,
            channel,
            self.inner.settings.fetch,
        );
        connection.push_incomplete(result.clone());
        Ok(result)
    }

    /// 按顺序下发批次，独占命令的结果可用后才下发下一条
    ///
    /// 独占命令自身失败不会中断批次，错误留在它的结果对象上
    async fn run_batch(
        &self,
        commands: Vec<Arc<Command>>,
        connection: &Arc<Connection>,
    ) -> Result<Vec<Arc<ExecResult>>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let exclusive = command.is_exclusive();
            let result = match self.dispatch(command, connection).await {
                Ok(result) => result,
                Err(e) => {
                    if !results.is_empty() {
                        warn!(
                            connection = %connection.key(),
                            started = results.len(),
                            error = %e,
                            "Batch aborted after partial dispatch"
                        );
                    }
                    return Err(e);
                }
            };
            if exclusive {
                if let Err(e) = result.wait_for_data().await {
                    warn!(
                        connection = %connection.key(),
                        command = %result.command().text(),
                        error = %e,
                        "Exclusive command failed, continuing batch"
                    );
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    /// 执行命令，立即返回结果对象
    pub async fn execute(
        &self,
        command: impl Into<CommandInput>,
        connection: Option<&Arc<Connection>>,
    ) -> Result<Arc<ExecResult>> {
        let command = self.resolve_command(command.into())?;
        let connection = self.inner.context.resolve(connection)?;
        self.dispatch(command, &connection).await
    }

    /// 执行命令并等待完成
    pub async fn execute_wait(
        &self,
        command: impl Into<CommandInput>,
        connection: Option<&Arc<Connection>>,
    ) -> Result<Arc<ExecResult>> {
        let result = self.execute(command, connection).await?;
        result.wait_for_data().await?;
        Ok(result)
    }

    /// 在同一连接上按顺序执行一批命令
    ///
    /// 只有独占命令会阻塞后续命令的下发
    pub async fn execute_batch<I>(
        &self,
        commands: I,
        connection: Option<&Arc<Connection>>,
    ) -> Result<Vec<Arc<ExecResult>>>
    where
        I: IntoIterator,
        I::Item: Into<CommandInput>,
    {
        let commands = self.resolve_batch(commands.into_iter().map(Into::into).collect())?;
        let connection = self.inner.context.resolve(connection)?;
        self.run_batch(commands, &connection).await
    }

    pub async fn execute_batch_wait<I>(
        &self,
        commands: I,
        connection: Option<&Arc<Connection>>,
    ) -> Result<Vec<Arc<ExecResult>>>
    where
        I: IntoIterator,
        I::Item: Into<CommandInput>,
    {
        let results = self.execute_batch(commands, connection).await?;
        self.wait(&results).await?;
        Ok(results)
    }

    /// 所有连接的快照，任一连接不可用时不下发任何命令
    fn ready_connections(&self) -> Result<Vec<Arc<Connection>>> {
        let connections: Vec<_> = self.inner.connections.iter().collect();
        for connection in &connections {
            self.ensure_ready(connection)?;
        }
        Ok(connections)
    }

    /// 在所有连接上执行同一命令，结果顺序与调用时连接池的迭代顺序一致
    ///
    /// 每个连接下发的是命令的独立副本，传入的命令对象本身不会被下发。
    /// 下发前先检查所有连接；检查通过后某个连接下发失败时，
    /// 之前连接上已启动的命令继续运行，它们的结果仍记录在各自连接的结果列表中
    pub async fn execute_everywhere(
        &self,
        command: impl Into<CommandInput>,
    ) -> Result<Vec<Arc<ExecResult>>> {
        let command = self.resolve_command(command.into())?;
        let connections = self.ready_connections()?;
        let mut results = Vec::with_capacity(connections.len());
        for connection in connections {
            let copy = Arc::new(command.fresh_copy());
            results.push(self.dispatch(copy, &connection).await?);
        }
        Ok(results)
    }

    pub async fn execute_everywhere_wait(
        &self,
        command: impl Into<CommandInput>,
    ) -> Result<Vec<Arc<ExecResult>>> {
        let results = self.execute_everywhere(command).await?;
        self.wait(&results).await?;
        Ok(results)
    }

    /// 在所有连接上执行同一批命令，每个连接一组结果
    ///
    /// 连接检查与失败时的行为同 [`execute_everywhere`](Self::execute_everywhere)
    pub async fn execute_batch_everywhere<I>(
        &self,
        commands: I,
    ) -> Result<Vec<Vec<Arc<ExecResult>>>>
    where
        I: IntoIterator,
        I::Item: Into<CommandInput>,
    {
        let commands = self.resolve_batch(commands.into_iter().map(Into::into).collect())?;
        let connections = self.ready_connections()?;
        let mut results = Vec::with_capacity(connections.len());
        for connection in connections {
            let copies = commands
                .iter()
                .map(|command| Arc::new(command.fresh_copy()))
                .collect();
            results.push(self.run_batch(copies, &connection).await?);
        }
        Ok(results)
    }

    pub async fn execute_batch_everywhere_wait<I>(
        &self,
        commands: I,
    ) -> Result<Vec<Vec<Arc<ExecResult>>>>
    where
        I: IntoIterator,
        I::Item: Into<CommandInput>,
    {
        let results = self.execute_batch_everywhere(commands).await?;
        self.wait(&results).await?;
        Ok(results)
    }

    /// 向命令的远程进程发送信号，返回 kill 命令的退出码
    ///
    /// 执行前后的活动连接保持一致
    pub async fn kill(&self, command: &Command, signal: i32) -> Result<i32> {
        let connection = match command.connection() {
            Some(connection) => connection,
            None => {
                return Err(match command.connection_key() {
                    Some(key) => ExecutorError::ConnectionNotFound(key.to_string()),
                    None => ExecutorError::CommandNotDispatched(command.text().to_string()),
                })
            }
        };
        let instruction = command.kill_instruction(signal)?;

        let previous = self.inner.context.active();
        let outcome = self.execute_kill(&instruction, &connection).await;
        self.inner.context.replace(previous);
        outcome
    }

    async fn execute_kill(&self, instruction: &str, connection: &Arc<Connection>) -> Result<i32> {
        let result = self.execute(instruction, Some(connection)).await?;
        result.wait_for_data().await?;
        result
            .exit_code()
            .ok_or_else(|| ExecutorError::StreamFailed("kill exit status unavailable".to_string()))
    }

    // ==================== 查询与等待 ====================

    pub fn iter_hosts(&self) -> std::vec::IntoIter<Arc<Host>> {
        self.inner.hosts.iter()
    }

    pub fn iter_users(&self) -> std::vec::IntoIter<Arc<User>> {
        self.inner.users.iter()
    }

    pub fn iter_connections(&self) -> std::vec::IntoIter<Arc<Connection>> {
        self.inner.connections.iter()
    }

    /// 等待所有结果完成；全部等待结束后返回遇到的第一个错误
    pub async fn wait<T>(&self, results: &T) -> Result<()>
    where
        T: WaitTarget + ?Sized,
    {
        results.wait_all().await
    }

    pub fn active_connection(&self) -> Option<Arc<Connection>> {
        self.inner.context.active()
    }

    /// 设置活动连接，连接必须属于本执行器且未关闭
    pub fn set_active_connection(&self, connection: &Arc<Connection>) -> Result<()> {
        if connection.is_closed() {
            return Err(ExecutorError::ConnectionClosed(connection.key().to_string()));
        }
        match self.inner.connections.get(connection.key()) {
            Some(pooled) if Arc::ptr_eq(&pooled, connection) => {
                self.inner.context.replace(Some(pooled));
                Ok(())
            }
            _ => Err(ExecutorError::ConnectionNotFound(connection.key().to_string())),
        }
    }

    pub fn clear_active_connection(&self) -> Option<Arc<Connection>> {
        self.inner.context.replace(None)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("settings", &self.inner.settings)
            .field("hosts", &self.inner.hosts)
            .field("users", &self.inner.users)
            .field("connections", &self.inner.connections)
            .finish()
    }
}

/// 可等待的结果集合：单个结果、结果列表或结果列表的列表
#[async_trait]
pub trait WaitTarget: Send + Sync {
    async fn wait_all(&self) -> Result<()>;
}

#[async_trait]
impl WaitTarget for Arc<ExecResult> {
    async fn wait_all(&self) -> Result<()> {
        self.wait_for_data().await
    }
}

#[async_trait]
impl WaitTarget for [Arc<ExecResult>] {
    async fn wait_all(&self) -> Result<()> {
        join_all(self.iter().map(|result| result.wait_for_data()))
            .await
            .into_iter()
            .find_map(|outcome| outcome.err())
            .map_or(Ok(()), Err)
    }
}

#[async_trait]
impl WaitTarget for Vec<Arc<ExecResult>> {
    async fn wait_all(&self) -> Result<()> {
        self.as_slice().wait_all().await
    }
}

#[async_trait]
impl WaitTarget for [Vec<Arc<ExecResult>>] {
    async fn wait_all(&self) -> Result<()> {
        let mut first_error = None;
        for group in self {
            if let Err(e) = group.wait_all().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl WaitTarget for Vec<Vec<Arc<ExecResult>>> {
    async fn wait_all(&self) -> Result<()> {
        self.as_slice().wait_all().await
    }
}

/// 注入到命令与连接中的执行器句柄
///
/// 持有弱引用，执行器被释放后所有操作返回 CapabilityNotMapped
#[derive(Clone)]
struct ExecutorHandle {
    inner: Weak<ExecutorInner>,
}

impl ExecutorHandle {
    fn upgrade(&self, operation: &str) -> Result<Executor> {
        self.inner
            .upgrade()
            .map(|inner| Executor { inner })
            .ok_or_else(|| ExecutorError::not_mapped(&format!("{}: executor dropped", operation)))
    }
}

#[async_trait]
impl KillCapability for ExecutorHandle {
    async fn kill(&self, command: &Command, signal: i32) -> Result<i32> {
        self.upgrade("kill")?.kill(command, signal).await
    }
}

#[async_trait]
impl ConnectionOps for ExecutorHandle {
    async fn execute(
        &self,
        connection: &Arc<Connection>,
        command: CommandInput,
    ) -> Result<Arc<ExecResult>> {
        self.upgrade("execute")?
            .execute(command, Some(connection))
            .await
    }

    async fn execute_batch(
        &self,
        connection: &Arc<Connection>,
        commands: Vec<CommandInput>,
    ) -> Result<Vec<Arc<ExecResult>>> {
        self.upgrade("execute_batch")?
            .execute_batch(commands, Some(connection))
            .await
    }

    async fn connect(&self, connection: &Arc<Connection>) -> Result<()> {
        self.upgrade("connect")?.connect(Some(connection)).await
    }

    async fn close(&self, connection: &Arc<Connection>) -> Result<()> {
        self.upgrade("close")?
            .close_connection(Some(connection))
            .await
    }
}
