//! 命令模型
//! 命令在下发时才获得时间戳和所属连接，下发是单向转换

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ExecutorError, Result};
use crate::models::connection::Connection;

/// 默认终止信号
pub const SIGTERM: i32 = 15;
/// 强制终止信号
pub const SIGKILL: i32 = 9;

/// 终止命令的能力，由执行器在创建命令时注入
#[async_trait]
pub trait KillCapability: Send + Sync {
    /// 向命令所在连接发送终止指令，返回终止命令自身的退出码
    async fn kill(&self, command: &Command, signal: i32) -> Result<i32>;
}

/// 下发信息，一经设置不可更改
struct Dispatch {
    at: DateTime<Utc>,
    connection: Weak<Connection>,
    connection_key: String,
}

/// 远程命令
pub struct Command {
    text: String,
    /// 独占命令：批量执行时必须等待其完成再下发后续命令
    exclusive: bool,
    dispatch: OnceLock<Dispatch>,
    pid: OnceLock<u32>,
    killer: Option<Arc<dyn KillCapability>>,
}

impl Command {
    /// 创建普通命令（不绑定终止能力）
    pub fn new(text: &str) -> Result<Self> {
        validate_command(text)?;
        Ok(Self {
            text: text.to_string(),
            exclusive: false,
            dispatch: OnceLock::new(),
            pid: OnceLock::new(),
            killer: None,
        })
    }

    /// 创建独占命令
    pub fn exclusive(text: &str) -> Result<Self> {
        let mut command = Self::new(text)?;
        command.exclusive = true;
        Ok(command)
    }

    pub fn with_kill_capability(mut self, killer: Arc<dyn KillCapability>) -> Self {
        self.killer = Some(killer);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatch.get().is_some()
    }

    /// 下发时间，未下发时为 None
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.dispatch.get().map(|d| d.at)
    }

    /// 命令所在连接（连接已被释放时为 None）
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.dispatch.get().and_then(|d| d.connection.upgrade())
    }

    pub fn connection_key(&self) -> Option<&str> {
        self.dispatch.get().map(|d| d.connection_key.as_str())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// 记录远程进程号，只能设置一次，重复设置返回 false
    pub fn set_pid(&self, pid: u32) -> bool {
        self.pid.set(pid).is_ok()
    }

    /// 是否已绑定终止能力
    pub fn can_kill(&self) -> bool {
        self.killer.is_some()
    }

    /// 未下发的副本（文本、独占标志和终止能力相同）
    pub fn fresh_copy(&self) -> Self {
        Self {
            text: self.text.clone(),
            exclusive: self.exclusive,
            dispatch: OnceLock::new(),
            pid: OnceLock::new(),
            killer: self.killer.clone(),
        }
    }

    pub(crate) fn mark_dispatched(&self, connection: &Arc<Connection>) -> Result<DateTime<Utc>> {
        let at = Utc::now();
        self.dispatch
            .set(Dispatch {
                at,
                connection: Arc::downgrade(connection),
                connection_key: connection.key().to_string(),
            })
            .map_err(|_| ExecutorError::CommandAlreadyDispatched(self.text.clone()))?;
        Ok(at)
    }

    /// 生成终止指令文本：`kill -<signal> <pid>`
    pub fn kill_instruction(&self, signal: i32) -> Result<String> {
        let pid = self
            .pid()
            .ok_or_else(|| ExecutorError::MissingProcessId(self.text.clone()))?;
        Ok(format!("kill -{} {}", signal, pid))
    }

    /// 终止命令，返回终止命令的退出码
    pub async fn kill(&self, signal: i32) -> Result<i32> {
        let killer = self
            .killer
            .as_ref()
            .ok_or_else(|| ExecutorError::not_mapped("kill function was not mapped"))?;
        killer.kill(self, signal).await
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("text", &self.text)
            .field("exclusive", &self.exclusive)
            .field("timestamp", &self.timestamp())
            .field("connection", &self.connection_key())
            .field("pid", &self.pid())
            .finish()
    }
}

/// 校验命令文本
pub fn validate_command(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(ExecutorError::invalid_command("command must be a non-empty string"));
    }
    Ok(())
}

/// 执行入口接受的命令：文本或已创建的命令对象
#[derive(Debug, Clone)]
pub enum CommandInput {
    Text(String),
    Command(Arc<Command>),
}

impl CommandInput {
    /// 校验并转换为命令对象；已下发的命令会被拒绝
    pub(crate) fn resolve(self, killer: Option<Arc<dyn KillCapability>>) -> Result<Arc<Command>> {
        match self {
            CommandInput::Text(text) => {
                let command = Command::new(&text)?;
                Ok(Arc::new(match killer {
                    Some(killer) => command.with_kill_capability(killer),
                    None => command,
                }))
            }
            CommandInput::Command(command) => {
                validate_command(command.text())?;
                if command.is_dispatched() {
                    return Err(ExecutorError::CommandAlreadyDispatched(
                        command.text().to_string(),
                    ));
                }
                Ok(command)
            }
        }
    }
}

impl From<&str> for CommandInput {
    fn from(text: &str) -> Self {
        CommandInput::Text(text.to_string())
    }
}

impl From<String> for CommandInput {
    fn from(text: String) -> Self {
        CommandInput::Text(text)
    }
}

impl From<Arc<Command>> for CommandInput {
    fn from(command: Arc<Command>) -> Self {
        CommandInput::Command(command)
    }
}

impl From<Command> for CommandInput {
    fn from(command: Command) -> Self {
        CommandInput::Command(Arc::new(command))
    }
}
