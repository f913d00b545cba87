//! 统一错误模型
//! 定义执行器所有错误类型及其分类
//!
//! 错误可以跨任务传递（后台拉取任务 -> 所有等待者），因此实现了 Clone

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 输入校验失败（在任何池化或下发之前拒绝）
    Validation,
    /// 按标识查找失败
    Identity,
    /// 对象缺少运行时所需的状态或能力
    State,
    /// 传输层（外部协作者）失败
    Transport,
    /// 配置加载失败
    Config,
}

/// 执行器错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid user: {0}")]
    InvalidUser(String),

    #[error("Invalid session handle: {0}")]
    InvalidSessionHandle(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("No active connection set")]
    NoActiveConnection,

    #[error("Connection already closed: {0}")]
    ConnectionClosed(String),

    #[error("Capability not mapped: {0}")]
    CapabilityNotMapped(String),

    #[error("Command already dispatched: {0}")]
    CommandAlreadyDispatched(String),

    #[error("Command not dispatched yet: {0}")]
    CommandNotDispatched(String),

    #[error("Process id unknown for command: {0}")]
    MissingProcessId(String),

    #[error("SSH authentication failed: {0}")]
    Authentication(String),

    #[error("SSH transport error: {0}")]
    Transport(String),

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("Stream fetch failed: {0}")]
    StreamFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecutorError {
    /// 获取错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::InvalidHost(_)
            | ExecutorError::InvalidPort(_)
            | ExecutorError::InvalidUser(_)
            | ExecutorError::InvalidSessionHandle(_)
            | ExecutorError::InvalidCommand(_) => ErrorKind::Validation,
            ExecutorError::ConnectionNotFound(_)
            | ExecutorError::HostNotFound(_)
            | ExecutorError::UserNotFound(_) => ErrorKind::Identity,
            ExecutorError::NoActiveConnection
            | ExecutorError::ConnectionClosed(_)
            | ExecutorError::CapabilityNotMapped(_)
            | ExecutorError::CommandAlreadyDispatched(_)
            | ExecutorError::CommandNotDispatched(_)
            | ExecutorError::MissingProcessId(_) => ErrorKind::State,
            ExecutorError::Authentication(_)
            | ExecutorError::Transport(_)
            | ExecutorError::Channel(_)
            | ExecutorError::StreamFailed(_) => ErrorKind::Transport,
            ExecutorError::Config(_) => ErrorKind::Config,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Identity | ErrorKind::State => self.to_string(),
            ErrorKind::Transport => match self {
                ExecutorError::Authentication(_) => "SSH authentication failed".to_string(),
                ExecutorError::StreamFailed(_) => "Failed to collect command output".to_string(),
                _ => "SSH connection failed".to_string(),
            },
            ErrorKind::Config => "Configuration error".to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    // 便捷方法
    pub fn invalid_command(msg: &str) -> Self {
        ExecutorError::InvalidCommand(msg.to_string())
    }

    pub fn not_mapped(msg: &str) -> Self {
        ExecutorError::CapabilityNotMapped(msg.to_string())
    }

    pub fn transport(msg: &str) -> Self {
        ExecutorError::Transport(msg.to_string())
    }

    pub fn channel(msg: &str) -> Self {
        ExecutorError::Channel(msg.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for ExecutorError {
    fn from(e: config::ConfigError) -> Self {
        ExecutorError::Config(e.to_string())
    }
}

/// 从 russh::Error 转换
impl From<russh::Error> for ExecutorError {
    fn from(e: russh::Error) -> Self {
        ExecutorError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ExecutorError::InvalidHost("".to_string()).kind(), ErrorKind::Validation);
        assert_eq!(ExecutorError::InvalidPort("70000".to_string()).kind(), ErrorKind::Validation);
        assert_eq!(
            ExecutorError::ConnectionNotFound("root@h:22".to_string()).kind(),
            ErrorKind::Identity
        );
        assert_eq!(ExecutorError::NoActiveConnection.kind(), ErrorKind::State);
        assert_eq!(ExecutorError::not_mapped("kill").kind(), ErrorKind::State);
        assert_eq!(ExecutorError::transport("reset").kind(), ErrorKind::Transport);
        assert_eq!(ExecutorError::Config("bad".to_string()).kind(), ErrorKind::Config);
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = ExecutorError::Authentication("password 'hunter2' rejected".to_string());
        let message = error.user_message();
        assert_eq!(message, "SSH authentication failed");
        assert!(!message.contains("hunter2"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: ExecutorError = config::ConfigError::Message("boom".to_string()).into();
        assert!(matches!(err, ExecutorError::Config(_)));
    }

    #[test]
    fn test_is_validation() {
        assert!(ExecutorError::invalid_command("empty").is_validation());
        assert!(!ExecutorError::NoActiveConnection.is_validation());
    }
}
