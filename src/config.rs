//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

use crate::error::{ExecutorError, Result};
use crate::executor::ExecSettings;
use crate::fetch::FetchOptions;
use crate::transport::{HostKeyVerification, SshSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// 拉取任务轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单次读取的最大字节数
    pub recv_buffer_size: usize,
    /// 获取连接时是否自动重连
    pub reconnect_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 握手超时（秒）
    pub handshake_timeout_secs: u64,
    /// 主机密钥验证: strict, accept, disabled
    pub host_key_verification: String,
    /// 已知主机指纹文件（每行 `address:port sha256hex`）
    pub known_hosts_file: Option<String>,
    /// 默认用户名
    pub default_username: String,
    /// 默认密码（使用 Secret 包装，防止日志泄露）
    pub default_password: Option<Secret<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty, text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub executor: ExecutionConfig,
    pub ssh: SshConfig,
    pub logging: LoggingConfig,
}

impl ExecutorConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("executor.poll_interval_ms", 10)?
            .set_default("executor.recv_buffer_size", 10485760)?
            .set_default("executor.reconnect_enabled", false)?
            .set_default("ssh.connect_timeout_secs", 10)?
            .set_default("ssh.handshake_timeout_secs", 10)?
            .set_default("ssh.host_key_verification", "accept")?
            .set_default("ssh.default_username", "root")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?;

        // 从环境变量加载配置（前缀为 OPS_）
        settings = settings.add_source(
            Environment::with_prefix("OPS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ExecutorConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.executor.poll_interval_ms == 0 || self.executor.poll_interval_ms > 1000 {
            return Err(ConfigError::Message(
                "poll_interval_ms must be between 1 and 1000".to_string(),
            ));
        }

        if self.executor.recv_buffer_size == 0 {
            return Err(ConfigError::Message(
                "recv_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.ssh.connect_timeout_secs == 0 || self.ssh.handshake_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "SSH timeouts must be greater than 0".to_string(),
            ));
        }

        self.ssh
            .host_key_verification
            .parse::<HostKeyVerification>()
            .map_err(ConfigError::Message)?;

        if self.ssh.default_username.trim().is_empty() {
            return Err(ConfigError::Message(
                "default_username must not be empty".to_string(),
            ));
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "text" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, text",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }
}

impl ExecutionConfig {
    pub fn to_settings(&self) -> ExecSettings {
        ExecSettings {
            fetch: FetchOptions {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                recv_buffer_size: self.recv_buffer_size,
            },
            reconnect_enabled: self.reconnect_enabled,
        }
    }
}

impl SshConfig {
    /// 转换为传输层设置，配置了 known_hosts_file 时读取指纹
    pub fn to_settings(&self) -> Result<SshSettings> {
        let host_key_verification = self
            .host_key_verification
            .parse::<HostKeyVerification>()
            .map_err(ExecutorError::Config)?;

        let known_hosts = match &self.known_hosts_file {
            Some(path) => load_known_hosts(Path::new(path))?,
            None => HashMap::new(),
        };

        Ok(SshSettings {
            connect_timeout_secs: self.connect_timeout_secs,
            handshake_timeout_secs: self.handshake_timeout_secs,
            host_key_verification,
            known_hosts,
        })
    }

    pub fn default_password(&self) -> Option<&str> {
        self.default_password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
    }
}

/// 读取已知主机指纹文件
pub fn load_known_hosts(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ExecutorError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    parse_known_hosts(&content)
}

/// 解析指纹：每行 `address:port fingerprint`，`#` 开头为注释
pub fn parse_known_hosts(content: &str) -> Result<HashMap<String, String>> {
    let mut known_hosts = HashMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(fingerprint), None) if host.contains(':') => {
                known_hosts.insert(host.to_string(), fingerprint.to_lowercase());
            }
            _ => {
                return Err(ExecutorError::Config(format!(
                    "Invalid known hosts entry at line {}",
                    lineno + 1
                )))
            }
        }
    }
    Ok(known_hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "OPS_EXECUTOR__POLL_INTERVAL_MS",
            "OPS_EXECUTOR__RECV_BUFFER_SIZE",
            "OPS_EXECUTOR__RECONNECT_ENABLED",
            "OPS_SSH__HOST_KEY_VERIFICATION",
            "OPS_SSH__DEFAULT_USERNAME",
            "OPS_SSH__DEFAULT_PASSWORD",
            "OPS_SSH__KNOWN_HOSTS_FILE",
            "OPS_LOGGING__LEVEL",
            "OPS_LOGGING__FORMAT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();

        let config = ExecutorConfig::from_env().unwrap();
        assert_eq!(config.executor.poll_interval_ms, 10);
        assert_eq!(config.executor.recv_buffer_size, 10485760);
        assert!(!config.executor.reconnect_enabled);
        assert_eq!(config.ssh.default_username, "root");
        assert!(config.ssh.default_password().is_none());
        assert_eq!(config.logging.level, "info");

        let settings = config.executor.to_settings();
        assert_eq!(settings.fetch.poll_interval, Duration::from_millis(10));
        assert_eq!(settings.fetch, FetchOptions::default());

        let ssh = config.ssh.to_settings().unwrap();
        assert_eq!(ssh.host_key_verification, HostKeyVerification::Accept);
        assert!(ssh.known_hosts.is_empty());
    }

    #[test]
    #[serial]
    fn test_config_from_env_overrides() {
        clear_env();
        std::env::set_var("OPS_EXECUTOR__POLL_INTERVAL_MS", "25");
        std::env::set_var("OPS_EXECUTOR__RECONNECT_ENABLED", "true");
        std::env::set_var("OPS_SSH__DEFAULT_PASSWORD", "s3cret");
        std::env::set_var("OPS_SSH__HOST_KEY_VERIFICATION", "strict");

        let config = ExecutorConfig::from_env().unwrap();
        assert_eq!(config.executor.poll_interval_ms, 25);
        assert!(config.executor.reconnect_enabled);
        assert_eq!(config.ssh.default_password(), Some("s3cret"));
        assert!(!format!("{:?}", config.ssh).contains("s3cret"));
        assert_eq!(
            config.ssh.to_settings().unwrap().host_key_verification,
            HostKeyVerification::Strict
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_validation_invalid_poll_interval() {
        clear_env();
        std::env::set_var("OPS_EXECUTOR__POLL_INTERVAL_MS", "0");

        assert!(ExecutorConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_validation_invalid_host_key_mode() {
        clear_env();
        std::env::set_var("OPS_SSH__HOST_KEY_VERIFICATION", "trust-me");

        assert!(ExecutorConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_validation_invalid_log_level() {
        clear_env();
        std::env::set_var("OPS_LOGGING__LEVEL", "verbose");

        assert!(ExecutorConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn test_parse_known_hosts() {
        let content = "# fleet\n10.0.0.5:22 ABCDEF\n\n[::1]:2222 0123\n";
        let hosts = parse_known_hosts(content).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["10.0.0.5:22"], "abcdef");
        assert_eq!(hosts["[::1]:2222"], "0123");

        // 与连接时生成的查找键一致
        use crate::transport::ssh::known_host_key;
        assert!(hosts.contains_key(&known_host_key("::1", 2222)));
        assert!(hosts.contains_key(&known_host_key("10.0.0.5", 22)));
    }

    #[test]
    fn test_parse_known_hosts_rejects_garbage() {
        assert!(matches!(
            parse_known_hosts("10.0.0.5:22"),
            Err(ExecutorError::Config(_))
        ));
        assert!(parse_known_hosts("host fp extra").is_err());
    }

    #[test]
    fn test_missing_known_hosts_file() {
        let result = load_known_hosts(Path::new("/nonexistent/ops-known-hosts"));
        assert!(matches!(result, Err(ExecutorError::Config(_))));
    }
}
