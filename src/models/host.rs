//! 主机模型
//! 由 address + port 唯一标识

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{ExecutorError, Result};
use crate::models::connection::Connection;

/// 默认主机地址
pub const DEFAULT_ADDRESS: &str = "localhost";
/// 默认 SSH 端口
pub const DEFAULT_PORT: u16 = 22;

/// 远程主机
pub struct Host {
    address: String,
    port: u16,
    key: String,
    /// 引用此主机的连接（反向引用，不持有所有权）
    connections: Mutex<HashMap<String, Weak<Connection>>>,
}

impl Host {
    /// 校验参数并创建主机（不经过池，池化请使用执行器）
    pub(crate) fn new(address: &str, port: u16) -> Result<Self> {
        validate_address(address)?;
        Ok(Self {
            address: address.to_string(),
            port,
            key: Self::generate_key(address, port),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// 生成标识：`address:port`
    pub fn generate_key(address: &str, port: u16) -> String {
        format!("{}:{}", address, port)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 当前引用此主机的连接
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn has_connection(&self, key: &str) -> bool {
        self.connections.lock().contains_key(key)
    }

    pub(crate) fn attach(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .insert(connection.key().to_string(), Arc::downgrade(connection));
    }

    pub(crate) fn detach(&self, key: &str) {
        self.connections.lock().remove(key);
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Host {}", self.key)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

/// 校验主机地址
pub fn validate_address(address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(ExecutorError::InvalidHost("address must be a non-empty string".to_string()));
    }
    Ok(())
}

/// 校验端口范围 [0, 65535]
pub fn validate_port(port: i64) -> Result<u16> {
    u16::try_from(port).map_err(|_| {
        ExecutorError::InvalidPort(format!("{} is outside of range 0-65535", port))
    })
}

/// 解析 `address[:port]` 形式的目标，未给出端口时使用 22
pub fn parse_target(target: &str) -> Result<(String, u16)> {
    let target = target.trim();
    // IPv6 地址需要写成 [addr]:port
    if let Some(rest) = target.strip_prefix('[') {
        let (address, tail) = rest
            .split_once(']')
            .ok_or_else(|| ExecutorError::InvalidHost(format!("unterminated '[' in {}", target)))?;
        validate_address(address)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(ExecutorError::InvalidHost(target.to_string())),
        };
        return Ok((address.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((address, port)) => {
            validate_address(address)?;
            Ok((address.to_string(), parse_port(port)?))
        }
        None => {
            validate_address(target)?;
            Ok((target.to_string(), DEFAULT_PORT))
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    let value: i64 = port
        .trim()
        .parse()
        .map_err(|_| ExecutorError::InvalidPort(format!("'{}' is not an integer", port)))?;
    validate_port(value)
}
