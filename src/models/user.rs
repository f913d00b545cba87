//! 用户模型
//! 由 username + password 唯一标识，密码使用 Secret 包装防止日志泄露

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, Secret};

use crate::error::{ExecutorError, Result};
use crate::models::connection::Connection;

/// 默认用户名
pub const DEFAULT_USERNAME: &str = "root";

/// 远程认证用户
pub struct User {
    username: String,
    password: Option<Secret<String>>,
    key: String,
    /// 引用此用户的连接（反向引用，不持有所有权）
    connections: Mutex<HashMap<String, Weak<Connection>>>,
}

impl User {
    pub(crate) fn new(username: &str, password: Option<&str>) -> Result<Self> {
        validate_username(username)?;
        Ok(Self {
            username: username.to_string(),
            password: password.map(|p| Secret::new(p.to_string())),
            key: Self::generate_key(username, password),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// 生成标识：`username:password`（无密码视为空字符串）
    pub fn generate_key(username: &str, password: Option<&str>) -> String {
        format!("{}:{}", username, password.unwrap_or_default())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> Option<&Secret<String>> {
        self.password.as_ref()
    }

    pub(crate) fn password_str(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret().as_str())
    }

    /// 标识包含密码，请勿写入日志
    pub fn key(&self) -> &str {
        &self.key
    }

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

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "User {}", self.username)
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

/// 校验用户名
pub fn validate_username(username: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(ExecutorError::InvalidUser("username must be a non-empty string".to_string()));
    }
    Ok(())
}
