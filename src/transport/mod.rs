//! 传输层边界
//! 执行器核心只依赖这里的 trait，具体协议实现（russh）位于 [`ssh`] 子模块
//!
//! 约定：
//! - `recv_stdout` / `recv_stderr` 返回空字节表示该流结束
//! - `exit_status` 可能一直等待到远程进程真正退出

pub mod ssh;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use ssh::{HostKeyVerification, SshSettings, SshTransport};

/// 会话工厂，主机密钥策略等由具体实现自行配置
pub trait Transport: Send + Sync {
    /// 创建一个尚未连接的会话句柄
    fn open_session(&self) -> Result<Arc<dyn RemoteSession>>;
}

/// 一个到远程主机的安全会话
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// 建立连接并认证，失败时返回 Authentication 或 Transport 错误
    async fn connect(
        &self,
        address: &str,
        port: u16,
        username: &str,
        password: Option<&str>,
    ) -> Result<()>;

    /// 会话当前是否处于已认证状态
    fn is_authenticated(&self) -> bool;

    /// 打开一个新的执行通道
    async fn open_channel(&self) -> Result<Arc<dyn RemoteChannel>>;

    /// 释放会话
    async fn close(&self) -> Result<()>;
}

/// 单条命令的执行通道
///
/// stdout 与 stderr 会被两个任务同时读取，实现必须允许并发调用
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn exec(&self, command: &str) -> Result<()>;

    /// 读取最多 `max_bytes` 字节标准输出，空结果表示流结束
    async fn recv_stdout(&self, max_bytes: usize) -> Result<Vec<u8>>;

    /// 读取最多 `max_bytes` 字节标准错误，空结果表示流结束
    async fn recv_stderr(&self, max_bytes: usize) -> Result<Vec<u8>>;

    async fn exit_status(&self) -> Result<i32>;
}

/// 判断两个会话句柄是否为同一个对象
pub(crate) fn same_session(a: &Arc<dyn RemoteSession>, b: &Arc<dyn RemoteSession>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
