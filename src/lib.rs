//! 远程命令执行库
//! 通过 SSH 在远程主机上执行命令：主机/用户/连接按标识池化，输出由后台任务收集

pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod models;
pub mod pool;
pub mod telemetry;
pub mod transport;

pub use config::ExecutorConfig;
pub use error::{ErrorKind, ExecutorError, Result};
pub use executor::{ExecSettings, ExecutionContext, Executor, WaitTarget};
pub use fetch::{FetchOptions, Resolution};
pub use models::{
    Command, CommandInput, Connection, ExecResult, ExecutionSummary, Host, User, SIGKILL, SIGTERM,
};
pub use pool::IdentityPool;
pub use transport::{RemoteChannel, RemoteSession, Transport};
