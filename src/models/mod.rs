//! 领域模型
//! 主机、用户、连接按标识池化；命令与执行结果按每次下发创建

pub mod command;
pub mod connection;
pub mod exec_result;
pub mod host;
pub mod user;

pub use command::{Command, CommandInput, KillCapability, SIGKILL, SIGTERM};
pub use connection::{Connection, ConnectionOps};
pub use exec_result::{ExecResult, ExecutionSummary};
pub use host::Host;
pub use user::User;
