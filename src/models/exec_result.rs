//! 执行结果模型
//! 结果对象在命令下发后立即返回，输出由后台拉取任务填充

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::fetch::{FetchHandle, FetchOptions, Resolution, StreamFetchEngine};
use crate::models::command::Command;
use crate::models::connection::Connection;
use crate::transport::RemoteChannel;

/// 单条命令的执行结果
pub struct ExecResult {
    id: Uuid,
    command: Arc<Command>,
    connection: Weak<Connection>,
    connection_key: String,
    start_time: DateTime<Utc>,
    fetch: FetchHandle,
}

impl ExecResult {
    /// 包装已开始执行的通道并启动拉取任务
    pub(crate) fn start(
        command: Arc<Command>,
        connection: &Arc<Connection>,
        start_time: DateTime<Utc>,
        channel: Arc<dyn RemoteChannel>,
        options: FetchOptions,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let weak = Arc::downgrade(connection);
        let hook_target = weak.clone();

        let fetch = StreamFetchEngine::start(
            channel,
            options,
            command.text().to_string(),
            Box::new(move || {
                if let Some(connection) = hook_target.upgrade() {
                    connection.mark_available(id);
                }
            }),
        );

        Arc::new(Self {
            id,
            command,
            connection: weak,
            connection_key: connection.key().to_string(),
            start_time,
            fetch,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    /// 输出是否已全部收集
    pub fn result_available(&self) -> bool {
        self.fetch.state().is_available()
    }

    /// 退出码，未知时为 None
    pub fn exit_code(&self) -> Option<i32> {
        self.fetch.state().exit_code()
    }

    /// 标准输出（按行）；未完成时返回已收到的部分
    pub fn stdout(&self) -> Vec<String> {
        self.fetch.state().stdout()
    }

    pub fn stderr(&self) -> Vec<String> {
        self.fetch.state().stderr()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.fetch.state().stop_time()
    }

    /// 执行耗时
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.stop_time().map(|stop| stop - self.start_time)
    }

    pub fn resolution(&self) -> Resolution {
        self.fetch.resolution()
    }

    /// 等待输出和退出码收集完成
    ///
    /// 已完成时立即返回；拉取失败时每次调用都返回同一个错误
    pub async fn wait_for_data(&self) -> Result<()> {
        self.fetch.wait().await
    }

    /// 可序列化的结果摘要
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            command: self.command.text().to_string(),
            connection: self.connection_key.clone(),
            exit_code: self.exit_code(),
            stdout: self.stdout().join("\n"),
            stderr: self.stderr().join("\n"),
            duration_secs: self
                .duration()
                .map(|d| d.num_milliseconds() as f64 / 1000.0),
        }
    }
}

impl std::fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecResult")
            .field("id", &self.id)
            .field("command", &self.command.text())
            .field("connection", &self.connection_key)
            .field("result_available", &self.result_available())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

/// 执行结果摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub command: String,
    /// 连接标识 `username@address:port`
    pub connection: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// 执行时长（秒）
    pub duration_secs: Option<f64>,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// 获取完整输出（stdout + stderr）
    pub fn full_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
            .trim()
            .to_string()
    }

    /// 获取输出摘要（限制长度）
    pub fn output_summary(&self, max_len: usize) -> String {
        let full = self.full_output();
        if full.len() <= max_len {
            return full;
        }
        let mut end = max_len;
        while !full.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &full[..end])
    }
}
