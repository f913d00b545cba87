//! 输出拉取引擎
//!
//! 每个执行结果启动三个任务：stdout 读取、stderr 读取和一个监督任务。
//! 两个流必须同时读取，否则远程进程可能因一端缓冲区写满而阻塞。
//! 监督任务按固定间隔轮询两个读取任务是否结束，结束后依次：
//! 标记可用、记录结束时间、发布按行拆分的输出、查询一次退出码、通知等待者。
//! 任一读取任务出错时不再等待另一个流，直接以失败解析

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ExecutorError, Result};
use crate::transport::RemoteChannel;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// 默认单次读取的最大字节数
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// 拉取参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub poll_interval: Duration,
    pub recv_buffer_size: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// 结果的解析状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Completed,
    Failed(ExecutorError),
}

impl Resolution {
    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// 拉取任务与结果共享的状态
#[derive(Debug, Default)]
pub struct FetchState {
    available: AtomicBool,
    stop_time: OnceLock<DateTime<Utc>>,
    stdout: OnceLock<Vec<String>>,
    stderr: OnceLock<Vec<String>>,
    exit_code: OnceLock<i32>,
    /// 运行中累积的原始输出
    stdout_buf: Mutex<Vec<u8>>,
    stderr_buf: Mutex<Vec<u8>>,
}

impl FetchState {
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.stop_time.get().copied()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    /// 标准输出按行拆分；完成前返回目前已收到的部分
    pub fn stdout(&self) -> Vec<String> {
        match self.stdout.get() {
            Some(lines) => lines.clone(),
            None => split_lines(&self.stdout_buf.lock()),
        }
    }

    pub fn stderr(&self) -> Vec<String> {
        match self.stderr.get() {
            Some(lines) => lines.clone(),
            None => split_lines(&self.stderr_buf.lock()),
        }
    }

    fn buffer(&self, stream: Stream) -> &Mutex<Vec<u8>> {
        match stream {
            Stream::Stdout => &self.stdout_buf,
            Stream::Stderr => &self.stderr_buf,
        }
    }

    /// 标记可用并发布最终输出
    fn publish(&self) {
        self.available.store(true, Ordering::SeqCst);
        let _ = self.stop_time.set(Utc::now());
        let _ = self.stdout.set(split_lines(&self.stdout_buf.lock()));
        let _ = self.stderr.set(split_lines(&self.stderr_buf.lock()));
    }
}

fn split_lines(buf: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(buf)
        .lines()
        .map(str::to_string)
        .collect()
}

/// 结果解析时的回调（把结果移到连接的可用列表）
pub type ResolvedHook = Box<dyn FnOnce() + Send + 'static>;

/// 正在运行的拉取任务句柄
#[derive(Debug, Clone)]
pub struct FetchHandle {
    state: Arc<FetchState>,
    resolution: watch::Receiver<Resolution>,
}

impl FetchHandle {
    pub fn state(&self) -> &Arc<FetchState> {
        &self.state
    }

    /// 当前解析状态
    pub fn resolution(&self) -> Resolution {
        self.resolution.borrow().clone()
    }

    /// 等待解析完成；可以被任意多个调用方并发调用
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.resolution.clone();
        let resolution = rx
            .wait_for(|r| !r.is_pending())
            .await
            .map_err(|_| ExecutorError::StreamFailed("fetch supervisor dropped".to_string()))?
            .clone();

        match resolution {
            Resolution::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }
}

/// 输出拉取引擎
pub struct StreamFetchEngine;

impl StreamFetchEngine {
    /// 启动读取与监督任务，立即返回
    ///
    /// 必须在 tokio 运行时中调用
    pub fn start(
        channel: Arc<dyn RemoteChannel>,
        options: FetchOptions,
        label: String,
        on_resolved: ResolvedHook,
    ) -> FetchHandle {
        let state = Arc::new(FetchState::default());
        let (tx, rx) = watch::channel(Resolution::Pending);

        let stdout = tokio::spawn(read_stream(
            channel.clone(),
            state.clone(),
            Stream::Stdout,
            options.recv_buffer_size,
        ));
        let stderr = tokio::spawn(read_stream(
            channel.clone(),
            state.clone(),
            Stream::Stderr,
            options.recv_buffer_size,
        ));

        tokio::spawn(supervise(
            channel,
            state.clone(),
            stdout,
            stderr,
            options.poll_interval,
            label,
            on_resolved,
            tx,
        ));

        FetchHandle {
            state,
            resolution: rx,
        }
    }
}

/// 持续读取单个流直到空读（流结束）
async fn read_stream(
    channel: Arc<dyn RemoteChannel>,
    state: Arc<FetchState>,
    stream: Stream,
    max_bytes: usize,
) -> Result<()> {
    loop {
        let chunk = match stream {
            Stream::Stdout => channel.recv_stdout(max_bytes).await?,
            Stream::Stderr => channel.recv_stderr(max_bytes).await?,
        };
        if chunk.is_empty() {
            return Ok(());
        }
        state.buffer(stream).lock().extend_from_slice(&chunk);
    }
}

fn join_outcome(
    outcome: std::result::Result<Result<()>, tokio::task::JoinError>,
    stream: Stream,
) -> Result<()> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ExecutorError::StreamFailed(format!("{}: {}", stream.name(), e))),
        Err(e) => Err(ExecutorError::StreamFailed(format!(
            "{} reader aborted: {}",
            stream.name(),
            e
        ))),
    }
}

/// 回收已结束的读取任务；未结束时返回 `None`
async fn reap(slot: &mut Option<JoinHandle<Result<()>>>, stream: Stream) -> Option<Result<()>> {
    match slot {
        Some(handle) if handle.is_finished() => {
            let outcome = handle.await;
            *slot = None;
            Some(join_outcome(outcome, stream))
        }
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    channel: Arc<dyn RemoteChannel>,
    state: Arc<FetchState>,
    stdout: JoinHandle<Result<()>>,
    stderr: JoinHandle<Result<()>>,
    poll_interval: Duration,
    label: String,
    on_resolved: ResolvedHook,
    tx: watch::Sender<Resolution>,
) {
    let mut readers = [(Some(stdout), Stream::Stdout), (Some(stderr), Stream::Stderr)];

    // 轮询而不是 join：任一读取任务失败时立即结束，另一个任务被中止
    let drained = loop {
        let mut failure = None;
        for (slot, stream) in readers.iter_mut() {
            if let Some(Err(e)) = reap(slot, *stream).await {
                failure.get_or_insert(e);
            }
        }

        if let Some(e) = failure {
            for (slot, stream) in readers.iter_mut() {
                if let Some(handle) = slot.take() {
                    debug!(command = %label, stream = stream.name(), "Aborting reader");
                    handle.abort();
                }
            }
            break Err(e);
        }
        if readers.iter().all(|(slot, _)| slot.is_none()) {
            break Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    };

    state.publish();

    // 退出码查询可能阻塞到远程进程真正退出，因此放在两个流读完之后
    let resolution = match drained {
        Ok(()) => match channel.exit_status().await {
            Ok(code) => {
                let _ = state.exit_code.set(code);
                debug!(command = %label, exit_code = code, "Command finished");
                Resolution::Completed
            }
            Err(e) => {
                warn!(command = %label, error = %e, "Failed to read exit status");
                Resolution::Failed(e)
            }
        },
        Err(e) => {
            warn!(command = %label, error = %e, "Output collection failed");
            Resolution::Failed(e)
        }
    };

    on_resolved();
    tx.send_replace(resolution);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedChannel {
        stdout: Mutex<VecDeque<Vec<u8>>>,
        stderr: Mutex<VecDeque<Vec<u8>>>,
        fail_stderr: bool,
        exit: i32,
        exit_queries: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedChannel {
        fn new(stdout: &[&str], stderr: &[&str], exit: i32) -> Self {
            Self {
                stdout: Mutex::new(stdout.iter().map(|s| s.as_bytes().to_vec()).collect()),
                stderr: Mutex::new(stderr.iter().map(|s| s.as_bytes().to_vec()).collect()),
                fail_stderr: false,
                exit,
                exit_queries: Default::default(),
            }
        }
    }

    #[async_trait]
    impl RemoteChannel for ScriptedChannel {
        async fn exec(&self, _command: &str) -> Result<()> {
            Ok(())
        }

        async fn recv_stdout(&self, _max_bytes: usize) -> Result<Vec<u8>> {
            Ok(self.stdout.lock().pop_front().unwrap_or_default())
        }

        async fn recv_stderr(&self, _max_bytes: usize) -> Result<Vec<u8>> {
            if self.fail_stderr {
                return Err(ExecutorError::channel("connection reset"));
            }
            Ok(self.stderr.lock().pop_front().unwrap_or_default())
        }

        async fn exit_status(&self) -> Result<i32> {
            self.exit_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.exit)
        }
    }

    fn fast() -> FetchOptions {
        FetchOptions {
            poll_interval: Duration::from_millis(1),
            recv_buffer_size: 1024,
        }
    }

    #[tokio::test]
    async fn test_collects_both_streams() {
        let channel = Arc::new(ScriptedChannel::new(&["line1\nli", "ne2\n"], &["warn\n"], 3));
        let handle = StreamFetchEngine::start(channel.clone(), fast(), "t".into(), Box::new(|| {}));

        handle.wait().await.unwrap();
        let state = handle.state();
        assert!(state.is_available());
        assert_eq!(state.stdout(), vec!["line1", "line2"]);
        assert_eq!(state.stderr(), vec!["warn"]);
        assert_eq!(state.exit_code(), Some(3));
        assert!(state.stop_time().is_some());
        assert_eq!(channel.exit_queries.load(Ordering::SeqCst), 1);
        assert_eq!(handle.resolution(), Resolution::Completed);
    }

    #[tokio::test]
    async fn test_reader_failure_fails_resolution() {
        let mut channel = ScriptedChannel::new(&["partial\n"], &[], 0);
        channel.fail_stderr = true;
        let channel = Arc::new(channel);
        let handle = StreamFetchEngine::start(channel.clone(), fast(), "t".into(), Box::new(|| {}));

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ExecutorError::StreamFailed(_)));
        // 所有等待者得到相同错误
        assert!(handle.wait().await.is_err());
        assert!(handle.state().is_available());
        assert_eq!(handle.state().stdout(), vec!["partial"]);
        assert_eq!(handle.state().exit_code(), None);
        assert_eq!(channel.exit_queries.load(Ordering::SeqCst), 0);
    }

    /// stdout 永不结束，stderr 读取失败
    struct StalledChannel;

    #[async_trait]
    impl RemoteChannel for StalledChannel {
        async fn exec(&self, _command: &str) -> Result<()> {
            Ok(())
        }

        async fn recv_stdout(&self, _max_bytes: usize) -> Result<Vec<u8>> {
            std::future::pending().await
        }

        async fn recv_stderr(&self, _max_bytes: usize) -> Result<Vec<u8>> {
            Err(ExecutorError::channel("connection reset"))
        }

        async fn exit_status(&self) -> Result<i32> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_reader_failure_does_not_wait_for_other_stream() {
        let handle = StreamFetchEngine::start(
            Arc::new(StalledChannel),
            fast(),
            "t".into(),
            Box::new(|| {}),
        );

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("resolution must not hang");
        assert!(matches!(outcome, Err(ExecutorError::StreamFailed(_))));
        assert!(handle.state().is_available());
        assert_eq!(handle.state().exit_code(), None);
    }

    #[tokio::test]
    async fn test_resolves_without_waiters() {
        let channel = Arc::new(ScriptedChannel::new(&["x"], &[], 0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = StreamFetchEngine::start(
            channel,
            fast(),
            "t".into(),
            Box::new(move || {
                let _ = done_tx.send(());
            }),
        );

        done_rx.await.unwrap();
        assert!(handle.state().is_available());
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines(b"a\r\nb\n\nc"), vec!["a", "b", "", "c"]);
        assert!(split_lines(b"").is_empty());
    }
}
