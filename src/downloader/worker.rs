//! 分片工作线程
//!
//! 每个工作线程同一时刻持有一个 `ActiveTask`：从 `current_offset` 发起
//! Range 请求，流式读取响应体并定位写入输出文件，每个数据块边界检查
//! 取消句柄和 `stop_at` 上界。`stop_at` 是只降不升的棘轮——调度器窃取
//! 尾部时用普通原子写调低它，工作线程每轮循环重读即可，无需 CAS。

use anyhow::{Context, Result};
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::downloader::chunk::Task;
use crate::downloader::output::OutputFile;
use crate::downloader::probe;
use crate::downloader::progress::ProgressState;

/// 单个数据块的读取超时，超时视为可重试的瞬时错误
pub const CHUNK_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// 速度指数平滑系数：新采样占 30%
const SPEED_SMOOTHING: f64 = 0.3;

/// 工作线程当前持有的分片任务
///
/// 不变量：`offset ≤ current_offset ≤ stop_at ≤ offset + length`。
#[derive(Debug)]
pub struct ActiveTask {
    /// 原始任务
    pub task: Task,
    /// 下一个待写入的字节位置，单调不减
    current_offset: AtomicU64,
    /// 本线程必须遵守的上界（不含），只会被调度器调低
    stop_at: AtomicU64,
    /// 自上次速度采样以来写入的字节数
    window_bytes: AtomicU64,
    /// 指数平滑后的速度（字节/秒）
    speed: AtomicU64,
    /// 上次速度采样的时间
    window_start: Mutex<Instant>,
    /// 本任务的取消句柄（下载级句柄的子句柄）
    cancel: CancellationToken,
}

impl ActiveTask {
    pub fn new(task: Task, cancel: CancellationToken) -> Self {
        let current = task.offset;
        let stop = task.end();
        Self {
            task,
            current_offset: AtomicU64::new(current),
            stop_at: AtomicU64::new(stop),
            window_bytes: AtomicU64::new(0),
            speed: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            cancel,
        }
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset.load(Ordering::SeqCst)
    }

    pub fn stop_at(&self) -> u64 {
        self.stop_at.load(Ordering::SeqCst)
    }

    /// 调低上界（工作窃取）
    ///
    /// 棘轮只朝一个方向走：尝试调高是调度器的 bug。
    pub fn lower_stop_at(&self, new_stop: u64) {
        debug_assert!(new_stop <= self.stop_at());
        self.stop_at.store(new_stop, Ordering::SeqCst);
    }

    /// 推进写入位置并累计窗口字节
    fn advance(&self, bytes: u64) {
        self.current_offset.fetch_add(bytes, Ordering::SeqCst);
        self.window_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// 剩余字节数
    pub fn remaining_bytes(&self) -> u64 {
        self.stop_at().saturating_sub(self.current_offset())
    }

    /// 任务是否已完成
    pub fn is_complete(&self) -> bool {
        self.current_offset() >= self.stop_at()
    }

    /// 未完成部分对应的新任务（失败重试和暂停恢复时使用）
    pub fn remaining_task(&self) -> Option<Task> {
        let current = self.current_offset();
        let stop = self.stop_at();
        if current >= stop {
            return None;
        }
        Some(Task {
            index: self.task.index,
            offset: current,
            length: stop - current,
            retries: self.task.retries,
        })
    }

    /// 取走窗口字节数并重置采样起点，返回 (字节数, 窗口时长)
    pub fn take_window(&self) -> (u64, Duration) {
        let bytes = self.window_bytes.swap(0, Ordering::SeqCst);
        let mut start = self.window_start.lock().unwrap();
        let elapsed = start.elapsed();
        *start = Instant::now();
        (bytes, elapsed)
    }

    /// 用新窗口采样更新指数平滑速度
    pub fn update_speed(&self, window_bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let instant = window_bytes as f64 / secs;
        let old = self.speed.load(Ordering::SeqCst) as f64;
        let smoothed = if old == 0.0 {
            instant
        } else {
            old * (1.0 - SPEED_SMOOTHING) + instant * SPEED_SMOOTHING
        };
        self.speed.store(smoothed as u64, Ordering::SeqCst);
    }

    /// 平滑后的速度（字节/秒）
    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// 分片下载的结束方式
#[derive(Debug)]
pub enum WorkerOutcome {
    /// 写满 `[current_offset, stop_at)` 后正常结束
    Completed,
    /// 被取消句柄中断（暂停或取消，区别于错误）
    Cancelled,
    /// 出错，剩余区间交由调度器重试
    Failed(anyhow::Error),
}

/// 下载一个分片
///
/// 从 `current_offset`（而非 `offset`）发起请求，恢复续传因此天然成立。
pub async fn run_range(
    client: &Client,
    url: &str,
    active: &ActiveTask,
    output: &OutputFile,
    state: &ProgressState,
) -> WorkerOutcome {
    match stream_range(client, url, active, output, state).await {
        Ok(true) => WorkerOutcome::Completed,
        Ok(false) => WorkerOutcome::Cancelled,
        Err(e) => WorkerOutcome::Failed(e),
    }
}

/// 返回 Ok(true) 表示完成，Ok(false) 表示被取消
async fn stream_range(
    client: &Client,
    url: &str,
    active: &ActiveTask,
    output: &OutputFile,
    state: &ProgressState,
) -> Result<bool> {
    let start = active.current_offset();
    let stop = active.stop_at();
    if start >= stop {
        return Ok(true);
    }

    debug!(
        "分片 #{} 发起 Range 请求: bytes={}-{}",
        active.task.index,
        start,
        stop - 1
    );

    let request = client
        .get(url)
        .header(RANGE, format!("bytes={}-{}", start, stop - 1));
    let mut response = tokio::time::timeout(probe::HEADER_TIMEOUT, request.send())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "分片 #{} 等待响应头超时 ({}s)",
                active.task.index,
                probe::HEADER_TIMEOUT.as_secs()
            )
        })?
        .context("发送 Range 请求失败")?;

    let status = response.status();
    // 覆盖整个资源的任务允许 200，其余情况必须是 206
    let covers_whole =
        active.task.offset == 0 && state.total_size() > 0 && active.task.end() as i64 == state.total_size();
    if status != StatusCode::PARTIAL_CONTENT && !(status == StatusCode::OK && covers_whole) {
        anyhow::bail!("Range 请求返回异常状态码 {} (期望 206)", status);
    }

    loop {
        // 每轮重读 stop_at：调度器可能已把尾部窃取给空闲线程
        let current = active.current_offset();
        let stop = active.stop_at();
        if current >= stop {
            debug!("分片 #{} 到达上界，停止读取", active.task.index);
            return Ok(true);
        }

        let chunk = tokio::select! {
            _ = active.cancel.cancelled() => {
                debug!("分片 #{} 在数据块边界被取消", active.task.index);
                return Ok(false);
            }
            read = tokio::time::timeout(CHUNK_READ_TIMEOUT, response.chunk()) => match read {
                Err(_) => anyhow::bail!("读取数据块超时 ({}s)", CHUNK_READ_TIMEOUT.as_secs()),
                Ok(result) => result.context("读取数据块失败")?,
            },
        };

        let Some(bytes) = chunk else {
            anyhow::bail!(
                "服务器提前结束响应体: 分片 #{} 还差 {} bytes",
                active.task.index,
                stop - current
            );
        };

        // 等待数据期间窃取可能已调低上界，用最新值裁剪，多余的尾部属于其它线程
        let stop = active.stop_at();
        let take = bytes.len().min(stop.saturating_sub(current) as usize);
        if take == 0 {
            continue;
        }
        output.write_all_at(current, &bytes[..take])?;
        active.advance(take as u64);
        state.add_downloaded(take as u64);
    }
}

/// 单连接顺序下载
///
/// 消费探测响应：先写入已读的头部字节，再继续流式读取剩余响应体。
/// 返回写入的总字节数。
pub async fn run_sequential(
    mut response: Response,
    head: &[u8],
    output: &OutputFile,
    state: &ProgressState,
    cancel: &CancellationToken,
) -> Result<Option<u64>> {
    let mut written: u64 = 0;

    if !head.is_empty() {
        output.write_all_at(0, head)?;
        written += head.len() as u64;
        state.add_downloaded(head.len() as u64);
    }

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("单连接下载在数据块边界被取消: 已写入 {} bytes", written);
                return Ok(None);
            }
            read = tokio::time::timeout(CHUNK_READ_TIMEOUT, response.chunk()) => match read {
                Err(_) => anyhow::bail!("读取数据块超时 ({}s)", CHUNK_READ_TIMEOUT.as_secs()),
                Ok(result) => result.context("读取数据块失败")?,
            },
        };

        let Some(bytes) = chunk else {
            return Ok(Some(written));
        };

        output.write_all_at(written, &bytes)?;
        written += bytes.len() as u64;
        state.add_downloaded(bytes.len() as u64);
    }
}
