//! 下载进度共享状态
//!
//! `ProgressState` 由下载引擎、分片工作线程和外部报告器共享读写。
//! 所有热点计数器（已下载字节、活跃连接数、暂停/完成标志）均为原子变量，
//! 读取方永远不需要加锁；错误槽位只写一次，先到先得。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::downloader::chunk::Task;

/// 断点恢复信息
///
/// 暂停时由调度器写入（未覆盖的字节区间 + 临时文件路径），
/// 恢复时由引擎读取并据此重建下载计划。
#[derive(Debug, Default, Clone)]
pub struct ResumeState {
    /// 临时文件路径（恢复后继续写入同一文件）
    pub tmp_path: Option<PathBuf>,
    /// 尚未写入的字节区间
    pub ranges: Vec<Task>,
    /// 上一轮是否为单连接顺序下载（顺序下载恢复时从 0 重新开始）
    pub sequential: bool,
    /// 首次探测记录的 ETag，恢复时用于校验资源未变更
    pub etag: Option<String>,
}

/// 单个下载的共享进度状态
///
/// 生命周期从入队开始，直到下载完成或被显式移除。
#[derive(Debug)]
pub struct ProgressState {
    /// 下载 ID
    pub id: String,
    /// 资源 URL
    pub url: String,
    /// 本轮会话的起始时间（设置总大小时重置，用于会话速度计算）
    start_time: Mutex<Instant>,
    /// 所有工作线程累计写入的字节数
    downloaded: AtomicU64,
    /// 资源总大小，-1 表示未知（无 Content-Length）
    total_size: AtomicI64,
    /// 当前活跃的工作线程数
    active_workers: AtomicUsize,
    /// 下载是否已终结（完成或被取消）
    done: AtomicBool,
    /// 是否处于暂停状态
    paused: AtomicBool,
    /// Started 事件是否已发出（每个下载只发一次）
    started: AtomicBool,
    /// 恢复会话时的已下载字节数，报告器据此计算会话速度
    session_start_bytes: AtomicU64,
    /// 错误槽位，只写一次，后续写入被丢弃
    error: Mutex<Option<String>>,
    /// 取消句柄，Pause 和 Cancel 都通过它终止工作线程，恢复时替换为新句柄
    cancel: Mutex<CancellationToken>,
    /// 断点恢复信息
    resume: Mutex<ResumeState>,
}

impl ProgressState {
    /// 创建新的进度状态，总大小未知（探测后再设置）
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            start_time: Mutex::new(Instant::now()),
            downloaded: AtomicU64::new(0),
            total_size: AtomicI64::new(-1),
            active_workers: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            session_start_bytes: AtomicU64::new(0),
            error: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            resume: Mutex::new(ResumeState::default()),
        }
    }

    /// 设置资源总大小并重置会话起始时间
    pub fn set_total_size(&self, total: i64) {
        self.total_size.store(total, Ordering::SeqCst);
        *self.start_time.lock().unwrap() = Instant::now();
    }

    /// 资源总大小，-1 表示未知
    pub fn total_size(&self) -> i64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// 累加已下载字节数
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    /// 已下载字节数
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// 重置已下载字节数
    ///
    /// 仅用于顺序下载的恢复路径：上一轮没有分片信息，只能从 0 重新下载，
    /// 计数归零后完成时 `downloaded == total` 的不变量才成立。
    pub fn reset_downloaded(&self) {
        self.downloaded.store(0, Ordering::SeqCst);
        self.session_start_bytes.store(0, Ordering::SeqCst);
    }

    /// 工作线程上线
    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// 工作线程下线
    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// 当前活跃工作线程数
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// 标记 Started 事件已发出，返回之前是否未发出
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// 标记下载终结
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// 下载是否已终结
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// 是否处于暂停状态
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 写入错误，只有第一个写入者生效
    ///
    /// 返回本次写入是否生效
    pub fn set_error(&self, err: impl Into<String>) -> bool {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err.into());
            true
        } else {
            false
        }
    }

    /// 读取错误槽位
    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// 当前的取消句柄
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// 暂停：置位暂停标志并触发取消句柄
    ///
    /// 工作线程在下一个分块边界停止。调用方可能在所有线程停止前返回。
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancel.lock().unwrap().cancel();
    }

    /// 硬取消：触发取消句柄但不置暂停标志
    pub fn cancel_download(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// 恢复会话：清除暂停标志，重置会话起点，安装新的取消句柄
    pub fn resume_session(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.session_start_bytes
            .store(self.downloaded(), Ordering::SeqCst);
        *self.cancel.lock().unwrap() = CancellationToken::new();
    }

    /// 会话起点的已下载字节数
    pub fn session_start_bytes(&self) -> u64 {
        self.session_start_bytes.load(Ordering::SeqCst)
    }

    /// 保存断点恢复信息
    pub fn save_resume(&self, update: impl FnOnce(&mut ResumeState)) {
        let mut resume = self.resume.lock().unwrap();
        update(&mut resume);
    }

    /// 读取断点恢复信息
    pub fn resume_state(&self) -> ResumeState {
        self.resume.lock().unwrap().clone()
    }

    /// 取走保存的恢复区间（引擎重建计划时调用，避免重复使用）
    pub fn take_resume_ranges(&self) -> Vec<Task> {
        std::mem::take(&mut self.resume.lock().unwrap().ranges)
    }

    /// 获取进度快照，供外部报告器按固定间隔轮询
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            downloaded: self.downloaded(),
            total_size: self.total_size(),
            elapsed: self.start_time.lock().unwrap().elapsed(),
            active_workers: self.active_workers(),
            session_start_bytes: self.session_start_bytes(),
        }
    }
}

/// 进度快照
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total_size: i64,
    pub elapsed: Duration,
    pub active_workers: usize,
    pub session_start_bytes: u64,
}

impl ProgressSnapshot {
    /// 本轮会话的平均速度（字节/秒）
    pub fn session_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        let session_bytes = self.downloaded.saturating_sub(self.session_start_bytes);
        (session_bytes as f64 / secs) as u64
    }
}

/// 默认速度采样窗口
const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(10);

/// 滑动窗口速度计算器
///
/// 报告器每次轮询时把新增字节数作为一个采样加入，窗口外的旧采样被淘汰。
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedCalculator {
    /// 使用指定采样窗口创建
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// 使用默认窗口（10 秒）创建
    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 加入一个字节数采样
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    /// 当前窗口内的平均速度（字节/秒）
    pub fn speed(&mut self) -> u64 {
        let now = Instant::now();
        self.evict(now);
        let Some(&(oldest, _)) = self.samples.front() else {
            return 0;
        };
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let span = (now - oldest).max(Duration::from_millis(500));
        (total as f64 / span.as_secs_f64()) as u64
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now - t > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 格式化文件大小为人类可读格式
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let ps = ProgressState::new("dl-1", "https://example.com/a.bin");
        assert_eq!(ps.id, "dl-1");
        assert_eq!(ps.downloaded(), 0);
        assert_eq!(ps.total_size(), -1);
        assert_eq!(ps.active_workers(), 0);
        assert!(!ps.is_paused());
        assert!(!ps.is_done());
        assert!(ps.error().is_none());
    }

    #[test]
    fn test_downloaded_accumulates() {
        let ps = ProgressState::new("dl-1", "u");
        ps.add_downloaded(100_000);
        ps.add_downloaded(200_000);
        assert_eq!(ps.downloaded(), 300_000);
    }

    #[test]
    fn test_active_workers_counter() {
        let ps = ProgressState::new("dl-1", "u");
        ps.worker_started();
        ps.worker_started();
        assert_eq!(ps.active_workers(), 2);
        ps.worker_stopped();
        assert_eq!(ps.active_workers(), 1);
    }

    #[test]
    fn test_error_slot_first_writer_wins() {
        let ps = ProgressState::new("dl-1", "u");
        assert!(ps.set_error("第一个错误"));
        // 后续写入被丢弃
        assert!(!ps.set_error("第二个错误"));
        assert_eq!(ps.error().as_deref(), Some("第一个错误"));
    }

    #[test]
    fn test_pause_fires_cancel_token() {
        let ps = ProgressState::new("dl-1", "u");
        let token = ps.cancel_token();
        assert!(!token.is_cancelled());

        ps.pause();
        assert!(ps.is_paused());
        assert!(token.is_cancelled());

        // 恢复后旧句柄保持取消状态，新句柄未取消
        ps.resume_session();
        assert!(!ps.is_paused());
        assert!(token.is_cancelled());
        assert!(!ps.cancel_token().is_cancelled());
    }

    #[test]
    fn test_resume_session_resets_session_start() {
        let ps = ProgressState::new("dl-1", "u");
        ps.add_downloaded(500_000);
        assert_eq!(ps.session_start_bytes(), 0);

        ps.pause();
        ps.resume_session();
        assert_eq!(ps.session_start_bytes(), 500_000);
        // downloaded 在暂停恢复过程中不回退
        assert_eq!(ps.downloaded(), 500_000);
    }

    #[test]
    fn test_mark_started_only_once() {
        let ps = ProgressState::new("dl-1", "u");
        assert!(ps.mark_started());
        assert!(!ps.mark_started());
    }

    #[test]
    fn test_set_total_size_resets_start_time() {
        let ps = ProgressState::new("dl-1", "u");
        std::thread::sleep(Duration::from_millis(20));
        ps.set_total_size(5_000_000);
        assert_eq!(ps.total_size(), 5_000_000);
        assert!(ps.snapshot().elapsed < Duration::from_millis(20));
    }

    #[test]
    fn test_snapshot() {
        let ps = ProgressState::new("dl-1", "u");
        ps.set_total_size(1_000_000);
        ps.add_downloaded(500_000);
        ps.worker_started();
        ps.worker_started();

        let snap = ps.snapshot();
        assert_eq!(snap.downloaded, 500_000);
        assert_eq!(snap.total_size, 1_000_000);
        assert_eq!(snap.active_workers, 2);
        assert_eq!(snap.session_start_bytes, 0);
    }

    #[test]
    fn test_resume_ranges_taken_once() {
        let ps = ProgressState::new("dl-1", "u");
        ps.save_resume(|r| {
            r.ranges = vec![Task::new(0, 100, 200)];
            r.sequential = false;
        });
        assert_eq!(ps.take_resume_ranges().len(), 1);
        assert!(ps.take_resume_ranges().is_empty());
    }

    #[test]
    fn test_speed_calculator() {
        let mut calc = SpeedCalculator::with_default_window();
        assert_eq!(calc.speed(), 0);

        calc.add_sample(1024 * 1024);
        // 窗口跨度最小按 0.5 秒计算，速度不会无限大
        assert!(calc.speed() <= 2 * 1024 * 1024);
        assert!(calc.speed() > 0);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
