//! 下载队列管理器
//!
//! 把下载请求纳入一个有界并发池（默认同时 3 个，XDM 同款限制），
//! 对外提供 Enqueue / Pause / Resume / Cancel / PauseAll 控制面。
//! 注册表由读写锁保护，持锁期间不做任何 I/O；暂停的条目保留在注册表
//! 中等待恢复，完成、失败或硬取消的条目被移除。

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, error, info};

use crate::downloader::engine::{DownloadEngine, DownloadRequest};
use crate::downloader::progress::ProgressState;
use crate::events::{DownloadEvent, EventSender};

/// 默认同时下载数
pub const DEFAULT_MAX_DOWNLOADS: usize = 3;

/// 入队缓冲大小，满了之后入队立刻报错而不是阻塞
pub const QUEUE_BUFFER: usize = 100;

/// 注册表条目
struct ActiveDownload {
    request: DownloadRequest,
    state: Arc<ProgressState>,
    /// 同一条目的引擎执行互斥：暂停后立刻恢复时，新一轮执行要等
    /// 上一轮完全退出（恢复区间保存完毕）才能开始
    run_lock: tokio::sync::Mutex<()>,
}

type Registry = Arc<RwLock<HashMap<String, Arc<ActiveDownload>>>>;

/// 下载队列管理器
pub struct DownloadManager {
    downloads: Registry,
    queue_tx: mpsc::Sender<String>,
    events: EventSender,
}

impl DownloadManager {
    /// 创建管理器并启动准入循环
    ///
    /// 事件通过 `events` 推送给外部消费方（界面层、控制服务器等）。
    pub fn new(max_downloads: usize, events: EventSender) -> Self {
        let engine = DownloadEngine::new();
        let (queue_tx, queue_rx) = mpsc::channel::<String>(QUEUE_BUFFER);
        let downloads: Registry = Arc::new(RwLock::new(HashMap::new()));

        info!("创建下载管理器: 最大同时下载数={}", max_downloads.max(1));

        spawn_admitter(
            engine,
            downloads.clone(),
            events.clone(),
            queue_rx,
            max_downloads.max(1),
        );

        Self {
            downloads,
            queue_tx,
            events,
        }
    }

    /// 入队一个下载请求
    ///
    /// URL 校验同步完成；缓冲满时立刻报错。返回进度状态句柄供外部
    /// 报告器轮询。
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<Arc<ProgressState>> {
        let parsed = reqwest::Url::parse(&request.url)
            .with_context(|| format!("无效的 URL: {}", request.url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("URL scheme 必须是 http 或 https: {}", request.url);
        }

        let id = request.id.clone();
        let state = Arc::new(ProgressState::new(id.clone(), request.url.clone()));

        {
            let mut map = self.downloads.write().await;
            if map.contains_key(&id) {
                anyhow::bail!("下载 {} 已存在", id);
            }
            map.insert(
                id.clone(),
                Arc::new(ActiveDownload {
                    request,
                    state: state.clone(),
                    run_lock: tokio::sync::Mutex::new(()),
                }),
            );
        }

        if self.queue_tx.try_send(id.clone()).is_err() {
            self.downloads.write().await.remove(&id);
            anyhow::bail!("下载队列已满 (容量 {})", QUEUE_BUFFER);
        }

        info!("下载已入队: id={}", id);
        Ok(state)
    }

    /// 暂停指定下载
    ///
    /// 触发取消句柄并发出 `Paused` 事件；条目保留在注册表中等待恢复。
    /// 本方法可能在所有工作线程真正停下之前返回。
    pub async fn pause(&self, id: &str) -> Result<()> {
        let entry = self.get(id).await.context("下载不存在")?;
        if entry.state.is_done() {
            anyhow::bail!("下载已结束，无法暂停");
        }
        if entry.state.is_paused() {
            anyhow::bail!("下载已处于暂停状态");
        }

        entry.state.pause();
        info!("暂停下载: id={}", id);
        let _ = self.events.send(DownloadEvent::Paused {
            id: id.to_string(),
            downloaded: entry.state.downloaded(),
        });
        Ok(())
    }

    /// 恢复暂停的下载
    ///
    /// 重新入队同一份请求；引擎检测到已有下载进度后只规划未写入的区间。
    pub async fn resume(&self, id: &str) -> Result<()> {
        let entry = self.get(id).await.context("下载不存在")?;
        if !entry.state.is_paused() {
            anyhow::bail!("下载未处于暂停状态");
        }

        entry.state.resume_session();
        info!("恢复下载: id={}", id);
        let _ = self.events.send(DownloadEvent::Resumed { id: id.to_string() });

        if self.queue_tx.try_send(id.to_string()).is_err() {
            anyhow::bail!("下载队列已满，恢复失败");
        }
        Ok(())
    }

    /// 硬取消：触发取消句柄并移除注册条目
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let entry = self
            .downloads
            .write()
            .await
            .remove(id)
            .context("下载不存在")?;

        entry.state.cancel_download();
        entry.state.mark_done();

        // 已暂停的条目没有在跑的引擎负责清理，这里代为删除临时文件
        if let Some(tmp) = entry.state.resume_state().tmp_path {
            let _ = std::fs::remove_file(&tmp);
        }

        info!("取消下载: id={}", id);
        Ok(())
    }

    /// 暂停所有未暂停且未结束的下载
    ///
    /// 返回实际暂停的数量。
    pub async fn pause_all(&self) -> usize {
        let entries: Vec<Arc<ActiveDownload>> =
            self.downloads.read().await.values().cloned().collect();

        let mut count = 0;
        for entry in entries {
            if !entry.state.is_paused() && !entry.state.is_done() {
                entry.state.pause();
                let _ = self.events.send(DownloadEvent::Paused {
                    id: entry.request.id.clone(),
                    downloaded: entry.state.downloaded(),
                });
                count += 1;
            }
        }

        info!("已暂停 {} 个下载", count);
        count
    }

    /// 查询进度状态句柄
    pub async fn state(&self, id: &str) -> Option<Arc<ProgressState>> {
        self.get(id).await.map(|e| e.state.clone())
    }

    /// 注册表中的条目数（含暂停中的）
    pub async fn active_count(&self) -> usize {
        self.downloads.read().await.len()
    }

    async fn get(&self, id: &str) -> Option<Arc<ActiveDownload>> {
        self.downloads.read().await.get(id).cloned()
    }
}

/// 准入循环：按序取出排队的下载，受信号量约束并发执行
fn spawn_admitter(
    engine: DownloadEngine,
    downloads: Registry,
    events: EventSender,
    mut queue_rx: mpsc::Receiver<String>,
    max_downloads: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_downloads));

    tokio::spawn(async move {
        while let Some(id) = queue_rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let entry = downloads.read().await.get(&id).cloned();
            let Some(entry) = entry else {
                // 排队期间被取消
                debug!("下载 {} 在排队期间被移除，跳过", id);
                continue;
            };
            if entry.state.is_paused() {
                // 排队期间被暂停，等待 Resume 重新入队
                debug!("下载 {} 在排队期间被暂停，跳过", id);
                continue;
            }

            let engine = engine.clone();
            let events = events.clone();
            let downloads = downloads.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_one(engine, entry, events, downloads).await;
            });
        }
        debug!("准入循环退出");
    });
}

/// 执行单个下载并处理收尾
async fn run_one(
    engine: DownloadEngine,
    entry: Arc<ActiveDownload>,
    events: EventSender,
    downloads: Registry,
) {
    let id = entry.request.id.clone();
    let _run_guard = entry.run_lock.lock().await;

    match engine
        .download(&entry.request, entry.state.clone(), &events)
        .await
    {
        Ok(()) => {
            if entry.state.is_paused() {
                // 暂停：保留注册条目等待恢复
                return;
            }
            // 完成或硬取消：移除注册条目
            downloads.write().await.remove(&id);
        }
        Err(e) => {
            // 第一个错误生效，后写入的被丢弃
            entry.state.set_error(e.to_string());
            let err = entry.state.error().unwrap_or_else(|| e.to_string());
            entry.state.mark_done();
            error!("✗ 下载失败: id={}, 错误: {}", id, err);
            let _ = events.send(DownloadEvent::Error {
                id: id.clone(),
                err,
            });
            downloads.write().await.remove(&id);
        }
    }
}
