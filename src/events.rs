//! 下载事件定义
//!
//! 核心对外只暴露一条类型化事件流（由界面层、控制服务器等外部协作方
//! 消费）和一小组控制操作。单个下载的事件顺序保证：
//! `Started -> (Progress | Paused | Resumed)* -> (Completed | Error)`，
//! `Completed` 与 `Error` 互斥且都是终态；不同下载之间相互独立。
//!
//! `Progress` 事件不由核心主动推送——外部报告器按固定间隔轮询
//! `ProgressState` 并自行构造，慢消费方因此不会积压无界缓冲。

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::downloader::progress::ProgressState;

/// 事件发送端
pub type EventSender = tokio::sync::mpsc::UnboundedSender<DownloadEvent>;

/// 事件接收端
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<DownloadEvent>;

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败等关键事件
    High = 2,
}

/// 下载事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 探测完成、文件名确定后发出，每个下载恰好一次
    Started {
        id: String,
        url: String,
        filename: String,
        /// 资源总大小，-1 表示未知
        total: i64,
        dest_path: PathBuf,
        /// 进度状态句柄，供外部报告器轮询
        #[serde(skip)]
        state: Option<Arc<ProgressState>>,
    },
    /// 进度快照，由外部报告器轮询构造
    Progress {
        id: String,
        downloaded: u64,
        total: i64,
        speed_bytes_per_sec: u64,
        active_connections: usize,
    },
    /// 下载完成（终态）
    Completed {
        id: String,
        total: u64,
        elapsed_ms: u64,
    },
    /// 下载失败（终态）
    Error { id: String, err: String },
    /// 已暂停，条目保留等待恢复
    Paused { id: String, downloaded: u64 },
    /// 已恢复
    Resumed { id: String },
}

impl DownloadEvent {
    /// 事件所属的下载 ID
    pub fn id(&self) -> &str {
        match self {
            DownloadEvent::Started { id, .. } => id,
            DownloadEvent::Progress { id, .. } => id,
            DownloadEvent::Completed { id, .. } => id,
            DownloadEvent::Error { id, .. } => id,
            DownloadEvent::Paused { id, .. } => id,
            DownloadEvent::Resumed { id } => id,
        }
    }

    /// 事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            DownloadEvent::Started { .. } => "started",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::Completed { .. } => "completed",
            DownloadEvent::Error { .. } => "error",
            DownloadEvent::Paused { .. } => "paused",
            DownloadEvent::Resumed { .. } => "resumed",
        }
    }

    /// 事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            DownloadEvent::Progress { .. } => EventPriority::Low,
            DownloadEvent::Started { .. }
            | DownloadEvent::Paused { .. }
            | DownloadEvent::Resumed { .. } => EventPriority::Medium,
            DownloadEvent::Completed { .. } | DownloadEvent::Error { .. } => EventPriority::High,
        }
    }

    /// 是否为终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed { .. } | DownloadEvent::Error { .. }
        )
    }

    /// 从进度状态构造一个 Progress 快照事件（供外部报告器使用）
    pub fn progress_from(state: &ProgressState) -> Self {
        let snap = state.snapshot();
        DownloadEvent::Progress {
            id: state.id.clone(),
            downloaded: snap.downloaded,
            total: snap.total_size,
            speed_bytes_per_sec: snap.session_speed(),
            active_connections: snap.active_workers,
        }
    }
}
