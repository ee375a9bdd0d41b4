//! 下载引擎
//!
//! 单个下载的完整生命周期：探测 -> 解析文件名 -> 规划分片 -> 执行
//! （分片调度或单连接顺序）-> 刷盘 -> 完整性校验 -> 原子重命名 -> 发事件。
//! 任何一步出错都把第一个错误写入进度状态的错误槽位，由队列管理器
//! 统一发出 `Error` 事件。

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::downloader::checksum::{self, ExpectedDigests};
use crate::downloader::chunk::{self, Plan, MAX_WORKERS};
use crate::downloader::filename;
use crate::downloader::output::{self, OutputFile};
use crate::downloader::probe::{self, ProbeHeaders};
use crate::downloader::progress::ProgressState;
use crate::downloader::scheduler::{SchedulerOutcome, WorkStealScheduler};
use crate::downloader::worker;
use crate::events::{DownloadEvent, EventSender};

/// 单个下载的输入参数，入队后不可变
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// 下载 ID
    pub id: String,
    /// 资源 URL
    pub url: String,
    /// 输出路径：文件或目录（目录时拼接解析出的文件名）
    pub output_path: PathBuf,
    /// 请求的并发连接数
    pub concurrency: usize,
    /// 用户提供的期望 MD5
    pub expected_md5: Option<String>,
    /// 用户提供的期望 SHA-256
    pub expected_sha256: Option<String>,
}

/// 执行阶段的结束方式
enum ExecuteOutcome {
    /// 全部字节已写入，`u64` 为实际写入总量
    Done(u64),
    /// 被暂停或取消中断
    Cancelled,
}

/// 下载引擎
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    /// HTTP 客户端，所有下载共享连接池
    client: Client,
}

impl Default for DownloadEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadEngine {
    /// 创建新的下载引擎
    pub fn new() -> Self {
        Self {
            client: probe::build_client(),
        }
    }

    /// 执行一个下载的完整生命周期
    ///
    /// 暂停与硬取消都返回 `Ok(())`（取消不是错误）；出错返回 `Err`，
    /// 由调用方写入错误槽位并发出 `Error` 事件。
    pub async fn download(
        &self,
        request: &DownloadRequest,
        state: Arc<ProgressState>,
        events: &EventSender,
    ) -> Result<()> {
        let cancel = state.cancel_token();
        let prev = state.resume_state();
        let resuming = prev.tmp_path.is_some();

        // 1. 探测
        let probe_result = probe::probe(&self.client, &request.url).await?;
        let headers = probe_result.headers.clone();

        // 恢复时校验资源未变更：ETag 不一致说明已下载的前缀可能失效
        if resuming {
            if let Some(old_etag) = &prev.etag {
                if headers.etag.as_deref() != Some(old_etag.as_str()) {
                    anyhow::bail!(
                        "恢复中止: 资源 ETag 已变更 ({} -> {:?})，已下载数据不可信",
                        old_etag,
                        headers.etag
                    );
                }
            }
        }

        // 2. 解析文件名与路径
        let resolved_name = filename::resolve_filename(
            &probe_result.final_url,
            headers.content_disposition.as_deref(),
            &probe_result.head,
        );
        let dest_path = resolve_dest(&request.output_path, &resolved_name);
        let dest_name = dest_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(filename::DEFAULT_FILENAME)
            .to_string();
        let dest_dir = dest_path.parent().unwrap_or(Path::new("")).to_path_buf();
        let tmp_path = match (&prev.tmp_path, resuming) {
            (Some(p), true) => p.clone(),
            _ => output::temp_path(&dest_dir, &dest_name, &request.id),
        };

        info!(
            "下载准备完成: id={}, 文件名={}, 总大小={}, Range支持={}, 临时文件={:?}",
            request.id, dest_name, headers.total_size, headers.ranges_supported, tmp_path
        );

        state.set_total_size(headers.total_size);
        state.save_resume(|r| {
            r.tmp_path = Some(tmp_path.clone());
            if r.etag.is_none() {
                r.etag = headers.etag.clone();
            }
        });

        // 3. Started 事件恰好发出一次，恢复时不重复
        if state.mark_started() {
            let _ = events.send(DownloadEvent::Started {
                id: request.id.clone(),
                url: request.url.clone(),
                filename: dest_name.clone(),
                total: headers.total_size,
                dest_path: dest_path.clone(),
                state: Some(state.clone()),
            });
        }

        // 4. 规划
        let plan = self.build_plan(request, &state, &headers, resuming, prev.sequential);

        // 暂停恰好落在收尾阶段时可能已无剩余区间，直接进入校验与重命名
        let already_complete = resuming
            && plan.tasks.is_empty()
            && headers.total_size > 0
            && state.downloaded() as i64 >= headers.total_size;

        // 5. 执行
        let outcome = if already_complete {
            ExecuteOutcome::Done(headers.total_size as u64)
        } else if plan.is_sequential() {
            state.save_resume(|r| r.sequential = true);
            let out = OutputFile::create(
                &tmp_path,
                (headers.total_size > 0).then_some(headers.total_size as u64),
            )?;
            if headers.total_size <= 0 {
                out.truncate()?;
            }
            match worker::run_sequential(
                probe_result.response,
                &probe_result.head,
                &out,
                &state,
                &cancel,
            )
            .await?
            {
                Some(written) => {
                    if headers.total_size > 0 && written != headers.total_size as u64 {
                        anyhow::bail!(
                            "响应体长度与 Content-Length 不一致: 实际 {} bytes, 期望 {} bytes",
                            written,
                            headers.total_size
                        );
                    }
                    out.sync()?;
                    ExecuteOutcome::Done(written)
                }
                None => ExecuteOutcome::Cancelled,
            }
        } else {
            // 分片路径不复用探测连接
            drop(probe_result.response);
            state.save_resume(|r| r.sequential = false);

            let out = Arc::new(OutputFile::create(
                &tmp_path,
                Some(headers.total_size as u64),
            )?);
            let scheduler = WorkStealScheduler::new(
                self.client.clone(),
                probe_result.final_url.to_string(),
                state.clone(),
                out.clone(),
                plan.tasks,
                request.concurrency.clamp(1, MAX_WORKERS),
            );
            match scheduler.run().await? {
                SchedulerOutcome::Completed => {
                    out.sync()?;
                    ExecuteOutcome::Done(headers.total_size as u64)
                }
                SchedulerOutcome::Cancelled => ExecuteOutcome::Cancelled,
            }
        };

        let bytes_written = match outcome {
            ExecuteOutcome::Done(n) => n,
            ExecuteOutcome::Cancelled => {
                if state.is_paused() {
                    // 软暂停：保留临时文件和注册信息等待恢复
                    info!(
                        "下载已暂停: id={}, 已下载 {} bytes",
                        request.id,
                        state.downloaded()
                    );
                } else {
                    // 硬取消：清理临时文件
                    info!("下载已取消: id={}", request.id);
                    let _ = std::fs::remove_file(&tmp_path);
                }
                return Ok(());
            }
        };

        // 6. 完整性校验，不匹配删除临时文件
        let digests = ExpectedDigests {
            user_md5: request.expected_md5.clone(),
            user_sha256: request.expected_sha256.clone(),
            server_md5: headers.server_md5.clone(),
            server_sha256: headers.server_sha256.clone(),
        };
        if let Err(e) = checksum::verify_file(&tmp_path, &digests).await {
            warn!("完整性校验失败，删除临时文件: {:?}", tmp_path);
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        // 7. 原子重命名到最终路径
        if let Err(e) = output::promote(&tmp_path, &dest_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).context("移动文件到最终路径失败");
        }

        // 8. Completed 事件
        let elapsed_ms = state.snapshot().elapsed.as_millis() as u64;
        let total_bytes = if headers.total_size > 0 {
            headers.total_size as u64
        } else {
            bytes_written
        };
        if headers.total_size <= 0 {
            state.set_total_size(total_bytes as i64);
        }
        state.mark_done();

        info!(
            "✓ 下载完成: id={}, {} bytes, 耗时 {}ms",
            request.id, total_bytes, elapsed_ms
        );
        let _ = events.send(DownloadEvent::Completed {
            id: request.id.clone(),
            total: total_bytes,
            elapsed_ms,
        });

        Ok(())
    }

    /// 构建下载计划
    ///
    /// 分片恢复只覆盖尚未写入的区间；上一轮是顺序下载、或服务器条件
    /// 发生变化无法续传时，从字节 0 重新开始并清零计数。
    fn build_plan(
        &self,
        request: &DownloadRequest,
        state: &ProgressState,
        headers: &ProbeHeaders,
        resuming: bool,
        prev_sequential: bool,
    ) -> Plan {
        if resuming && !prev_sequential && headers.ranges_supported && headers.total_size > 0 {
            let ranges = state.take_resume_ranges();
            if !ranges.is_empty() {
                return chunk::plan_resume(ranges, headers.total_size);
            }
            if state.downloaded() as i64 >= headers.total_size {
                // 暂停前所有字节都已写入，返回空计划直接收尾
                return Plan {
                    tasks: vec![],
                    ranges_supported: true,
                    total: headers.total_size,
                };
            }
        }

        if state.downloaded() > 0 {
            // 无法按区间续传（顺序下载或服务器条件变化），从头再来
            warn!("无法按区间续传，从字节 0 重新开始: id={}", request.id);
            state.reset_downloaded();
        }
        chunk::plan_ranges(
            headers.total_size,
            request.concurrency,
            headers.ranges_supported,
        )
    }
}

/// 目标路径是目录时拼接解析出的文件名，否则原样作为文件路径
fn resolve_dest(output_path: &Path, filename: &str) -> PathBuf {
    match std::fs::metadata(output_path) {
        Ok(meta) if meta.is_dir() => output_path.join(filename),
        _ => output_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_dest_directory_appends_filename() {
        let dir = TempDir::new().unwrap();
        let dest = resolve_dest(dir.path(), "a.bin");
        assert_eq!(dest, dir.path().join("a.bin"));
    }

    #[test]
    fn test_resolve_dest_file_path_kept() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("explicit-name.dat");
        let dest = resolve_dest(&file_path, "ignored.bin");
        assert_eq!(dest, file_path);
    }

    #[test]
    fn test_engine_is_cloneable() {
        // 引擎共享同一个连接池，管理器按需克隆
        let engine = DownloadEngine::new();
        let _clone = engine.clone();
    }
}
