//! 工作窃取调度器
//!
//! 维护一个待领取任务队列和 `worker_id -> ActiveTask` 的活跃表，
//! 启动 N 个工作线程并发下载分片。每 500ms 扫描一次活跃表：
//! 更新各任务的窗口速度；发现空闲线程（自己的任务已完成、队列为空）
//! 且有线程剩余超过 1MB 时，从剩余最多的线程手里窃取后一半区间，
//! 交给空闲线程继续下载。
//!
//! 正确性：受害线程每轮循环都重读 `stop_at`，上界只降不升，普通原子
//! 写即可；窃取者从分割点开始，定位写入保证互不越界。

use anyhow::Result;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloader::chunk::{Task, STEAL_THRESHOLD};
use crate::downloader::output::OutputFile;
use crate::downloader::progress::ProgressState;
use crate::downloader::worker::{self, ActiveTask, WorkerOutcome};

/// 调度器扫描间隔
pub const REBALANCE_INTERVAL: Duration = Duration::from_millis(500);

/// 单个分片的最大重试次数
pub const MAX_TASK_RETRIES: u32 = 3;

/// 调度结束的方式
#[derive(Debug, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// 所有分片写入完毕
    Completed,
    /// 被暂停或取消中断
    Cancelled,
}

/// 调度器共享状态
struct Shared {
    /// 待领取任务队列。领取（出队）与活跃表安装在同一把队列锁内完成，
    /// 因此"队列为空且全部活跃任务完成"的判定不会漏掉在途任务。
    /// 锁序固定为 queue -> active。
    queue: Mutex<VecDeque<Task>>,
    /// 各工作线程当前持有的任务
    active: RwLock<HashMap<usize, Arc<ActiveTask>>>,
    /// 队列有新任务时唤醒空闲线程
    notify: Notify,
    /// 窃取产生的新任务编号
    next_index: AtomicUsize,
    /// 全部工作完成的信号，唤醒停车等待的线程退出
    finished: CancellationToken,
}

impl Shared {
    /// 领取下一个任务并安装进活跃表
    fn claim(&self, worker_id: usize, download_cancel: &CancellationToken) -> Option<Arc<ActiveTask>> {
        let mut queue = self.queue.lock().unwrap();
        let task = queue.pop_front()?;
        let more_pending = !queue.is_empty();

        let active_task = Arc::new(ActiveTask::new(task, download_cancel.child_token()));
        self.active
            .write()
            .unwrap()
            .insert(worker_id, active_task.clone());
        drop(queue);

        // 队列还有剩余时把唤醒接力给下一个等待者
        if more_pending {
            self.notify.notify_one();
        }
        Some(active_task)
    }

    /// 入队一个任务并唤醒一个空闲线程
    fn push(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.notify.notify_one();
    }

    /// 队列为空且所有活跃任务都已完成
    fn all_done(&self) -> bool {
        let queue = self.queue.lock().unwrap();
        queue.is_empty()
            && self
                .active
                .read()
                .unwrap()
                .values()
                .all(|t| t.is_complete())
    }

    /// 工作全部完成时发出结束信号
    fn maybe_finish(&self) {
        if self.all_done() {
            self.finished.cancel();
        }
    }

    /// 周期扫描：更新速度采样，执行工作窃取
    fn rebalance(&self) {
        // 速度采样
        {
            let active = self.active.read().unwrap();
            for task in active.values() {
                let (bytes, elapsed) = task.take_window();
                task.update_speed(bytes, elapsed);
            }
        }

        let mut queue = self.queue.lock().unwrap();
        // 队列里还有未领取的任务时不窃取
        if !queue.is_empty() {
            return;
        }

        let active = self.active.read().unwrap();
        let idle_count = active.values().filter(|t| t.is_complete()).count();
        if idle_count == 0 {
            return;
        }

        // 受害者：剩余字节最多且超过阈值的线程
        let Some(victim) = active
            .values()
            .filter(|t| t.remaining_bytes() > STEAL_THRESHOLD)
            .max_by_key(|t| t.remaining_bytes())
        else {
            return;
        };

        let current = victim.current_offset();
        let old_stop = victim.stop_at();
        let remaining = old_stop.saturating_sub(current);
        let split = remaining / 2;
        if split == 0 {
            return;
        }

        // 受害者保留前一半，后一半作为新任务交给空闲线程
        let new_stop = current + split;
        victim.lower_stop_at(new_stop);

        let stolen = Task::new(
            self.next_index.fetch_add(1, Ordering::SeqCst),
            new_stop,
            old_stop - new_stop,
        );

        info!(
            "工作窃取: 从分片 #{} 窃取 [{}, {}) ({} bytes), 受害者上界 {} -> {}",
            victim.task.index,
            stolen.offset,
            stolen.end(),
            stolen.length,
            old_stop,
            new_stop
        );

        queue.push_back(stolen);
        drop(active);
        drop(queue);
        self.notify.notify_one();
    }

    /// 收集尚未覆盖的字节区间（暂停时保存，供恢复重建计划）
    fn uncovered_ranges(&self) -> Vec<Task> {
        let mut queue = self.queue.lock().unwrap();
        let mut ranges: Vec<Task> = queue.drain(..).collect();
        for task in self.active.read().unwrap().values() {
            if let Some(rest) = task.remaining_task() {
                ranges.push(rest);
            }
        }
        ranges
    }
}

/// 工作窃取调度器
pub struct WorkStealScheduler {
    client: Client,
    url: String,
    state: Arc<ProgressState>,
    output: Arc<OutputFile>,
    worker_count: usize,
    shared: Arc<Shared>,
}

impl WorkStealScheduler {
    /// 创建调度器，任务来自范围规划器或恢复计划
    pub fn new(
        client: Client,
        url: String,
        state: Arc<ProgressState>,
        output: Arc<OutputFile>,
        tasks: Vec<Task>,
        concurrency: usize,
    ) -> Self {
        let worker_count = concurrency.min(tasks.len()).max(1);
        let next_index = tasks.len();

        Self {
            client,
            url,
            state,
            output,
            worker_count,
            shared: Arc::new(Shared {
                queue: Mutex::new(tasks.into()),
                active: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                next_index: AtomicUsize::new(next_index),
                finished: CancellationToken::new(),
            }),
        }
    }

    /// 运行到所有分片完成、出错或被取消
    pub async fn run(self) -> Result<SchedulerOutcome> {
        let cancel = self.state.cancel_token();

        info!(
            "调度器启动: {} 个工作线程, URL={}",
            self.worker_count, self.url
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_count {
            workers.spawn(worker_loop(
                worker_id,
                self.client.clone(),
                self.url.clone(),
                self.state.clone(),
                self.output.clone(),
                self.shared.clone(),
                cancel.clone(),
            ));
        }

        let mut ticker = tokio::time::interval(REBALANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // 第一个 tick 立即返回，先消费掉

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.shared.rebalance();
                    self.shared.maybe_finish();
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        error!("工作线程异常退出: {}", e);
                        self.state.set_error(format!("工作线程异常退出: {}", e));
                        cancel.cancel();
                    }
                }
            }
        }

        // 错误槽位优先：内部失败也会触发取消句柄
        if let Some(err) = self.state.error() {
            anyhow::bail!(err);
        }

        if cancel.is_cancelled() {
            if self.state.is_paused() {
                let ranges = self.shared.uncovered_ranges();
                info!("暂停完成: 保存 {} 个未完成区间供恢复使用", ranges.len());
                self.state.save_resume(|r| {
                    r.ranges = ranges;
                    r.sequential = false;
                });
            }
            return Ok(SchedulerOutcome::Cancelled);
        }

        if !self.shared.all_done() {
            anyhow::bail!("调度器退出时仍有未完成分片");
        }

        info!("调度器结束: 所有分片下载完成");
        Ok(SchedulerOutcome::Completed)
    }
}

/// 工作线程主循环：领取任务 -> 下载 -> 失败重试或等待窃取再领取
async fn worker_loop(
    worker_id: usize,
    client: Client,
    url: String,
    state: Arc<ProgressState>,
    output: Arc<OutputFile>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let Some(active_task) = wait_claim(&shared, worker_id, &cancel).await else {
            break;
        };

        debug!(
            "[工作线程{}] 领取分片 #{}: [{}, {})",
            worker_id,
            active_task.task.index,
            active_task.current_offset(),
            active_task.stop_at()
        );

        state.worker_started();
        let outcome = worker::run_range(&client, &url, &active_task, &output, &state).await;
        state.worker_stopped();

        match outcome {
            WorkerOutcome::Completed => {
                debug!(
                    "[工作线程{}] ✓ 分片 #{} 下载完成",
                    worker_id, active_task.task.index
                );
                shared.maybe_finish();
            }
            WorkerOutcome::Cancelled => break,
            WorkerOutcome::Failed(e) => {
                let Some(mut rest) = active_task.remaining_task() else {
                    // 写满之后才报错（例如连接收尾失败），任务实际已完成
                    shared.maybe_finish();
                    continue;
                };
                rest.retries += 1;
                if rest.retries > MAX_TASK_RETRIES {
                    error!(
                        "[工作线程{}] ✗ 分片 #{} 重试 {} 次后仍失败: {}",
                        worker_id, rest.index, MAX_TASK_RETRIES, e
                    );
                    state.set_error(format!(
                        "分片 #{} 重试 {} 次后仍失败: {}",
                        rest.index, MAX_TASK_RETRIES, e
                    ));
                    cancel.cancel();
                    break;
                }
                warn!(
                    "[工作线程{}] ⚠ 分片 #{} 下载失败，重新入队剩余 {} bytes (重试 {}/{}): {}",
                    worker_id, rest.index, rest.length, rest.retries, MAX_TASK_RETRIES, e
                );
                // 先入队再移除活跃条目：反过来会出现一个"看起来全部完成"
                // 的中间状态，完成判定可能被误触发
                shared.push(rest);
                shared.active.write().unwrap().remove(&worker_id);
            }
        }
    }
}

/// 等待并领取下一个任务；下载结束或被取消时返回 None
async fn wait_claim(
    shared: &Shared,
    worker_id: usize,
    cancel: &CancellationToken,
) -> Option<Arc<ActiveTask>> {
    loop {
        if cancel.is_cancelled() || shared.finished.is_cancelled() {
            return None;
        }
        if let Some(task) = shared.claim(worker_id, cancel) {
            return Some(task);
        }
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = cancel.cancelled() => return None,
            _ = shared.finished.cancelled() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with(tasks: Vec<Task>) -> Shared {
        let next = tasks.len();
        Shared {
            queue: Mutex::new(tasks.into()),
            active: RwLock::new(HashMap::new()),
            notify: Notify::new(),
            next_index: AtomicUsize::new(next),
            finished: CancellationToken::new(),
        }
    }

    fn install(shared: &Shared, worker_id: usize) -> Arc<ActiveTask> {
        shared.claim(worker_id, &CancellationToken::new()).unwrap()
    }

    /// 模拟任务完成：上界压到当前写入位置
    fn finish(task: &ActiveTask) {
        task.lower_stop_at(task.current_offset());
    }

    #[test]
    fn test_claim_installs_into_active_map() {
        let shared = shared_with(vec![Task::new(0, 0, 100), Task::new(1, 100, 100)]);
        let t0 = install(&shared, 0);
        assert_eq!(t0.task.index, 0);
        assert_eq!(shared.active.read().unwrap().len(), 1);
        assert!(!shared.all_done());
    }

    #[test]
    fn test_steal_takes_second_half_of_largest_victim() {
        let shared = shared_with(vec![
            Task::new(0, 0, 4 * 1024 * 1024),
            Task::new(1, 4 * 1024 * 1024, 100),
        ]);
        let victim = install(&shared, 0);
        let idle = install(&shared, 1);

        // 线程 1 完成了自己的小任务，线程 0 还剩 4MB
        finish(&idle);

        shared.rebalance();

        // 受害者上界调低到中点，后一半进入队列
        assert_eq!(victim.stop_at(), 2 * 1024 * 1024);
        let queued = shared.queue.lock().unwrap().pop_front().unwrap();
        assert_eq!(queued.offset, 2 * 1024 * 1024);
        assert_eq!(queued.length, 2 * 1024 * 1024);
        // 窃取任务获得新编号
        assert_eq!(queued.index, 2);
    }

    #[test]
    fn test_no_steal_without_idle_worker() {
        let shared = shared_with(vec![
            Task::new(0, 0, 4 * 1024 * 1024),
            Task::new(1, 4 * 1024 * 1024, 4 * 1024 * 1024),
        ]);
        let a = install(&shared, 0);
        let b = install(&shared, 1);

        shared.rebalance();

        assert_eq!(a.stop_at(), 4 * 1024 * 1024);
        assert_eq!(b.stop_at(), 8 * 1024 * 1024);
        assert!(shared.queue.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_steal_below_threshold() {
        // 剩余不足 1MB 的任务不被窃取
        let shared = shared_with(vec![
            Task::new(0, 0, 512 * 1024),
            Task::new(1, 512 * 1024, 100),
        ]);
        let victim = install(&shared, 0);
        let idle = install(&shared, 1);
        finish(&idle);

        shared.rebalance();

        assert_eq!(victim.stop_at(), 512 * 1024);
        assert!(shared.queue.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_steal_when_queue_has_pending_tasks() {
        let shared = shared_with(vec![
            Task::new(0, 0, 4 * 1024 * 1024),
            Task::new(1, 4 * 1024 * 1024, 1024),
            Task::new(2, 4 * 1024 * 1024 + 1024, 1024),
        ]);
        let victim = install(&shared, 0);
        let idle = install(&shared, 1);
        finish(&idle);

        // 队列里还有任务 #2，空闲线程应该直接领取而不是窃取
        shared.rebalance();
        assert_eq!(victim.stop_at(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_all_done_detection() {
        let shared = shared_with(vec![Task::new(0, 0, 100)]);
        assert!(!shared.all_done());

        let t = install(&shared, 0);
        assert!(!shared.all_done());

        finish(&t);
        assert!(shared.all_done());

        shared.maybe_finish();
        assert!(shared.finished.is_cancelled());
    }

    #[test]
    fn test_uncovered_ranges_collects_queue_and_active() {
        let shared = shared_with(vec![
            Task::new(0, 0, 1000),
            Task::new(1, 1000, 1000),
            Task::new(2, 2000, 1000),
        ]);
        // 线程 0 领取任务 #0 并完成
        let t0 = install(&shared, 0);
        finish(&t0);
        // 线程 1 领取任务 #1，尚未写入任何字节
        let _t1 = install(&shared, 1);

        let ranges = shared.uncovered_ranges();
        // 队列里的任务 #2 + 线程 1 的完整剩余区间
        assert_eq!(ranges.len(), 2);
        assert!(ranges.iter().any(|t| t.offset == 2000 && t.length == 1000));
        assert!(ranges.iter().any(|t| t.offset == 1000 && t.length == 1000));
    }
}
