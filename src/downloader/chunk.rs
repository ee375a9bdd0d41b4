//! 字节区间划分
//!
//! 范围规划器把资源 `[0, total)` 划分为 N 个连续分片任务，
//! 各任务之间无空洞、无重叠。服务器不支持 Range 或总大小未知时
//! 退化为单任务计划，由引擎走单连接顺序下载路径。

use tracing::info;

/// 最大并发分片数
pub const MAX_WORKERS: usize = 16;

/// 工作窃取的最小剩余字节阈值：剩余不足 1MB 的任务不值得再分
pub const STEAL_THRESHOLD: u64 = 1024 * 1024;

/// 分片任务：资源中一段连续的字节区间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// 任务在本次下载中的稳定编号
    pub index: usize,
    /// 起始字节（含）
    pub offset: u64,
    /// 区间长度
    pub length: u64,
    /// 已重试次数
    pub retries: u32,
}

impl Task {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            retries: 0,
        }
    }

    /// 结束字节（不含）
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 下载计划
#[derive(Debug, Clone)]
pub struct Plan {
    /// 分片任务列表，按 offset 升序
    pub tasks: Vec<Task>,
    /// 服务器是否支持 `Accept-Ranges: bytes`
    pub ranges_supported: bool,
    /// 资源总大小，-1 表示未知
    pub total: i64,
}

impl Plan {
    /// 是否走单连接顺序下载路径
    pub fn is_sequential(&self) -> bool {
        !self.ranges_supported || self.total <= 0
    }
}

/// 划分 `[0, total)` 为 N 个连续分片
///
/// - 不支持 Range 或总大小未知：单任务计划，长度允许未知
/// - 否则 N = clamp(请求并发数, 1, 16)，total < N 时继续压缩 N 保证每片至少 1 字节；
///   `chunk = total / N`，最后一片吸收余数使长度之和恰好等于 total
pub fn plan_ranges(total: i64, concurrency: usize, ranges_supported: bool) -> Plan {
    if !ranges_supported || total <= 0 {
        // 退化计划：单任务覆盖整个响应体
        return Plan {
            tasks: vec![Task::new(0, 0, total.max(0) as u64)],
            ranges_supported: false,
            total,
        };
    }

    let total_u = total as u64;
    let mut n = concurrency.clamp(1, MAX_WORKERS) as u64;
    while n > 1 && total_u / n == 0 {
        n -= 1;
    }

    let chunk = total_u / n;
    let mut tasks = Vec::with_capacity(n as usize);
    for i in 0..n {
        let offset = i * chunk;
        let length = if i == n - 1 { total_u - offset } else { chunk };
        tasks.push(Task::new(i as usize, offset, length));
    }

    info!(
        "范围划分完成: 总大小={} bytes, 分片数={}, 每片约 {} bytes",
        total_u,
        tasks.len(),
        chunk
    );

    Plan {
        tasks,
        ranges_supported: true,
        total,
    }
}

/// 由暂停时保存的未完成区间重建计划
///
/// 区间按 offset 排序并重新编号，只覆盖尚未写入的字节。
pub fn plan_resume(mut ranges: Vec<Task>, total: i64) -> Plan {
    ranges.sort_by_key(|t| t.offset);
    for (i, task) in ranges.iter_mut().enumerate() {
        task.index = i;
        task.retries = 0;
    }

    info!("恢复计划重建完成: {} 个未完成区间", ranges.len());

    Plan {
        tasks: ranges,
        ranges_supported: true,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 校验计划恰好划分 [0, total)，无空洞无重叠
    fn audit_partition(plan: &Plan, total: u64) {
        let mut expected_offset = 0u64;
        for (i, task) in plan.tasks.iter().enumerate() {
            assert_eq!(task.index, i);
            assert_eq!(task.offset, expected_offset, "分片 #{} 存在空洞或重叠", i);
            assert!(task.length > 0, "分片 #{} 长度为零", i);
            expected_offset = task.end();
        }
        assert_eq!(expected_offset, total);
    }

    #[test]
    fn test_plan_even_split() {
        let plan = plan_ranges(100, 10, true);
        assert_eq!(plan.tasks.len(), 10);
        assert_eq!(plan.tasks[0].offset, 0);
        assert_eq!(plan.tasks[0].length, 10);
        assert_eq!(plan.tasks[9].offset, 90);
        audit_partition(&plan, 100);
    }

    #[test]
    fn test_plan_last_task_absorbs_remainder() {
        let plan = plan_ranges(105, 10, true);
        assert_eq!(plan.tasks.len(), 10);
        assert_eq!(plan.tasks[9].length, 15);
        audit_partition(&plan, 105);
    }

    #[test]
    fn test_plan_clamps_concurrency() {
        let plan = plan_ranges(1024 * 1024, 64, true);
        assert_eq!(plan.tasks.len(), MAX_WORKERS);
        audit_partition(&plan, 1024 * 1024);

        let plan = plan_ranges(1024, 0, true);
        assert_eq!(plan.tasks.len(), 1);
    }

    #[test]
    fn test_plan_tiny_file_reduces_workers() {
        // total < N 时压缩分片数，保证每片至少 1 字节
        let plan = plan_ranges(3, 8, true);
        assert_eq!(plan.tasks.len(), 3);
        audit_partition(&plan, 3);

        let plan = plan_ranges(1, 8, true);
        assert_eq!(plan.tasks.len(), 1);
        audit_partition(&plan, 1);
    }

    #[test]
    fn test_plan_no_range_support() {
        let plan = plan_ranges(1024, 4, false);
        assert!(plan.is_sequential());
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].offset, 0);
    }

    #[test]
    fn test_plan_unknown_total() {
        let plan = plan_ranges(-1, 4, true);
        assert!(plan.is_sequential());
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].length, 0);
    }

    #[test]
    fn test_plan_resume_sorts_and_reindexes() {
        let ranges = vec![
            Task::new(7, 5000, 1000),
            Task::new(2, 100, 400),
            Task::new(5, 2000, 500),
        ];
        let plan = plan_resume(ranges, 10_000);
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[0].offset, 100);
        assert_eq!(plan.tasks[1].offset, 2000);
        assert_eq!(plan.tasks[2].offset, 5000);
        for (i, t) in plan.tasks.iter().enumerate() {
            assert_eq!(t.index, i);
            assert_eq!(t.retries, 0);
        }
    }

    #[test]
    fn test_task_end() {
        let task = Task::new(0, 100, 50);
        assert_eq!(task.end(), 150);
    }
}
