//! Rux sched_ext 配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// SMP 配置
// ============================================================

/// 最大CPU数量
pub const MAX_CPUS: usize = 64;

// ============================================================
// sched_ext 配置
// ============================================================

/// 默认时间片 (纳秒)
pub const SCX_SLICE_DFL_NS: u64 = 20000000;

/// watchdog 超时 (毫秒)
pub const SCX_WATCHDOG_TIMEOUT_MS: u64 = 30000;

/// 单次 ops.dispatch() 最大插入任务数
pub const SCX_DSP_MAX_BATCH: usize = 32;

/// 单次 pick_next_task 最多调用 ops.dispatch() 的轮数
pub const SCX_DSP_MAX_LOOPS: usize = 32;

/// 认领队首任务的最大重试次数
pub const SCX_CONSUME_MAX_RETRIES: usize = 8;

/// 单次 watchdog 检查中触发策略整体失效的升级任务数
pub const SCX_STALL_FAULT_THRESHOLD: usize = 8;

/// 自定义 DSQ 是否默认按 vtime 排序
pub const SCX_DSQ_DEFAULT_ORDERING_VTIME: bool = false;
