//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 运行时配置
//!
//! 默认值来自 Kernel.toml 生成的 `crate::config`

use crate::config::{
    MAX_CPUS, SCX_CONSUME_MAX_RETRIES, SCX_DSP_MAX_BATCH, SCX_DSP_MAX_LOOPS,
    SCX_DSQ_DEFAULT_ORDERING_VTIME, SCX_SLICE_DFL_NS, SCX_STALL_FAULT_THRESHOLD,
    SCX_WATCHDOG_TIMEOUT_MS,
};

use super::error::{ScxError, ScxResult};
use super::types::DsqOrdering;

/// sched_ext 运行时配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScxConfig {
    /// CPU 数量
    pub nr_cpus: usize,
    /// watchdog 超时 (纳秒)
    pub watchdog_timeout_ns: u64,
    /// 单次 ops.dispatch() 最多插入的任务数
    pub dispatch_max_batch: usize,
    /// 单次 pick_next_task 最多调用 ops.dispatch() 的轮数
    pub dispatch_max_loops: usize,
    /// 认领本地 DSQ 队首任务的最大重试次数
    pub consume_max_retries: usize,
    /// 自定义 DSQ 的默认排序方式
    pub default_ordering: DsqOrdering,
    /// 默认时间片 (纳秒)
    pub slice_dfl_ns: u64,
    /// 单次 watchdog 检查中视为策略整体失效的升级数
    pub stall_fault_threshold: usize,
}

impl Default for ScxConfig {
    fn default() -> Self {
        Self {
            nr_cpus: MAX_CPUS,
            watchdog_timeout_ns: SCX_WATCHDOG_TIMEOUT_MS * 1_000_000,
            dispatch_max_batch: SCX_DSP_MAX_BATCH,
            dispatch_max_loops: SCX_DSP_MAX_LOOPS,
            consume_max_retries: SCX_CONSUME_MAX_RETRIES,
            default_ordering: if SCX_DSQ_DEFAULT_ORDERING_VTIME {
                DsqOrdering::Vtime
            } else {
                DsqOrdering::Fifo
            },
            slice_dfl_ns: SCX_SLICE_DFL_NS,
            stall_fault_threshold: SCX_STALL_FAULT_THRESHOLD,
        }
    }
}

impl ScxConfig {
    pub fn with_nr_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub fn with_watchdog_timeout_ms(mut self, ms: u64) -> Self {
        self.watchdog_timeout_ns = ms.saturating_mul(1_000_000);
        self
    }

    pub fn with_watchdog_timeout_ns(mut self, ns: u64) -> Self {
        self.watchdog_timeout_ns = ns;
        self
    }

    pub fn with_dispatch_max_batch(mut self, batch: usize) -> Self {
        self.dispatch_max_batch = batch;
        self
    }

    pub fn with_dispatch_max_loops(mut self, loops: usize) -> Self {
        self.dispatch_max_loops = loops;
        self
    }

    pub fn with_consume_max_retries(mut self, retries: usize) -> Self {
        self.consume_max_retries = retries;
        self
    }

    pub fn with_default_ordering(mut self, ordering: DsqOrdering) -> Self {
        self.default_ordering = ordering;
        self
    }

    pub fn with_slice_ns(mut self, slice: u64) -> Self {
        self.slice_dfl_ns = slice;
        self
    }

    pub fn with_stall_fault_threshold(mut self, threshold: usize) -> Self {
        self.stall_fault_threshold = threshold;
        self
    }

    /// 检查配置是否合法
    pub fn validate(&self) -> ScxResult<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(ScxError::InvalidArgument);
        }
        if self.dispatch_max_batch == 0 || self.dispatch_max_loops == 0 {
            return Err(ScxError::InvalidArgument);
        }
        if self.watchdog_timeout_ns == 0 || self.slice_dfl_ns == 0 {
            return Err(ScxError::InvalidArgument);
        }
        if self.stall_fault_threshold == 0 {
            return Err(ScxError::InvalidArgument);
        }
        Ok(())
    }

    /// WARNED 阈值：超时的一半
    pub fn watchdog_warn_ns(&self) -> u64 {
        self.watchdog_timeout_ns / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = ScxConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.watchdog_timeout_ns, SCX_WATCHDOG_TIMEOUT_MS * 1_000_000);
        assert_eq!(cfg.watchdog_warn_ns() * 2, cfg.watchdog_timeout_ns);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = ScxConfig::default();
        assert!(base.clone().with_nr_cpus(0).validate().is_err());
        assert!(base.clone().with_nr_cpus(MAX_CPUS + 1).validate().is_err());
        assert!(base.clone().with_dispatch_max_batch(0).validate().is_err());
        assert!(base.clone().with_watchdog_timeout_ms(0).validate().is_err());
        assert!(base.with_nr_cpus(4).with_slice_ns(1).validate().is_ok());
    }
}
