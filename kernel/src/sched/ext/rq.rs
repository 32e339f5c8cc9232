//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 每 CPU 运行队列上下文
//!
//! 对应 Linux 的 `struct scx_rq`。不使用全局的 per-CPU 数组，
//! 由宿主为每个 CPU 持有一个实例，并以 `&mut` 传入调度入口。

use super::task::TaskRef;
use super::types::CpuId;

pub struct ScxRq {
    cpu: CpuId,
    /// 当前运行的任务
    pub(crate) curr: Option<TaskRef>,
    /// 上一个运行的任务，作为 ops.dispatch() 的 `prev` 参数
    pub(crate) prev: Option<TaskRef>,
    pub(crate) need_resched: bool,
    /// 上次更新时间片的时刻 (纳秒)
    pub(crate) clock_ns: u64,
}

impl ScxRq {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            curr: None,
            prev: None,
            need_resched: false,
            clock_ns: 0,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn curr(&self) -> Option<&TaskRef> {
        self.curr.as_ref()
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    pub fn is_idle(&self) -> bool {
        self.curr.is_none()
    }
}
