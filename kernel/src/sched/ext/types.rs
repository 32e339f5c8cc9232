//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! sched_ext 基础类型
//!
//! 对应 Linux 的 include/linux/sched/ext.h 与 kernel/sched/ext.h 中的
//! DSQ ID 编码、入队标志、唤醒标志

use core::fmt;

use bitflags::bitflags;
use serde::Serialize;

/// 进程标识符
///
/// 遵循 Linux 内核的 pid_t 类型
pub type Pid = u32;

/// CPU 编号
pub type CpuId = u32;

/// DSQ 标识符
///
/// 对应 Linux 的 `enum scx_dsq_id_flags` 编码：
/// - bit 63 (`FLAG_BUILTIN`): 内建 DSQ
/// - bit 62 (`FLAG_LOCAL_ON`): 指定 CPU 的本地 DSQ，低 32 位为 CPU 编号
/// - 其他 (bit 63 为 0): 策略创建的自定义 DSQ
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DsqId(u64);

impl DsqId {
    pub const FLAG_BUILTIN: u64 = 1 << 63;
    pub const FLAG_LOCAL_ON: u64 = 1 << 62;
    pub const LOCAL_CPU_MASK: u64 = 0xffff_ffff;

    /// 无效 DSQ（也用作任务 "不在任何 DSQ 中" 的标记）
    pub const INVALID: DsqId = DsqId(Self::FLAG_BUILTIN);
    /// 全局 DSQ，也是 fallback DSQ
    pub const GLOBAL: DsqId = DsqId(Self::FLAG_BUILTIN | 1);
    /// 当前 CPU 的本地 DSQ（在回调上下文中解析）
    pub const LOCAL: DsqId = DsqId(Self::FLAG_BUILTIN | 2);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// 指定 CPU 的本地 DSQ
    pub const fn local_on(cpu: CpuId) -> Self {
        Self(Self::FLAG_BUILTIN | Self::FLAG_LOCAL_ON | cpu as u64)
    }

    /// 自定义 DSQ，带 builtin 位的值不是合法的自定义 ID
    pub const fn custom(id: u64) -> Option<Self> {
        if id & Self::FLAG_BUILTIN != 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub const fn is_builtin(self) -> bool {
        self.0 & Self::FLAG_BUILTIN != 0
    }

    pub const fn is_custom(self) -> bool {
        !self.is_builtin()
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    pub const fn is_local(self) -> bool {
        self.0 == Self::LOCAL.0
    }

    pub const fn is_local_on(self) -> bool {
        self.is_builtin() && self.0 & Self::FLAG_LOCAL_ON != 0
    }

    pub const fn is_global(self) -> bool {
        self.0 == Self::GLOBAL.0
    }

    /// LOCAL_ON DSQ 对应的 CPU
    pub const fn local_cpu(self) -> Option<CpuId> {
        if self.is_local_on() {
            Some((self.0 & Self::LOCAL_CPU_MASK) as CpuId)
        } else {
            None
        }
    }
}

impl fmt::Debug for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cpu) = self.local_cpu() {
            write!(f, "DsqId(LOCAL_ON|{})", cpu)
        } else if self.is_global() {
            f.write_str("DsqId(GLOBAL)")
        } else if self.is_local() {
            f.write_str("DsqId(LOCAL)")
        } else if !self.is_valid() {
            f.write_str("DsqId(INVALID)")
        } else {
            write!(f, "DsqId({:#x})", self.0)
        }
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// DSQ 内的排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsqOrdering {
    /// 按插入顺序
    #[default]
    Fifo,
    /// 按 vtime 升序，vtime 相同时按序列号
    Vtime,
}

bitflags! {
    /// 入队标志
    ///
    /// 对应 Linux 的 `enum scx_enq_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqFlags: u64 {
        /// 任务被唤醒 (ENQUEUE_WAKEUP)
        const WAKEUP    = 1 << 0;
        /// 插入 FIFO 队头而不是队尾
        const HEAD      = 1 << 4;
        /// 插入本地 DSQ 后抢占目标 CPU 的当前任务
        const PREEMPT   = 1 << 32;
        /// 被引擎重新入队（CPU 下线、策略降级等）
        const REENQ     = 1 << 40;
        /// 该 CPU 上的最后一个可运行任务
        const LAST      = 1 << 41;
        /// 内部使用：按 vtime 插入优先树
        const DSQ_PRIQ  = 1 << 57;
    }
}

bitflags! {
    /// 唤醒标志，传给 ops.select_cpu()
    ///
    /// 对应 Linux 的 WF_* (kernel/sched/sched.h)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WakeFlags: u32 {
        const EXEC  = 0x02;
        const FORK  = 0x04;
        const TTWU  = 0x08;
        const SYNC  = 0x10;
    }
}

bitflags! {
    /// 出队标志
    ///
    /// 对应 Linux 的 `enum scx_deq_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeqFlags: u64 {
        /// 任务因睡眠而出队
        const SLEEP = 1 << 0;
    }
}
