//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 任务调度状态机
//!
//! 对应 Linux 的 `p->scx.ops_state` (atomic_long_t)：低位存状态，高位存代数。
//! 每次状态迁移必须提供之前观察到的 (state, generation)，CAS 失败说明已有
//! 并发迁移发生，调用者重试或放弃。这样不需要全局调度锁也能禁止重复派发
//! 和重复入队。
//!
//! 状态迁移：
//!
//! ```text
//! NONE -> QUEUEING -> QUEUED -> DISPATCHING -> RUNNING -> STOPPING -> QUIESCENT -> NONE
//!
//! QUEUED -> QUEUED            DSQ 之间整体迁移 (move_all)
//! QUEUED -> QUEUEING          出队 / 策略 remove
//! DISPATCHING -> QUEUED       移入本地 DSQ
//! STOPPING -> QUEUEING        仍可运行，重新入队
//! QUIESCENT -> QUEUEING       被唤醒
//! QUEUEING -> QUIESCENT       出队后进入睡眠
//! NONE -> QUIESCENT           以阻塞状态接入
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::error::{ScxError, ScxResult};

/// 任务调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ScxTaskState {
    /// 不受本引擎管理（初始/终止状态）
    None = 0,
    /// ops.enqueue() 进行中，尚未链入任何 DSQ
    Queueing = 1,
    /// 已链入某个 DSQ
    Queued = 2,
    /// 正在被移动到 CPU 上（瞬态）
    Dispatching = 3,
    /// 正在某个 CPU 上运行
    Running = 4,
    /// 被抢占或让出，即将重新入队或进入 QUIESCENT
    Stopping = 5,
    /// 阻塞，不可运行
    Quiescent = 6,
}

impl ScxTaskState {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => ScxTaskState::Queueing,
            2 => ScxTaskState::Queued,
            3 => ScxTaskState::Dispatching,
            4 => ScxTaskState::Running,
            5 => ScxTaskState::Stopping,
            6 => ScxTaskState::Quiescent,
            _ => ScxTaskState::None,
        }
    }

    /// 状态迁移表
    pub const fn can_transition_to(self, to: ScxTaskState) -> bool {
        use ScxTaskState::*;
        matches!(
            (self, to),
            (None, Queueing)
                | (None, Quiescent)
                | (Quiescent, Queueing)
                | (Stopping, Queueing)
                | (Queueing, Queued)
                | (Queueing, Quiescent)
                | (Queued, Queued)
                | (Queued, Queueing)
                | (Queued, Dispatching)
                | (Dispatching, Queued)
                | (Dispatching, Running)
                | (Running, Stopping)
                | (Stopping, Quiescent)
                | (Quiescent, None)
        )
    }

    /// 处于该状态的任务应当（或可能）挂在某个 DSQ 上
    pub const fn may_be_queued(self) -> bool {
        matches!(self, ScxTaskState::Queued | ScxTaskState::Dispatching)
    }

    /// 可运行（受引擎调度）的状态
    pub const fn is_runnable(self) -> bool {
        matches!(
            self,
            ScxTaskState::Queueing
                | ScxTaskState::Queued
                | ScxTaskState::Dispatching
                | ScxTaskState::Running
        )
    }
}

/// 状态字快照：状态 + 代数
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    state: ScxTaskState,
    generation: u64,
}

impl StateSnapshot {
    const STATE_BITS: u32 = 8;
    const STATE_MASK: u64 = (1 << Self::STATE_BITS) - 1;
    const GEN_MASK: u64 = u64::MAX >> Self::STATE_BITS;

    const fn decode(word: u64) -> Self {
        Self {
            state: ScxTaskState::from_bits((word & Self::STATE_MASK) as u8),
            generation: word >> Self::STATE_BITS,
        }
    }

    const fn encode(self) -> u64 {
        (self.generation << Self::STATE_BITS) | self.state as u64
    }

    const fn next(self, to: ScxTaskState) -> Self {
        Self {
            state: to,
            generation: self.generation.wrapping_add(1) & Self::GEN_MASK,
        }
    }

    pub const fn state(self) -> ScxTaskState {
        self.state
    }

    pub const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.state, self.generation)
    }
}

/// 原子状态字
///
/// 只用 CAS 修改，从不持锁，满足引擎的非阻塞要求
pub struct OpsState(AtomicU64);

impl OpsState {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> StateSnapshot {
        StateSnapshot::decode(self.0.load(Ordering::Acquire))
    }

    /// 从 `seen` 迁移到 `to`
    ///
    /// - 迁移表不允许：`InvalidState`
    /// - 状态字已被并发修改：`StaleState`
    pub fn transition(&self, seen: StateSnapshot, to: ScxTaskState) -> ScxResult<StateSnapshot> {
        if !seen.state.can_transition_to(to) {
            return Err(ScxError::InvalidState);
        }

        let next = seen.next(to);
        self.0
            .compare_exchange(seen.encode(), next.encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| next)
            .map_err(|_| ScxError::StaleState)
    }

    /// 要求当前处于 `from`，迁移到 `to`（单次尝试）
    pub fn transition_from(&self, from: ScxTaskState, to: ScxTaskState) -> ScxResult<StateSnapshot> {
        let seen = self.load();
        if seen.state != from {
            return Err(ScxError::InvalidState);
        }
        self.transition(seen, to)
    }

    /// 无条件写入 `to`（代数仍然递增）
    ///
    /// 只用于任务拆除：此时任务对象本身即将销毁，允许 "最后写者获胜"
    pub fn force(&self, to: ScxTaskState) -> StateSnapshot {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let next = StateSnapshot::decode(cur).next(to);
            match self
                .0
                .compare_exchange_weak(cur, next.encode(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for OpsState {
    fn default() -> Self {
        Self::new()
    }
}
