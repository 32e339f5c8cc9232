//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 任务调度记录 (Task Scheduling Record)
//!
//! 对应 Linux 的 `struct sched_ext_entity` (include/linux/sched/ext.h)，
//! 每个受 sched_ext 管理的任务一份。
//!
//! 字段对应关系：
//! - dsq / dsq_list / dsq_priq: [`DsqNode`]（FIFO 链与优先树二选一）
//! - dsq_seq: [`DsqNode::seq`]
//! - flags / dsq_flags: [`TaskFlags`]
//! - ops_state: [`OpsState`]
//! - sticky_cpu / holding_cpu
//! - slice / dsq_vtime
//! - ddsp_dsq_id / ddsp_enq_flags: [`DirectDispatch`]
//! - disallow

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::dsq::Dsq;
use super::error::ScxResult;
use super::state::{OpsState, ScxTaskState, StateSnapshot};
use super::types::{CpuId, DsqId, EnqFlags, Pid};
use super::watchdog::WatchdogLevel;

/// 任务调度记录的共享引用
pub type TaskRef = Arc<ScxTask>;

/// "没有 CPU" 标记，对应 Linux 中的 -1
const NO_CPU: i32 = -1;

bitflags! {
    /// 任务标志
    ///
    /// 对应 Linux 的 `enum scx_ent_flags` 与 `enum scx_ent_dsq_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        /// 挂在某个 DSQ 上
        const QUEUED            = 1 << 0;
        /// 下次入队时刷新 runnable_at
        const RESET_RUNNABLE_AT = 1 << 2;
        /// 最近一次出队是因为睡眠
        const DEQD_FOR_SLEEP    = 1 << 3;
        /// 挂在优先树而不是 FIFO 链上
        const DSQ_ON_PRIQ       = 1 << 8;
        /// 任务请求让出 CPU
        const YIELD             = 1 << 9;
    }
}

/// 任务在 DSQ 中的链接方式
///
/// 一个任务任一时刻只处于一种表示中
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsqLink {
    /// 不在任何 DSQ 中
    Unlinked,
    /// FIFO 链上的位置
    Fifo(i64),
    /// 优先树上的键 (vtime, seq)
    Vtime(u64, u64),
}

/// DSQ 节点
///
/// 只在持有所属 DSQ 锁时修改（加锁顺序：DSQ 锁 -> 节点锁）
pub(crate) struct DsqNode {
    pub(crate) dsq: Option<Arc<Dsq>>,
    pub(crate) link: DsqLink,
    pub(crate) seq: u64,
}

/// 直接派发暂存
///
/// ops.enqueue() / ops.select_cpu() 中对正在入队的任务调用 insert 时填写，
/// 回调返回后由引擎提交
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectDispatch {
    pub dsq_id: DsqId,
    pub enq_flags: EnqFlags,
    pub vtime: Option<u64>,
}

/// 任务调度记录
pub struct ScxTask {
    pid: Pid,
    ops_state: OpsState,
    /// node.dsq 的无锁镜像
    dsq_id: AtomicU64,
    pub(crate) node: Mutex<DsqNode>,
    flags: AtomicU32,
    /// 留给策略使用的私有字段
    private: AtomicU32,
    slice: AtomicU64,
    dsq_vtime: AtomicU64,
    sticky_cpu: AtomicI32,
    holding_cpu: AtomicI32,
    cpu: AtomicI32,
    ddsp: Mutex<Option<DirectDispatch>>,
    disallow: AtomicBool,
    runnable_at: AtomicU64,
    watchdog: AtomicU8,
}

impl ScxTask {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            ops_state: OpsState::new(),
            dsq_id: AtomicU64::new(DsqId::INVALID.as_raw()),
            node: Mutex::new(DsqNode {
                dsq: None,
                link: DsqLink::Unlinked,
                seq: 0,
            }),
            flags: AtomicU32::new(TaskFlags::RESET_RUNNABLE_AT.bits()),
            private: AtomicU32::new(0),
            slice: AtomicU64::new(0),
            dsq_vtime: AtomicU64::new(0),
            sticky_cpu: AtomicI32::new(NO_CPU),
            holding_cpu: AtomicI32::new(NO_CPU),
            cpu: AtomicI32::new(NO_CPU),
            ddsp: Mutex::new(None),
            disallow: AtomicBool::new(false),
            runnable_at: AtomicU64::new(0),
            watchdog: AtomicU8::new(WatchdogLevel::Ok as u8),
        }
    }

    pub fn new_ref(pid: Pid) -> TaskRef {
        Arc::new(Self::new(pid))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    // ------------------------------------------------------------------
    // 状态字
    // ------------------------------------------------------------------

    #[inline]
    pub fn state(&self) -> StateSnapshot {
        self.ops_state.load()
    }

    pub fn transition(&self, seen: StateSnapshot, to: ScxTaskState) -> ScxResult<StateSnapshot> {
        self.ops_state.transition(seen, to)
    }

    pub fn transition_from(&self, from: ScxTaskState, to: ScxTaskState) -> ScxResult<StateSnapshot> {
        self.ops_state.transition_from(from, to)
    }

    pub(crate) fn force_state(&self, to: ScxTaskState) -> StateSnapshot {
        self.ops_state.force(to)
    }

    // ------------------------------------------------------------------
    // DSQ 成员关系
    // ------------------------------------------------------------------

    /// 当前所在 DSQ，`DsqId::INVALID` 表示不在队列中
    pub fn dsq_id(&self) -> DsqId {
        DsqId::from_raw(self.dsq_id.load(Ordering::Acquire))
    }

    pub fn is_queued(&self) -> bool {
        self.dsq_id().is_valid()
    }

    pub(crate) fn set_dsq_id(&self, id: DsqId) {
        self.dsq_id.store(id.as_raw(), Ordering::Release);
    }

    /// 当前所在 DSQ 的引用（短暂持有节点锁）
    pub(crate) fn current_dsq(&self) -> Option<Arc<Dsq>> {
        self.node.lock().dsq.clone()
    }

    /// 在所属 DSQ 中的序列号
    pub fn dsq_seq(&self) -> u64 {
        self.node.lock().seq
    }

    pub fn dsq_link(&self) -> DsqLink {
        self.node.lock().link
    }

    // ------------------------------------------------------------------
    // 标志与策略私有字段
    // ------------------------------------------------------------------

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: TaskFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: TaskFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn private(&self) -> u32 {
        self.private.load(Ordering::Relaxed)
    }

    pub fn set_private(&self, value: u32) {
        self.private.store(value, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // 时间片与 vtime
    // ------------------------------------------------------------------

    pub fn slice(&self) -> u64 {
        self.slice.load(Ordering::Relaxed)
    }

    pub fn set_slice(&self, slice: u64) {
        self.slice.store(slice, Ordering::Relaxed);
    }

    /// 扣减时间片，返回剩余值
    pub(crate) fn consume_slice(&self, delta: u64) -> u64 {
        let mut cur = self.slice.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(delta);
            match self
                .slice
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn vtime(&self) -> u64 {
        self.dsq_vtime.load(Ordering::Relaxed)
    }

    pub fn set_vtime(&self, vtime: u64) {
        self.dsq_vtime.store(vtime, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // CPU 提示
    // ------------------------------------------------------------------

    fn load_cpu(slot: &AtomicI32) -> Option<CpuId> {
        let cpu = slot.load(Ordering::Acquire);
        if cpu < 0 {
            None
        } else {
            Some(cpu as CpuId)
        }
    }

    fn store_cpu(slot: &AtomicI32, cpu: Option<CpuId>) {
        slot.store(cpu.map_or(NO_CPU, |c| c as i32), Ordering::Release);
    }

    /// 任务最近一次运行（或正在运行）的 CPU
    pub fn cpu(&self) -> Option<CpuId> {
        Self::load_cpu(&self.cpu)
    }

    pub(crate) fn set_cpu(&self, cpu: Option<CpuId>) {
        Self::store_cpu(&self.cpu, cpu);
    }

    pub fn sticky_cpu(&self) -> Option<CpuId> {
        Self::load_cpu(&self.sticky_cpu)
    }

    pub(crate) fn set_sticky_cpu(&self, cpu: Option<CpuId>) {
        Self::store_cpu(&self.sticky_cpu, cpu);
    }

    /// 正在把任务搬到本地 DSQ 的 CPU
    pub fn holding_cpu(&self) -> Option<CpuId> {
        Self::load_cpu(&self.holding_cpu)
    }

    pub(crate) fn set_holding_cpu(&self, cpu: Option<CpuId>) {
        Self::store_cpu(&self.holding_cpu, cpu);
    }

    // ------------------------------------------------------------------
    // 直接派发
    // ------------------------------------------------------------------

    pub fn direct_dispatch(&self) -> Option<DirectDispatch> {
        *self.ddsp.lock()
    }

    /// 暂存直接派发目标，已有暂存时返回 false
    pub(crate) fn stage_direct_dispatch(&self, ddsp: DirectDispatch) -> bool {
        let mut slot = self.ddsp.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(ddsp);
        true
    }

    pub(crate) fn take_direct_dispatch(&self) -> Option<DirectDispatch> {
        self.ddsp.lock().take()
    }

    // ------------------------------------------------------------------
    // disallow / watchdog
    // ------------------------------------------------------------------

    pub fn is_disallowed(&self) -> bool {
        self.disallow.load(Ordering::Acquire)
    }

    /// 禁止本引擎调度该任务，它会回到默认调度类
    pub fn set_disallow(&self, disallow: bool) {
        self.disallow.store(disallow, Ordering::Release);
    }

    pub fn runnable_at(&self) -> u64 {
        self.runnable_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_runnable_at(&self, now: u64) {
        self.runnable_at.store(now, Ordering::Release);
    }

    pub fn watchdog_level(&self) -> WatchdogLevel {
        WatchdogLevel::from_u8(self.watchdog.load(Ordering::Acquire))
    }

    pub(crate) fn set_watchdog_level(&self, level: WatchdogLevel) {
        self.watchdog.store(level as u8, Ordering::Release);
    }
}

impl fmt::Debug for ScxTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScxTask")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("dsq", &self.dsq_id())
            .field("flags", &self.flags())
            .field("slice", &self.slice())
            .field("vtime", &self.vtime())
            .field("cpu", &self.cpu())
            .finish()
    }
}
