//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! sched_ext：可插拔调度策略的调度队列引擎
//!
//! 完全遵循 Linux 内核的 sched_ext 设计 (kernel/sched/ext.c)
//!
//! 组成：
//! - 任务调度记录 [`ScxTask`]
//! - 调度队列 [`Dsq`]：一个全局 DSQ，每 CPU 一个本地 DSQ，以及策略创建的自定义 DSQ
//! - DSQ 目录 [`DsqDirectory`]
//! - 任务状态机 [`ScxTaskState`] / [`OpsState`]
//! - 派发/消费引擎：[`Scx::pick_next_task`]
//! - 直接派发快速路径：[`Scx::enqueue_task`]
//! - watchdog：[`Scx::watchdog_tick`]
//!
//! 策略实现 [`ScxOps`]，宿主实现 [`ScxHost`] 并为每个 CPU 持有一个 [`ScxRq`]。
//! 引擎没有全局单例，多个实例可以共存。

pub mod config;
pub mod ctx;
pub mod directory;
mod dispatch;
pub mod dsq;
mod enqueue;
pub mod error;
pub mod ops;
pub mod rq;
pub mod state;
pub mod stats;
pub mod task;
pub mod types;
pub mod watchdog;

pub use config::ScxConfig;
pub use ctx::{KfuncMask, ScxCtx};
pub use directory::DsqDirectory;
pub use dsq::Dsq;
pub use error::{ScxError, ScxResult};
pub use ops::{ExitInfo, FaultAction, ScxExitKind, ScxHost, ScxOps};
pub use rq::ScxRq;
pub use state::{OpsState, ScxTaskState, StateSnapshot};
pub use stats::ScxStats;
pub use task::{DirectDispatch, DsqLink, ScxTask, TaskFlags, TaskRef};
pub use types::{CpuId, DeqFlags, DsqId, DsqOrdering, EnqFlags, Pid, WakeFlags};
pub use watchdog::{StallAction, StallReport, WatchdogLevel};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};

use dsq::unlink_task;
use stats::ScxCounters;

/// 引擎启用状态
///
/// 对应 Linux 的 `enum scx_enable_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScxEnableState {
    Disabled = 0,
    Enabling = 1,
    Enabled = 2,
    Disabling = 3,
}

impl ScxEnableState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => ScxEnableState::Enabling,
            2 => ScxEnableState::Enabled,
            3 => ScxEnableState::Disabling,
            _ => ScxEnableState::Disabled,
        }
    }
}

/// 与策略类型无关的引擎状态
///
/// 回调上下文 [`ScxCtx`] 只借用这一部分
pub struct ScxCore {
    pub(crate) config: ScxConfig,
    pub(crate) host: Arc<dyn ScxHost>,
    pub(crate) global: Arc<Dsq>,
    local: Vec<Arc<Dsq>>,
    online: Vec<AtomicBool>,
    pub(crate) directory: DsqDirectory,
    tasks: RwLock<BTreeMap<Pid, TaskRef>>,
    enable_state: AtomicU8,
    /// 策略出现过缺陷，回调串行化，本地 DSQ 直接派发降级到全局 DSQ
    degraded: AtomicBool,
    disable_pending: AtomicBool,
    /// 降级后串行化回调
    pub(crate) ops_lock: Mutex<()>,
    first_fault: Mutex<Option<ExitInfo>>,
    exit_info: Mutex<Option<ExitInfo>>,
    pub(crate) stats: ScxCounters,
}

impl ScxCore {
    fn new(config: ScxConfig, host: Arc<dyn ScxHost>) -> Self {
        let nr_cpus = config.nr_cpus;
        Self {
            global: Arc::new(Dsq::new(DsqId::GLOBAL, DsqOrdering::Fifo)),
            local: (0..nr_cpus)
                .map(|cpu| Arc::new(Dsq::new(DsqId::local_on(cpu as CpuId), DsqOrdering::Fifo)))
                .collect(),
            online: (0..nr_cpus).map(|_| AtomicBool::new(true)).collect(),
            directory: DsqDirectory::new(),
            tasks: RwLock::new(BTreeMap::new()),
            enable_state: AtomicU8::new(ScxEnableState::Disabled as u8),
            degraded: AtomicBool::new(false),
            disable_pending: AtomicBool::new(false),
            ops_lock: Mutex::new(()),
            first_fault: Mutex::new(None),
            exit_info: Mutex::new(None),
            stats: ScxCounters::new(),
            config,
            host,
        }
    }

    pub fn config(&self) -> &ScxConfig {
        &self.config
    }

    pub fn nr_cpus(&self) -> usize {
        self.local.len()
    }

    pub fn now(&self) -> u64 {
        self.host.now_ns()
    }

    pub fn enable_state(&self) -> ScxEnableState {
        ScxEnableState::from_u8(self.enable_state.load(Ordering::Acquire))
    }

    fn set_enable_state(&self, state: ScxEnableState) {
        self.enable_state.store(state as u8, Ordering::Release);
    }

    fn cmpxchg_enable_state(&self, from: ScxEnableState, to: ScxEnableState) -> bool {
        self.enable_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 绕过策略：未启用或正在禁用时，所有任务走全局 FIFO
    pub fn is_bypassing(&self) -> bool {
        self.enable_state() != ScxEnableState::Enabled
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.online
            .get(cpu as usize)
            .is_some_and(|o| o.load(Ordering::Acquire))
    }

    /// 优先 `prev`，否则任选一个在线 CPU
    pub(crate) fn fallback_cpu(&self, prev: CpuId) -> CpuId {
        if self.is_cpu_online(prev) {
            return prev;
        }
        (0..self.nr_cpus() as CpuId)
            .find(|&cpu| self.is_cpu_online(cpu))
            .unwrap_or(prev)
    }

    pub fn global_dsq(&self) -> &Arc<Dsq> {
        &self.global
    }

    pub fn local_dsq(&self, cpu: CpuId) -> Option<&Arc<Dsq>> {
        self.local.get(cpu as usize)
    }

    /// 按 ID 查找 DSQ，`LOCAL` 解析为 `cpu` 的本地 DSQ
    pub fn resolve_dsq(&self, id: DsqId, cpu: CpuId) -> ScxResult<Arc<Dsq>> {
        if id.is_global() {
            return Ok(self.global.clone());
        }
        if id.is_local() {
            return self.local_dsq(cpu).cloned().ok_or(ScxError::InvalidArgument);
        }
        if let Some(target) = id.local_cpu() {
            return self.local_dsq(target).cloned().ok_or(ScxError::InvalidArgument);
        }
        if id.is_custom() {
            return self.directory.lookup(id).ok_or(ScxError::Unavailable);
        }
        Err(ScxError::InvalidArgument)
    }

    pub fn task(&self, pid: Pid) -> Option<TaskRef> {
        self.tasks.read().get(&pid).cloned()
    }

    /// 所有受管任务的快照（不持有表锁）
    pub fn tasks(&self) -> Vec<TaskRef> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.read().len()
    }

    /// 记录一次策略缺陷
    ///
    /// 第一次缺陷使策略降级并通知宿主；宿主要求禁用时在当前入口返回前执行
    pub(crate) fn record_fault(&self, err: ScxError, msg: String) {
        self.stats.inc(stats::ScxEvent::PolicyFaults);
        if self.degraded.swap(true, Ordering::AcqRel) {
            debug!("sched_ext: policy fault ({}): {}", err, msg);
            return;
        }

        warn!(
            "sched_ext: policy fault ({}): {}, switching to the slow path",
            err, msg
        );
        let info = ExitInfo::from_error(ScxExitKind::Error, err, msg);
        let action = self.host.policy_faulted(&info);
        *self.first_fault.lock() = Some(info);
        if action == FaultAction::Disable {
            self.disable_pending.store(true, Ordering::Release);
        }
    }

    /// 把处于 QUEUEING 的任务放到全局 DSQ
    pub(crate) fn fallback_insert(&self, task: &TaskRef, seen: StateSnapshot) {
        self.stats.inc(stats::ScxEvent::EnqFallback);
        if let Err(e) = self
            .global
            .insert_checked(task, DsqOrdering::Fifo, EnqFlags::empty(), seen)
        {
            debug!("sched_ext: fallback insert of pid {} dropped: {}", task.pid(), e);
        }
    }

    /// 销毁自定义 DSQ，残留任务迁移到全局 DSQ
    pub(crate) fn destroy_dsq(&self, id: DsqId) -> ScxResult<usize> {
        let dsq = self.directory.remove(id)?;
        let moved = Dsq::move_all(&dsq, &self.global)?;
        if moved > 0 {
            info!(
                "sched_ext: destroyed DSQ {:?}, {} tasks moved to the global DSQ",
                id, moved
            );
        }
        Ok(moved)
    }

    /// 任务离开引擎：强制写 NONE，再从所在 DSQ 中摘除
    ///
    /// 先写状态可以让之后任何基于旧快照的插入失败
    fn detach_record(&self, task: &TaskRef) {
        task.force_state(ScxTaskState::None);
        task.take_direct_dispatch();
        while unlink_task(task, self.config.consume_max_retries).is_ok() {}
        task.set_holding_cpu(None);
        task.set_sticky_cpu(None);
        self.tasks.write().remove(&task.pid());
    }
}

/// sched_ext 引擎实例
pub struct Scx<O: ScxOps> {
    core: ScxCore,
    ops: O,
}

impl<O: ScxOps> Scx<O> {
    /// 创建引擎，初始处于禁用（bypass）状态
    pub fn new(config: ScxConfig, ops: O, host: Arc<dyn ScxHost>) -> ScxResult<Self> {
        config.validate()?;
        Ok(Self {
            core: ScxCore::new(config, host),
            ops,
        })
    }

    pub fn core(&self) -> &ScxCore {
        &self.core
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn enable_state(&self) -> ScxEnableState {
        self.core.enable_state()
    }

    pub fn task(&self, pid: Pid) -> Option<TaskRef> {
        self.core.task(pid)
    }

    /// 禁用后记录的退出信息
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.core.exit_info.lock().clone()
    }

    /// 调用策略回调；策略降级后所有回调在一把锁下串行执行
    pub(crate) fn serialized<R>(&self, f: impl FnOnce(&O) -> R) -> R {
        if self.core.is_degraded() {
            let _guard = self.core.ops_lock.lock();
            f(&self.ops)
        } else {
            f(&self.ops)
        }
    }

    /// 宿主要求禁用时执行
    pub(crate) fn maybe_disable(&self) {
        if self.core.disable_pending.swap(false, Ordering::AcqRel) {
            let info = self
                .core
                .first_fault
                .lock()
                .clone()
                .unwrap_or_else(|| ExitInfo::new(ScxExitKind::Error, "policy fault"));
            self.disable_with(info);
        }
    }

    // ------------------------------------------------------------------
    // 启用 / 禁用
    // ------------------------------------------------------------------

    /// 启用策略：调用 ops.init()
    pub fn enable(&self) -> ScxResult<()> {
        let core = &self.core;
        if !core.cmpxchg_enable_state(ScxEnableState::Disabled, ScxEnableState::Enabling) {
            return Err(ScxError::InvalidState);
        }

        core.degraded.store(false, Ordering::Release);
        *core.first_fault.lock() = None;
        *core.exit_info.lock() = None;

        let mut ctx = ScxCtx::new(core, KfuncMask::UNLOCKED, 0);
        if let Err(e) = self.ops.init(&mut ctx) {
            error!("sched_ext: ops.init() of \"{}\" failed: {}", self.ops.name(), e);
            *core.exit_info.lock() = Some(ExitInfo::from_error(
                ScxExitKind::Error,
                e,
                "ops.init() failed",
            ));
            core.set_enable_state(ScxEnableState::Disabled);
            return Err(e);
        }

        core.set_enable_state(ScxEnableState::Enabled);
        info!(
            "sched_ext: BPF scheduler \"{}\" enabled on {} CPUs",
            self.ops.name(),
            core.nr_cpus()
        );
        Ok(())
    }

    /// 宿主卸载策略
    pub fn disable(&self) {
        self.disable_with(ExitInfo::new(ScxExitKind::Unreg, "unregistered by host"));
    }

    /// 禁用策略：所有自定义 DSQ 和本地 DSQ 的任务迁移到全局 DSQ，之后进入 bypass 模式
    ///
    /// 总是成功
    pub fn disable_with(&self, info: ExitInfo) {
        let core = &self.core;
        let claimed = core.cmpxchg_enable_state(ScxEnableState::Enabled, ScxEnableState::Disabling)
            || core.cmpxchg_enable_state(ScxEnableState::Enabling, ScxEnableState::Disabling);
        if !claimed {
            return;
        }

        let mut drained = 0;
        for dsq in core.directory.clear() {
            drained += Dsq::move_all(&dsq, &core.global).unwrap_or(0);
        }
        for local in &core.local {
            drained += Dsq::move_all(local, &core.global).unwrap_or(0);
        }

        self.ops.exit(&info);

        if info.is_error() {
            error!(
                "sched_ext: BPF scheduler \"{}\" disabled ({:?}): {}",
                self.ops.name(),
                info.kind,
                info.msg
            );
        } else {
            info!(
                "sched_ext: BPF scheduler \"{}\" disabled ({:?})",
                self.ops.name(),
                info.kind
            );
        }
        info!("sched_ext: {} tasks drained to the global DSQ", drained);

        *core.exit_info.lock() = Some(info);
        core.set_enable_state(ScxEnableState::Disabled);
    }

    // ------------------------------------------------------------------
    // 任务接入 / 离开
    // ------------------------------------------------------------------

    /// 任务接入本引擎，调用 ops.init_task()
    ///
    /// 新任务处于 QUIESCENT，由 [`Scx::wake_up`] 变为可运行。
    /// 策略在 init_task 中设置 disallow 时任务交还默认调度类，返回 `InvalidState`。
    pub fn attach_task(&self, pid: Pid) -> ScxResult<TaskRef> {
        let core = &self.core;
        let task = ScxTask::new_ref(pid);
        {
            let mut tasks = core.tasks.write();
            if tasks.contains_key(&pid) {
                return Err(ScxError::Exists);
            }
            tasks.insert(pid, task.clone());
        }

        if !core.is_bypassing() {
            let mut ctx = ScxCtx::new(core, KfuncMask::UNLOCKED, 0);
            let ret = self.serialized(|ops| ops.init_task(&mut ctx, &task));
            if let Err(e) = ret {
                core.tasks.write().remove(&pid);
                warn!("sched_ext: ops.init_task() failed for pid {}: {}", pid, e);
                return Err(e);
            }
        }

        if task.is_disallowed() {
            core.tasks.write().remove(&pid);
            core.stats.inc(stats::ScxEvent::ReturnedToDefault);
            core.host.return_to_default_class(&task);
            return Err(ScxError::InvalidState);
        }

        task.transition_from(ScxTaskState::None, ScxTaskState::Quiescent)?;
        Ok(task)
    }

    /// 任务离开本引擎（进程退出）
    ///
    /// 无论任务处于什么状态，都强制摘除并写 NONE
    pub fn detach_task(&self, pid: Pid) -> ScxResult<()> {
        let task = self.core.task(pid).ok_or(ScxError::NotQueued)?;
        self.detach(&task);
        Ok(())
    }

    pub(crate) fn detach(&self, task: &TaskRef) {
        self.core.detach_record(task);
        if !self.core.is_bypassing() {
            self.serialized(|ops| ops.exit_task(task));
        }
    }

    // ------------------------------------------------------------------
    // CPU 热插拔
    // ------------------------------------------------------------------

    /// CPU 上线/下线；下线时本地 DSQ 的任务迁移到全局 DSQ
    pub fn set_cpu_online(&self, cpu: CpuId, online: bool) -> ScxResult<()> {
        let core = &self.core;
        let flag = core.online.get(cpu as usize).ok_or(ScxError::InvalidArgument)?;
        if flag.swap(online, Ordering::AcqRel) == online {
            return Ok(());
        }

        if !core.is_bypassing() {
            let mut ctx = ScxCtx::new(core, KfuncMask::UNLOCKED, cpu);
            self.serialized(|ops| {
                if online {
                    ops.cpu_online(&mut ctx, cpu)
                } else {
                    ops.cpu_offline(&mut ctx, cpu)
                }
            });
        }

        if online {
            info!("sched_ext: CPU {} online", cpu);
        } else {
            let local = core.local_dsq(cpu).ok_or(ScxError::InvalidArgument)?;
            let moved = Dsq::move_all(local, &core.global)?;
            info!(
                "sched_ext: CPU {} offline, {} tasks moved to the global DSQ",
                cpu, moved
            );
        }
        self.maybe_disable();
        Ok(())
    }

    // ------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------

    pub fn stats(&self) -> ScxStats {
        let core = &self.core;
        ScxStats {
            degraded: core.is_degraded(),
            nr_tasks: core.nr_tasks(),
            nr_custom_dsqs: core.directory.len(),
            nr_global_queued: core.global.nr_queued(),
            ..core.stats.snapshot()
        }
    }

    /// 按 ID 查询 DSQ 中的任务数
    pub fn nr_queued(&self, id: DsqId) -> ScxResult<usize> {
        if id.is_local() {
            return Err(ScxError::InvalidArgument);
        }
        self.core.resolve_dsq(id, 0).map(|dsq| dsq.nr_queued())
    }

    /// 按队列顺序列出 DSQ 中的任务（诊断用）
    pub fn dsq_pids(&self, id: DsqId) -> ScxResult<Vec<Pid>> {
        if id.is_local() {
            return Err(ScxError::InvalidArgument);
        }
        self.core.resolve_dsq(id, 0).map(|dsq| dsq.iter_pids())
    }

    /// 策略缺陷信息（第一次）
    pub fn first_fault(&self) -> Option<ExitInfo> {
        self.core.first_fault.lock().clone()
    }
}
