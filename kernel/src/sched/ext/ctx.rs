//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 回调上下文与引擎原语
//!
//! 对应 Linux 中 BPF 调度器可调用的 kfunc (`scx_bpf_dsq_insert()`、
//! `scx_bpf_dsq_move_to_local()`、`scx_bpf_create_dsq()` 等)。
//!
//! Linux 由 BPF verifier 和 `current->scx.kf_mask` 限制每个回调里能调用的
//! kfunc；这里改为运行时检查：引擎调用回调时构造一个 [`ScxCtx`]，
//! 其中的 [`KfuncMask`] 决定哪些原语可用，违反时记为策略缺陷。
//!
//! | 回调                     | 掩码                       |
//! |--------------------------|----------------------------|
//! | init / init_task         | UNLOCKED                   |
//! | cpu_online / cpu_offline | UNLOCKED                   |
//! | select_cpu               | SELECT_CPU \| ENQUEUE      |
//! | enqueue                  | ENQUEUE                    |
//! | dispatch                 | DISPATCH                   |
//! | dequeue / running / stopping | REST                   |

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::debug;

use super::dsq::Dsq;
use super::error::{ScxError, ScxResult};
use super::state::{ScxTaskState, StateSnapshot};
use super::task::{DirectDispatch, TaskRef};
use super::types::{CpuId, DsqId, DsqOrdering, EnqFlags};
use super::ScxCore;

bitflags! {
    /// kfunc 权限掩码
    ///
    /// 对应 Linux 的 `enum scx_kf_mask`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KfuncMask: u32 {
        /// 可睡眠上下文：init / init_task / CPU 热插拔
        const UNLOCKED   = 1 << 0;
        const DISPATCH   = 1 << 2;
        const ENQUEUE    = 1 << 3;
        const SELECT_CPU = 1 << 4;
        /// 其他回调
        const REST       = 1 << 5;
    }
}

/// dispatch 缓冲中的一次插入请求
///
/// 对应 Linux 的 `struct scx_dsp_buf_ent`，`seen` 相当于其中的 qseq
pub(crate) struct PendingDispatch {
    pub(crate) task: TaskRef,
    pub(crate) seen: StateSnapshot,
    pub(crate) dsq_id: DsqId,
    pub(crate) enq_flags: EnqFlags,
    pub(crate) vtime: Option<u64>,
}

/// 回调上下文（能力令牌）
///
/// 只能由引擎构造，生命周期不超过一次回调
pub struct ScxCtx<'a> {
    core: &'a ScxCore,
    mask: KfuncMask,
    cpu: CpuId,
    /// 正在 select_cpu / enqueue 的任务
    enqueuing: Option<TaskRef>,
    dsp_buf: Vec<PendingDispatch>,
    /// 本次 dispatch 中被 remove 的任务
    removed: Vec<TaskRef>,
    nr_dispatched: usize,
    nr_faults: usize,
}

impl<'a> ScxCtx<'a> {
    pub(crate) fn new(core: &'a ScxCore, mask: KfuncMask, cpu: CpuId) -> Self {
        Self {
            core,
            mask,
            cpu,
            enqueuing: None,
            dsp_buf: Vec::new(),
            removed: Vec::new(),
            nr_dispatched: 0,
            nr_faults: 0,
        }
    }

    pub(crate) fn for_task(core: &'a ScxCore, mask: KfuncMask, cpu: CpuId, task: &TaskRef) -> Self {
        let mut ctx = Self::new(core, mask, cpu);
        ctx.enqueuing = Some(task.clone());
        ctx
    }

    /// 回调所在的 CPU
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn mask(&self) -> KfuncMask {
        self.mask
    }

    pub fn nr_cpus(&self) -> usize {
        self.core.nr_cpus()
    }

    pub fn now(&self) -> u64 {
        self.core.now()
    }

    /// 默认时间片
    pub fn slice_dfl(&self) -> u64 {
        self.core.config.slice_dfl_ns
    }

    pub fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.core.is_cpu_online(cpu)
    }

    /// 本次回调中记录的策略缺陷数
    pub fn nr_faults(&self) -> usize {
        self.nr_faults
    }

    pub(crate) fn nr_dispatched(&self) -> usize {
        self.nr_dispatched
    }

    fn fault(&mut self, err: ScxError, msg: String) -> ScxError {
        self.nr_faults += 1;
        self.core.record_fault(err, msg);
        err
    }

    fn check(&mut self, allowed: KfuncMask, what: &str) -> ScxResult<()> {
        if self.mask.intersects(allowed) {
            Ok(())
        } else {
            let msg = format!("{}() not allowed with kfunc mask {:?}", what, self.mask);
            Err(self.fault(ScxError::PermissionDenied, msg))
        }
    }

    // ------------------------------------------------------------------
    // 插入
    // ------------------------------------------------------------------

    /// 把任务插入 `dsq_id`，按 DSQ 的默认排序方式
    ///
    /// `slice` 非 0 时同时设置任务的时间片。
    /// 在 select_cpu / enqueue 中只能插入正在入队的任务（直接派发），
    /// 在 dispatch 中插入请求被缓冲，回调返回后统一提交。
    pub fn insert(&mut self, dsq_id: DsqId, task: &TaskRef, slice: u64, enq_flags: EnqFlags) -> ScxResult<()> {
        self.do_insert(dsq_id, task, slice, None, enq_flags)
    }

    /// 按 `vtime` 插入优先树
    ///
    /// 内建 DSQ 不支持 vtime 排序，这种插入会被记为策略缺陷并退化为 FIFO
    pub fn insert_vtime(
        &mut self,
        dsq_id: DsqId,
        task: &TaskRef,
        slice: u64,
        vtime: u64,
        enq_flags: EnqFlags,
    ) -> ScxResult<()> {
        self.do_insert(dsq_id, task, slice, Some(vtime), enq_flags)
    }

    fn do_insert(
        &mut self,
        dsq_id: DsqId,
        task: &TaskRef,
        slice: u64,
        vtime: Option<u64>,
        enq_flags: EnqFlags,
    ) -> ScxResult<()> {
        self.check(
            KfuncMask::ENQUEUE | KfuncMask::SELECT_CPU | KfuncMask::DISPATCH,
            "insert",
        )?;
        if !dsq_id.is_valid() {
            let msg = format!("insert of pid {} into invalid DSQ", task.pid());
            return Err(self.fault(ScxError::InvalidArgument, msg));
        }

        if slice != 0 {
            task.set_slice(slice);
        }
        if let Some(vtime) = vtime {
            task.set_vtime(vtime);
        }

        if self.mask.intersects(KfuncMask::ENQUEUE | KfuncMask::SELECT_CPU) {
            let own = self
                .enqueuing
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, task));
            if !own {
                let msg = format!("pid {} can only be inserted from its own enqueue", task.pid());
                return Err(self.fault(ScxError::InvalidState, msg));
            }

            let ddsp = DirectDispatch {
                dsq_id,
                enq_flags,
                vtime,
            };
            if !task.stage_direct_dispatch(ddsp) {
                let msg = format!("pid {} already direct-dispatched", task.pid());
                return Err(self.fault(ScxError::InvalidState, msg));
            }
            return Ok(());
        }

        if self.dsp_buf.len() >= self.core.config.dispatch_max_batch {
            let msg = format!(
                "dispatch buffer overflow ({} tasks) on CPU {}",
                self.dsp_buf.len(),
                self.cpu
            );
            return Err(self.fault(ScxError::Overflow, msg));
        }

        self.dsp_buf.push(PendingDispatch {
            task: task.clone(),
            seen: task.state(),
            dsq_id,
            enq_flags,
            vtime,
        });
        Ok(())
    }

    /// 提交 dispatch 缓冲
    pub(crate) fn flush_dispatch(&mut self) {
        let pending: Vec<_> = self.dsp_buf.drain(..).collect();
        for req in pending {
            let pid = req.task.pid();
            match self.core.finish_dispatch(req, self.cpu) {
                Ok(true) => self.nr_dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    self.fault(e, format!("dispatch of pid {} failed", pid));
                }
            }
        }
    }

    /// 检查被 remove 但没有重新插入的任务，把它们放回全局 DSQ
    pub(crate) fn finish_removed(&mut self) {
        let removed: Vec<_> = self.removed.drain(..).collect();
        for task in removed {
            let seen = task.state();
            if seen.state() != ScxTaskState::Queueing || task.is_queued() {
                continue;
            }
            self.fault(
                ScxError::NotQueued,
                format!("pid {} removed but never re-inserted", task.pid()),
            );
            self.core.fallback_insert(&task, seen);
        }
    }

    // ------------------------------------------------------------------
    // DSQ 之间的迁移
    // ------------------------------------------------------------------

    /// 把任务从它所在的 DSQ 中取出，留给本次 dispatch 重新插入
    ///
    /// 任务进入 QUEUEING；回调结束时仍未插入的任务会被放到全局 DSQ
    pub fn remove(&mut self, task: &TaskRef) -> ScxResult<()> {
        self.check(KfuncMask::DISPATCH, "remove")?;

        for _ in 0..=self.core.config.consume_max_retries {
            let Some(dsq) = task.current_dsq() else {
                break;
            };
            match dsq.remove_transition(task, ScxTaskState::Queueing) {
                Ok(_) => {
                    self.removed.push(task.clone());
                    return Ok(());
                }
                Err(ScxError::NotQueued) | Err(ScxError::StaleState) => continue,
                Err(e) => {
                    let msg = format!("remove of pid {} failed", task.pid());
                    return Err(self.fault(e, msg));
                }
            }
        }
        let msg = format!("remove of pid {} which is not queued", task.pid());
        Err(self.fault(ScxError::NotQueued, msg))
    }

    /// 把 `dsq_id` 的队首任务移到当前 CPU 的本地 DSQ
    ///
    /// 返回是否移动了任务。先提交已缓冲的插入请求。
    pub fn move_to_local(&mut self, dsq_id: DsqId) -> ScxResult<bool> {
        self.check(KfuncMask::DISPATCH, "move_to_local")?;

        let src = match self.core.resolve_dsq(dsq_id, self.cpu) {
            Ok(dsq) => dsq,
            Err(e) => {
                let msg = format!("move_to_local from unknown DSQ {:?}", dsq_id);
                return Err(self.fault(e, msg));
            }
        };
        if src.id().is_local_on() {
            let msg = format!("move_to_local from local DSQ {:?}", src.id());
            return Err(self.fault(ScxError::InvalidArgument, msg));
        }

        self.flush_dispatch();
        let moved = self.core.consume_into_local(&src, self.cpu);
        if moved {
            self.nr_dispatched += 1;
        }
        Ok(moved)
    }

    /// 把 `src` 的全部任务整体迁移到 `dst`
    pub fn move_all(&mut self, src: DsqId, dst: DsqId) -> ScxResult<usize> {
        self.check(KfuncMask::UNLOCKED | KfuncMask::DISPATCH, "move_all")?;

        let resolved = self
            .core
            .resolve_dsq(src, self.cpu)
            .and_then(|s| Ok((s, self.core.dispatch_target(dst, self.cpu)?)));
        let (src_dsq, dst_dsq) = match resolved {
            Ok(pair) => pair,
            Err(e) => {
                let msg = format!("move_all {:?} -> {:?}", src, dst);
                return Err(self.fault(e, msg));
            }
        };

        match Dsq::move_all(&src_dsq, &dst_dsq) {
            Ok(n) => {
                if dst_dsq.id().is_local_on() {
                    self.nr_dispatched += n;
                }
                debug!("sched_ext: moved {} tasks {:?} -> {:?}", n, src, dst);
                Ok(n)
            }
            Err(e) => {
                let msg = format!("move_all {:?} -> {:?}", src, dst);
                Err(self.fault(e, msg))
            }
        }
    }

    // ------------------------------------------------------------------
    // DSQ 生命周期
    // ------------------------------------------------------------------

    /// 创建自定义 DSQ
    pub fn create_dsq(&mut self, id: DsqId, ordering: DsqOrdering) -> ScxResult<()> {
        self.check(KfuncMask::UNLOCKED, "create_dsq")?;
        match self.core.directory.create(id, ordering) {
            Ok(_) => {
                debug!("sched_ext: created DSQ {:?} ({:?})", id, ordering);
                Ok(())
            }
            Err(e) => {
                let msg = format!("create_dsq {:?}", id);
                Err(self.fault(e, msg))
            }
        }
    }

    /// 按配置的默认排序方式创建自定义 DSQ
    pub fn create_dsq_default(&mut self, id: DsqId) -> ScxResult<()> {
        let ordering = self.core.config.default_ordering;
        self.create_dsq(id, ordering)
    }

    /// 销毁自定义 DSQ，残留任务迁移到全局 DSQ
    pub fn destroy_dsq(&mut self, id: DsqId) -> ScxResult<()> {
        match self.core.destroy_dsq(id) {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = format!("destroy_dsq {:?}", id);
                Err(self.fault(e, msg))
            }
        }
    }

    // ------------------------------------------------------------------
    // 查询与通知
    // ------------------------------------------------------------------

    /// DSQ 中的任务数
    pub fn nr_queued(&self, id: DsqId) -> ScxResult<usize> {
        self.core.resolve_dsq(id, self.cpu).map(|dsq| dsq.nr_queued())
    }

    /// 请求 `cpu` 重新调度
    pub fn kick_cpu(&self, cpu: CpuId, preempt: bool) {
        if self.core.is_cpu_online(cpu) {
            self.core.host.kick_cpu(cpu, preempt);
        }
    }
}
