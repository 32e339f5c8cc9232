//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 派发/消费引擎
//!
//! 对应 Linux 的 balance_one() / pick_task_scx() / put_prev_task_scx() /
//! task_tick_scx() (kernel/sched/ext.c)
//!
//! 某个 CPU 选择下一个任务的顺序：
//! 1. 认领本地 DSQ 队首
//! 2. 从全局 DSQ 取一个任务到本地 DSQ
//! 3. 调用 ops.dispatch()，提交缓冲的插入请求，回到 1；
//!    只要 dispatch 还在插入任务就继续，最多 `dispatch_max_loops` 轮
//! 4. 以上都没有结果时 CPU 空闲
//!
//! 认领本地队首时 CAS 竞争失败会重试，超过 `consume_max_retries`
//! 次后本轮按空闲处理，不会无限自旋。

use alloc::format;
use alloc::sync::Arc;

use log::{debug, trace, warn};

use super::ctx::{KfuncMask, PendingDispatch, ScxCtx};
use super::dsq::Dsq;
use super::error::{ScxError, ScxResult};
use super::ops::ScxOps;
use super::rq::ScxRq;
use super::state::{ScxTaskState, StateSnapshot};
use super::stats::ScxEvent;
use super::task::{DirectDispatch, TaskFlags, TaskRef};
use super::types::{CpuId, DsqId, DsqOrdering, EnqFlags};
use super::watchdog::WatchdogLevel;
use super::{Scx, ScxCore};

/// 认领本地 DSQ 的结果
enum Consume {
    Task(TaskRef, StateSnapshot),
    Empty,
    /// 重试次数耗尽
    Busy,
}

impl ScxCore {
    /// 解析派发目标；离线 CPU 的本地 DSQ 重定向到全局 DSQ
    pub(crate) fn dispatch_target(&self, id: DsqId, cpu: CpuId) -> ScxResult<Arc<Dsq>> {
        let dsq = self.resolve_dsq(id, cpu)?;
        if let Some(target) = dsq.id().local_cpu() {
            if !self.is_cpu_online(target) {
                warn!(
                    "sched_ext: CPU {} is offline, redirecting to the global DSQ",
                    target
                );
                self.stats.inc(ScxEvent::DispatchLocalDsqOffline);
                return Ok(self.global.clone());
            }
        }
        Ok(dsq)
    }

    /// 按请求的排序方式插入；内建 DSQ 上的 vtime 插入记为策略缺陷并改用 FIFO
    fn insert_ordered(
        &self,
        dsq: &Arc<Dsq>,
        task: &TaskRef,
        vtime: Option<u64>,
        flags: EnqFlags,
        seen: StateSnapshot,
    ) -> ScxResult<()> {
        let ordering = match vtime {
            Some(_) => DsqOrdering::Vtime,
            None => dsq.ordering(),
        };
        match dsq.insert_checked(task, ordering, flags, seen) {
            Err(ScxError::InvalidArgument) => {
                self.record_fault(
                    ScxError::InvalidArgument,
                    format!("vtime insert of pid {} into built-in DSQ {:?}", task.pid(), dsq.id()),
                );
                dsq.insert_checked(task, DsqOrdering::Fifo, flags, seen)
            }
            ret => ret,
        }
    }

    /// 提交一次插入；目标不可用时记为策略缺陷并放到全局 DSQ
    ///
    /// 只有 `StaleState`（任务已被并发拆除）会返回给调用者
    pub(crate) fn commit_insert(
        &self,
        target: &Arc<Dsq>,
        task: &TaskRef,
        vtime: Option<u64>,
        flags: EnqFlags,
        seen: StateSnapshot,
    ) -> ScxResult<()> {
        match self.insert_ordered(target, task, vtime, flags, seen) {
            Ok(()) => {}
            Err(ScxError::StaleState) => return Err(ScxError::StaleState),
            Err(e) => {
                self.record_fault(
                    e,
                    format!("insert of pid {} into {:?} failed", task.pid(), target.id()),
                );
                self.stats.inc(ScxEvent::EnqFallback);
                self.global
                    .insert_checked(task, DsqOrdering::Fifo, flags, seen)?;
                return Ok(());
            }
        }

        // 插入和 CPU 下线竞争：插入后目标已下线，则把整个本地 DSQ 搬到全局 DSQ
        if let Some(cpu) = target.id().local_cpu() {
            if !self.is_cpu_online(cpu) {
                self.stats.inc(ScxEvent::DispatchLocalDsqOffline);
                Dsq::move_all(target, &self.global)?;
            }
        }
        Ok(())
    }

    pub(crate) fn kick_if_preempt(&self, target: &Arc<Dsq>, flags: EnqFlags) {
        if !flags.contains(EnqFlags::PREEMPT) {
            return;
        }
        if let Some(cpu) = target.id().local_cpu() {
            if self.is_cpu_online(cpu) {
                self.host.kick_cpu(cpu, true);
            }
        }
    }

    /// 提交 dispatch 缓冲中的一个请求
    ///
    /// 返回是否真的移动了任务。快照过期（任务在此期间被出队、被别的 CPU
    /// 认领或被拆除）的请求直接丢弃。
    pub(crate) fn finish_dispatch(&self, req: PendingDispatch, cpu: CpuId) -> ScxResult<bool> {
        let PendingDispatch {
            task,
            seen,
            dsq_id,
            enq_flags,
            vtime,
        } = req;

        let dst = match self.dispatch_target(dsq_id, cpu) {
            Ok(dsq) => dsq,
            Err(e) => {
                self.record_fault(
                    e,
                    format!("dispatch of pid {} to unknown DSQ {:?}", task.pid(), dsq_id),
                );
                self.global.clone()
            }
        };

        let snap = match seen.state() {
            ScxTaskState::Queued => {
                let Some(src) = task.current_dsq() else {
                    self.stats.inc(ScxEvent::DispatchStale);
                    return Ok(false);
                };
                if Arc::ptr_eq(&src, &dst) {
                    return Ok(false);
                }
                match src.claim(&task, seen) {
                    Ok(snap) => snap,
                    Err(_) => {
                        self.stats.inc(ScxEvent::DispatchStale);
                        return Ok(false);
                    }
                }
            }
            // 本次 dispatch 中 remove 的任务
            ScxTaskState::Queueing => seen,
            _ => {
                self.stats.inc(ScxEvent::DispatchStale);
                return Ok(false);
            }
        };

        task.set_holding_cpu(Some(cpu));
        let ret = self.commit_insert(&dst, &task, vtime, enq_flags, snap);
        task.set_holding_cpu(None);

        match ret {
            Ok(()) => {
                self.stats.inc(ScxEvent::Dispatched);
                self.kick_if_preempt(&dst, enq_flags);
                trace!("sched_ext: CPU {} dispatched pid {} to {:?}", cpu, task.pid(), dst.id());
                Ok(true)
            }
            Err(ScxError::StaleState) => {
                self.stats.inc(ScxEvent::DispatchStale);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 把 `src` 的队首任务移到 `cpu` 的本地 DSQ
    pub(crate) fn consume_into_local(&self, src: &Arc<Dsq>, cpu: CpuId) -> bool {
        let Some(local) = self.local_dsq(cpu) else {
            return false;
        };

        for _ in 0..=self.config.consume_max_retries {
            match src.claim_front() {
                Ok(Some((task, snap))) => {
                    task.set_holding_cpu(Some(cpu));
                    let ret = local.insert_checked(&task, DsqOrdering::Fifo, EnqFlags::empty(), snap);
                    task.set_holding_cpu(None);
                    if ret.is_ok() {
                        self.stats.inc(ScxEvent::Dispatched);
                        return true;
                    }
                    // 认领后被拆除，继续取下一个
                }
                Ok(None) => return false,
                Err(ScxError::StaleState) => self.stats.inc(ScxEvent::ConsumeRetries),
                Err(_) => return false,
            }
        }
        false
    }
}

impl<O: ScxOps> Scx<O> {
    fn consume_local(&self, local: &Dsq) -> Consume {
        for _ in 0..=self.core.config.consume_max_retries {
            match local.claim_front() {
                Ok(Some((task, snap))) => return Consume::Task(task, snap),
                Ok(None) => return Consume::Empty,
                Err(_) => self.core.stats.inc(ScxEvent::ConsumeRetries),
            }
        }
        Consume::Busy
    }

    /// 调用一次 ops.dispatch() 并提交缓冲，返回移动的任务数
    fn run_dispatch(&self, cpu: CpuId, prev: Option<&TaskRef>) -> usize {
        let core = &self.core;
        core.stats.inc(ScxEvent::DispatchCalls);

        let mut ctx = ScxCtx::new(core, KfuncMask::DISPATCH, cpu);
        self.serialized(|ops| ops.dispatch(&mut ctx, cpu, prev));
        ctx.flush_dispatch();
        ctx.finish_removed();
        ctx.nr_dispatched()
    }

    /// DISPATCHING -> RUNNING，安装为当前任务
    fn set_next_task(&self, rq: &mut ScxRq, task: TaskRef, snap: StateSnapshot) -> Option<TaskRef> {
        let core = &self.core;
        if task.transition(snap, ScxTaskState::Running).is_err() {
            debug!("sched_ext: pid {} detached while being picked", task.pid());
            return None;
        }

        task.set_cpu(Some(rq.cpu()));
        task.set_sticky_cpu(None);
        if task.slice() == 0 {
            task.set_slice(core.config.slice_dfl_ns);
        }
        task.set_watchdog_level(WatchdogLevel::Ok);
        task.set_flags(TaskFlags::RESET_RUNNABLE_AT);
        task.clear_flags(TaskFlags::YIELD);

        rq.curr = Some(task.clone());
        rq.prev = None;
        rq.need_resched = false;
        rq.clock_ns = core.now();

        if !core.is_bypassing() {
            let mut ctx = ScxCtx::new(core, KfuncMask::REST, rq.cpu());
            self.serialized(|ops| ops.running(&mut ctx, &task));
        }
        Some(task)
    }

    /// 为 `rq` 选择下一个任务，没有可运行任务时返回 `None`
    ///
    /// 调用前当前任务必须已经通过 [`Scx::put_prev_task`] 放回
    pub fn pick_next_task(&self, rq: &mut ScxRq) -> Option<TaskRef> {
        let core = &self.core;
        let cpu = rq.cpu();
        if rq.curr.is_some() || !core.is_cpu_online(cpu) {
            return None;
        }
        let local = core.local_dsq(cpu)?.clone();

        let mut loops = 0;
        let next = loop {
            match self.consume_local(&local) {
                Consume::Task(task, snap) => match self.set_next_task(rq, task, snap) {
                    Some(task) => break Some(task),
                    None => continue,
                },
                Consume::Busy => {
                    core.stats.inc(ScxEvent::ConsumeIdle);
                    break None;
                }
                Consume::Empty => {}
            }

            if core.consume_into_local(&core.global, cpu) {
                continue;
            }
            if core.is_bypassing() {
                break None;
            }
            if loops >= core.config.dispatch_max_loops {
                // dispatch 一直在插入非本地 DSQ，稍后再试
                core.host.kick_cpu(cpu, false);
                break None;
            }
            loops += 1;

            let prev = rq.prev.clone();
            let nr = self.run_dispatch(cpu, prev.as_ref());
            if nr == 0 && local.is_empty() && core.global.is_empty() {
                break None;
            }
        };

        self.maybe_disable();
        next
    }

    /// 当前任务离开 CPU
    ///
    /// RUNNING -> STOPPING，调用 ops.stopping()；仍可运行的任务重新入队，
    /// 否则进入 QUIESCENT。时间片未用完的任务（被更高优先级抢占）放回本地 DSQ 队头。
    pub fn put_prev_task(&self, rq: &mut ScxRq, runnable: bool) -> ScxResult<()> {
        let core = &self.core;
        let Some(task) = rq.curr.take() else {
            return Ok(());
        };
        rq.need_resched = false;

        let snap = match task.transition_from(ScxTaskState::Running, ScxTaskState::Stopping) {
            Ok(snap) => snap,
            // 运行期间被拆除
            Err(_) if task.state().state() == ScxTaskState::None => return Ok(()),
            Err(e) => return Err(e),
        };

        if !core.is_bypassing() {
            let mut ctx = ScxCtx::new(core, KfuncMask::REST, rq.cpu());
            self.serialized(|ops| ops.stopping(&mut ctx, &task, runnable));
        }
        rq.prev = Some(task.clone());

        let ret = if !runnable || task.is_disallowed() {
            task.transition(snap, ScxTaskState::Quiescent).map(|_| {
                if !runnable {
                    task.set_flags(TaskFlags::DEQD_FOR_SLEEP);
                }
            })
        } else if task.slice() > 0
            && !task.flags().contains(TaskFlags::YIELD)
            && !core.is_bypassing()
        {
            task.transition(snap, ScxTaskState::Queueing).and_then(|q| {
                core.set_task_runnable(&task);
                let ddsp = DirectDispatch {
                    dsq_id: DsqId::LOCAL,
                    enq_flags: EnqFlags::HEAD,
                    vtime: None,
                };
                core.commit_direct(&task, ddsp, rq.cpu(), q)
            })
        } else {
            self.do_enqueue(rq.cpu(), &task, snap, EnqFlags::empty())
        };

        self.maybe_disable();
        ret
    }

    /// 时钟中断：扣减当前任务的时间片，用完时设置 need_resched
    ///
    /// 返回是否需要重新调度
    pub fn tick(&self, rq: &mut ScxRq) -> bool {
        let now = self.core.now();
        let delta = now.saturating_sub(rq.clock_ns);
        rq.clock_ns = now;

        let Some(curr) = rq.curr.as_ref() else {
            return false;
        };
        if curr.consume_slice(delta) == 0 || curr.is_disallowed() {
            rq.need_resched = true;
        }
        rq.need_resched
    }

    /// 当前任务主动让出 CPU
    pub fn yield_current(&self, rq: &mut ScxRq) {
        if let Some(curr) = rq.curr.as_ref() {
            curr.set_slice(0);
            curr.set_flags(TaskFlags::YIELD);
            rq.need_resched = true;
        }
    }
}
