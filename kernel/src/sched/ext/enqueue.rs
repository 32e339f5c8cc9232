//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 入队与直接派发
//!
//! 对应 Linux 的 select_task_rq_scx() / do_enqueue_task() / direct_dispatch() /
//! ops_dequeue() (kernel/sched/ext.c)
//!
//! ops.select_cpu() 或 ops.enqueue() 对正在入队的任务调用 insert 时，请求先
//! 暂存在任务的 [`DirectDispatch`] 字段里，回调返回后立即提交。提交路径与
//! 通用路径使用同一个 [`Dsq::insert_checked`]，最终的 DSQ 归属和状态迁移
//! 完全相同，只是少了一次 "插入 -> 消费" 的往返。

use alloc::format;
use alloc::sync::Arc;

use log::{debug, trace};

use super::ctx::{KfuncMask, ScxCtx};
use super::dsq::Dsq;
use super::error::{ScxError, ScxResult};
use super::ops::ScxOps;
use super::state::{ScxTaskState, StateSnapshot};
use super::stats::ScxEvent;
use super::task::{DirectDispatch, TaskFlags, TaskRef};
use super::types::{CpuId, DeqFlags, DsqId, DsqOrdering, EnqFlags, WakeFlags};
use super::{Scx, ScxCore};

impl ScxCore {
    /// 任务重新变为可运行，需要时刷新 watchdog 的计时起点
    pub(crate) fn set_task_runnable(&self, task: &TaskRef) {
        if task.flags().contains(TaskFlags::RESET_RUNNABLE_AT) {
            task.set_runnable_at(self.now());
            task.clear_flags(TaskFlags::RESET_RUNNABLE_AT);
        }
    }

    /// 任务仍在任务表中（拆除后的旧引用不算）
    pub(crate) fn is_attached(&self, task: &TaskRef) -> bool {
        self.tasks
            .read()
            .get(&task.pid())
            .is_some_and(|t| Arc::ptr_eq(t, task))
    }

    /// 提交暂存的直接派发
    ///
    /// - `LOCAL` 解析为入队所在的 CPU
    /// - 策略已降级时，本地 DSQ 目标改为全局 DSQ
    /// - 目标 CPU 已下线时改为全局 DSQ
    pub(crate) fn commit_direct(
        &self,
        task: &TaskRef,
        ddsp: DirectDispatch,
        cpu: CpuId,
        seen: StateSnapshot,
    ) -> ScxResult<()> {
        let mut id = ddsp.dsq_id;
        if id.is_local() {
            id = DsqId::local_on(cpu);
        }
        if id.is_local_on() && self.is_degraded() {
            id = DsqId::GLOBAL;
        }

        let target: Arc<Dsq> = match self.dispatch_target(id, cpu) {
            Ok(dsq) => dsq,
            Err(e) => {
                self.record_fault(
                    e,
                    format!("direct dispatch of pid {} to unknown DSQ {:?}", task.pid(), id),
                );
                self.global.clone()
            }
        };

        if let Some(target_cpu) = target.id().local_cpu() {
            task.set_sticky_cpu(Some(target_cpu));
        }
        self.stats.inc(ScxEvent::DirectDispatch);
        self.commit_insert(&target, task, ddsp.vtime, ddsp.enq_flags, seen)?;
        self.kick_if_preempt(&target, ddsp.enq_flags);
        trace!(
            "sched_ext: pid {} direct-dispatched to {:?}",
            task.pid(),
            target.id()
        );
        Ok(())
    }
}

impl<O: ScxOps> Scx<O> {
    /// 唤醒任务：ops.select_cpu() 选择 CPU，然后在该 CPU 上入队
    ///
    /// 返回任务入队的 CPU
    pub fn wake_up(&self, task: &TaskRef, prev_cpu: CpuId, wake_flags: WakeFlags) -> ScxResult<CpuId> {
        if task.is_disallowed() {
            return Err(ScxError::InvalidState);
        }
        if task.state().state() != ScxTaskState::Quiescent {
            return Err(ScxError::InvalidState);
        }

        let cpu = self.select_task_rq(task, prev_cpu, wake_flags);
        match self.enqueue_task(cpu, task, EnqFlags::WAKEUP) {
            Ok(()) => Ok(cpu),
            Err(e) => {
                task.take_direct_dispatch();
                Err(e)
            }
        }
    }

    fn select_task_rq(&self, task: &TaskRef, prev_cpu: CpuId, wake_flags: WakeFlags) -> CpuId {
        let core = &self.core;
        let fallback = core.fallback_cpu(prev_cpu);
        if core.is_bypassing() {
            return fallback;
        }

        let mut ctx = ScxCtx::for_task(core, KfuncMask::SELECT_CPU | KfuncMask::ENQUEUE, prev_cpu, task);
        let cpu = self.serialized(|ops| ops.select_cpu(&mut ctx, task, prev_cpu, wake_flags));
        if core.is_cpu_online(cpu) {
            cpu
        } else {
            debug!(
                "sched_ext: select_cpu() returned unusable CPU {} for pid {}",
                cpu,
                task.pid()
            );
            core.stats.inc(ScxEvent::SelectCpuFallback);
            fallback
        }
    }

    /// 任务在 `cpu` 上变为可运行
    pub fn enqueue_task(&self, cpu: CpuId, task: &TaskRef, enq_flags: EnqFlags) -> ScxResult<()> {
        let ret = self.do_enqueue(cpu, task, task.state(), enq_flags);
        self.maybe_disable();
        ret
    }

    /// 从 `seen` 进入 QUEUEING，然后由策略（或 bypass 模式）放入某个 DSQ
    pub(crate) fn do_enqueue(
        &self,
        cpu: CpuId,
        task: &TaskRef,
        seen: StateSnapshot,
        enq_flags: EnqFlags,
    ) -> ScxResult<()> {
        let core = &self.core;
        if task.is_disallowed() || seen.state() == ScxTaskState::None || !core.is_attached(task) {
            return Err(ScxError::InvalidState);
        }

        let queueing = task.transition(seen, ScxTaskState::Queueing)?;
        core.set_task_runnable(task);
        task.clear_flags(TaskFlags::DEQD_FOR_SLEEP);
        core.stats.inc(ScxEvent::Enqueue);

        if core.is_bypassing() {
            core.stats.inc(ScxEvent::BypassEnqueue);
            task.take_direct_dispatch();
            if task.slice() == 0 {
                task.set_slice(core.config.slice_dfl_ns);
            }
            return core
                .global
                .insert_checked(task, DsqOrdering::Fifo, enq_flags, queueing);
        }

        // select_cpu() 中已经直接派发
        if let Some(ddsp) = task.take_direct_dispatch() {
            return core.commit_direct(task, ddsp, cpu, queueing);
        }

        let mut ctx = ScxCtx::for_task(core, KfuncMask::ENQUEUE, cpu, task);
        self.serialized(|ops| ops.enqueue(&mut ctx, task, enq_flags));
        drop(ctx);

        if let Some(ddsp) = task.take_direct_dispatch() {
            return core.commit_direct(task, ddsp, cpu, queueing);
        }

        core.record_fault(
            ScxError::InvalidState,
            format!("ops.enqueue() returned without queueing pid {}", task.pid()),
        );
        core.fallback_insert(task, queueing);
        Ok(())
    }

    /// 任务在排队期间离开（睡眠、属性变化）
    ///
    /// 任务从所在 DSQ 中摘除并进入 QUIESCENT；正在运行的任务由
    /// [`Scx::put_prev_task`] 处理，这里什么都不做。
    pub fn dequeue_task(&self, task: &TaskRef, deq_flags: DeqFlags) -> ScxResult<()> {
        let core = &self.core;
        let mut tries = 0;
        let queueing = loop {
            if tries > core.config.consume_max_retries {
                return Err(ScxError::StaleState);
            }
            tries += 1;

            match task.state().state() {
                ScxTaskState::Queued => {
                    let Some(dsq) = task.current_dsq() else {
                        continue;
                    };
                    match dsq.remove_transition(task, ScxTaskState::Queueing) {
                        Ok(snap) => break snap,
                        Err(ScxError::NotQueued) | Err(ScxError::StaleState) => continue,
                        Err(e) => return Err(e),
                    }
                }
                ScxTaskState::Running => return Ok(()),
                // 另一个 CPU 正在迁移该任务
                ScxTaskState::Queueing | ScxTaskState::Dispatching => {
                    core::hint::spin_loop();
                    continue;
                }
                _ => return Err(ScxError::NotQueued),
            }
        };

        task.take_direct_dispatch();
        if !core.is_bypassing() {
            let mut ctx = ScxCtx::new(core, KfuncMask::REST, task.cpu().unwrap_or(0));
            self.serialized(|ops| ops.dequeue(&mut ctx, task, deq_flags));
        }

        task.transition(queueing, ScxTaskState::Quiescent)?;
        task.set_flags(TaskFlags::RESET_RUNNABLE_AT);
        if deq_flags.contains(DeqFlags::SLEEP) {
            task.set_flags(TaskFlags::DEQD_FOR_SLEEP);
        }
        self.maybe_disable();
        Ok(())
    }
}
