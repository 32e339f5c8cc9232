//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! watchdog
//!
//! 对应 Linux 的 scx_watchdog_workfn() / check_rq_for_timeouts()
//! (kernel/sched/ext.c)
//!
//! 每个任务有一个级别 `OK -> WARNED -> ESCALATED`：
//! - 排队超过超时的一半：WARNED，打印警告
//! - 排队超过超时：升级。第一次升级把任务移到全局 DSQ（策略仍然存活，
//!   只是漏掉了这个任务）；已经升级过或本来就在全局 DSQ 上的任务说明
//!   策略已经卡死，任务被标记 disallow 并交还默认调度类
//! - 任务开始运行时级别清零
//!
//! 一次检查中升级的任务数达到 `stall_fault_threshold` 时视为策略整体失效，
//! 通知宿主，宿主可以决定禁用策略。

use alloc::format;

use log::{error, warn};
use serde::Serialize;

use super::error::{ScxError, ScxResult};
use super::ops::{ExitInfo, FaultAction, ScxExitKind, ScxOps};
use super::state::ScxTaskState;
use super::stats::ScxEvent;
use super::task::TaskRef;
use super::types::{DsqId, DsqOrdering, EnqFlags, Pid};
use super::Scx;

/// watchdog 级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WatchdogLevel {
    Ok = 0,
    Warned = 1,
    Escalated = 2,
}

impl WatchdogLevel {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => WatchdogLevel::Warned,
            2 => WatchdogLevel::Escalated,
            _ => WatchdogLevel::Ok,
        }
    }
}

/// 升级时采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallAction {
    /// 移到全局 DSQ
    MovedToFallback,
    /// 标记 disallow，交还默认调度类
    ReturnedToDefaultClass,
}

/// 升级报告，交给宿主（进程管理模块）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StallReport {
    pub pid: Pid,
    /// 自变为可运行起经过的时间 (纳秒)
    pub elapsed_ns: u64,
    /// 升级时任务所在的 DSQ
    pub last_dsq: DsqId,
    pub action: StallAction,
}

impl<O: ScxOps> Scx<O> {
    /// 检查所有受管任务，返回本次升级的任务数
    ///
    /// 升级数达到阈值时返回 `PolicyTimeout`
    pub fn watchdog_tick(&self) -> ScxResult<usize> {
        let core = &self.core;
        if core.is_bypassing() {
            return Ok(0);
        }

        let now = core.now();
        let timeout = core.config.watchdog_timeout_ns;
        let warn_at = core.config.watchdog_warn_ns();
        let mut escalated = 0;

        for task in core.tasks() {
            let state = task.state().state();
            if !matches!(state, ScxTaskState::Queued | ScxTaskState::Dispatching) {
                continue;
            }

            let elapsed = now.saturating_sub(task.runnable_at());
            if elapsed >= timeout {
                if let Some(report) = self.escalate(&task, elapsed) {
                    core.host.report_stall(&report);
                    escalated += 1;
                }
            } else if elapsed >= warn_at && task.watchdog_level() == WatchdogLevel::Ok {
                task.set_watchdog_level(WatchdogLevel::Warned);
                core.stats.inc(ScxEvent::WatchdogWarned);
                warn!(
                    "sched_ext: pid {} runnable for {} ms without being scheduled ({:?})",
                    task.pid(),
                    elapsed / 1_000_000,
                    task.dsq_id()
                );
            }
        }

        if escalated >= core.config.stall_fault_threshold {
            let msg = format!("{} tasks stalled in one watchdog period", escalated);
            error!("sched_ext: {}", msg);
            let info = ExitInfo::from_error(ScxExitKind::ErrorStall, ScxError::PolicyTimeout, msg);
            if core.host.policy_faulted(&info) == FaultAction::Disable {
                self.disable_with(info);
            }
            return Err(ScxError::PolicyTimeout);
        }
        Ok(escalated)
    }

    fn escalate(&self, task: &TaskRef, elapsed: u64) -> Option<StallReport> {
        let core = &self.core;
        let last_dsq = task.dsq_id();
        let first = task.watchdog_level() != WatchdogLevel::Escalated;

        let action = if first && task.state().state() == ScxTaskState::Queued && !last_dsq.is_global() {
            let dsq = task.current_dsq()?;
            let queueing = dsq.remove_transition(task, ScxTaskState::Queueing).ok()?;
            core.global
                .insert_checked(task, DsqOrdering::Fifo, EnqFlags::REENQ, queueing)
                .ok()?;
            task.set_runnable_at(core.now());
            task.set_watchdog_level(WatchdogLevel::Escalated);
            StallAction::MovedToFallback
        } else {
            task.set_disallow(true);
            self.detach(task);
            core.stats.inc(ScxEvent::ReturnedToDefault);
            core.host.return_to_default_class(task);
            StallAction::ReturnedToDefaultClass
        };

        core.stats.inc(ScxEvent::WatchdogEscalated);
        error!(
            "sched_ext: pid {} stalled for {} ms on {:?}, {:?}",
            task.pid(),
            elapsed / 1_000_000,
            last_dsq,
            action
        );
        Some(StallReport {
            pid: task.pid(),
            elapsed_ns: elapsed,
            last_dsq,
            action,
        })
    }
}
