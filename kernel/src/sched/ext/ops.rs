//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 策略回调约定与宿主接口
//!
//! 对应 Linux 的 `struct sched_ext_ops` (kernel/sched/ext.c)。
//! 策略通过 [`ScxOps`] 接收回调，通过回调参数中的 [`ScxCtx`] 调用引擎原语；
//! 宿主（进程管理、时钟、拓扑）通过 [`ScxHost`] 接收引擎的通知。

use alloc::string::String;

use serde::Serialize;

use super::ctx::ScxCtx;
use super::error::{ScxError, ScxResult};
use super::task::TaskRef;
use super::types::{CpuId, DeqFlags, DsqId, EnqFlags, WakeFlags};
use super::watchdog::StallReport;

/// 调度策略
///
/// 除 `exit` / `exit_task` 外，每个回调都带有一个 [`ScxCtx`]，
/// 它决定回调内可以调用哪些原语。
pub trait ScxOps: Send + Sync {
    /// 策略名称，用于日志
    fn name(&self) -> &str {
        "scx"
    }

    /// 启用时调用一次，通常在这里创建自定义 DSQ
    fn init(&self, _ctx: &mut ScxCtx<'_>) -> ScxResult<()> {
        Ok(())
    }

    /// 禁用时调用一次
    fn exit(&self, _info: &ExitInfo) {}

    /// 任务接入本引擎时调用；设置 `disallow` 可拒绝该任务
    fn init_task(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef) -> ScxResult<()> {
        Ok(())
    }

    /// 任务离开本引擎时调用
    fn exit_task(&self, _task: &TaskRef) {}

    /// 唤醒时的 CPU 选择建议，在 `enqueue` 之前调用
    ///
    /// 可以对正在唤醒的任务直接派发
    fn select_cpu(
        &self,
        _ctx: &mut ScxCtx<'_>,
        _task: &TaskRef,
        prev_cpu: CpuId,
        _wake_flags: WakeFlags,
    ) -> CpuId {
        prev_cpu
    }

    /// 任务变为可运行
    ///
    /// 返回前必须把任务插入某个 DSQ（即直接派发），否则引擎视为策略缺陷，
    /// 把任务放到全局 DSQ。默认实现插入全局 DSQ。
    fn enqueue(&self, ctx: &mut ScxCtx<'_>, task: &TaskRef, enq_flags: EnqFlags) {
        let _ = ctx.insert(DsqId::GLOBAL, task, 0, enq_flags);
    }

    /// 任务在排队期间离开（睡眠、属性变化）
    fn dequeue(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef, _deq_flags: DeqFlags) {}

    /// `cpu` 的本地 DSQ 为空时调用
    ///
    /// `prev` 是该 CPU 上一个运行的任务
    fn dispatch(&self, _ctx: &mut ScxCtx<'_>, _cpu: CpuId, _prev: Option<&TaskRef>) {}

    fn running(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef) {}

    fn stopping(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef, _runnable: bool) {}

    fn cpu_online(&self, _ctx: &mut ScxCtx<'_>, _cpu: CpuId) {}

    fn cpu_offline(&self, _ctx: &mut ScxCtx<'_>, _cpu: CpuId) {}
}

/// 宿主对策略故障的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// 保持策略运行（已降级到慢路径）
    Continue,
    /// 禁用整个策略
    Disable,
}

/// 宿主接口：进程管理、时钟与拓扑
pub trait ScxHost: Send + Sync {
    /// 单调时钟 (纳秒)
    fn now_ns(&self) -> u64;

    /// 请求 `cpu` 重新调度
    fn kick_cpu(&self, _cpu: CpuId, _preempt: bool) {}

    /// 任务被交还给默认调度类
    fn return_to_default_class(&self, _task: &TaskRef) {}

    /// watchdog 升级报告
    fn report_stall(&self, _report: &StallReport) {}

    /// 策略出现故障（首次策略缺陷或系统性超时）
    fn policy_faulted(&self, _info: &ExitInfo) -> FaultAction {
        FaultAction::Continue
    }
}

/// 退出原因
///
/// 对应 Linux 的 `enum scx_exit_kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScxExitKind {
    None,
    /// 正常结束
    Done,
    /// 被宿主卸载
    Unreg,
    /// 策略缺陷
    Error,
    /// watchdog 检测到系统性停滞
    ErrorStall,
}

/// 退出信息
///
/// 对应 Linux 的 `struct scx_exit_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub kind: ScxExitKind,
    /// 负的 errno，0 表示没有错误
    pub errno: i32,
    pub msg: String,
}

impl ExitInfo {
    pub fn new(kind: ScxExitKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno: 0,
            msg: msg.into(),
        }
    }

    pub fn from_error(kind: ScxExitKind, err: ScxError, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno: err.as_errno().as_neg_i32(),
            msg: msg.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ScxExitKind::Error | ScxExitKind::ErrorStall)
    }
}
