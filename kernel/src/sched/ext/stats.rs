//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 事件统计
//!
//! 对应 Linux 的 `struct scx_event_stats`

use core::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 引擎事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ScxEvent {
    Enqueue,
    DirectDispatch,
    DispatchCalls,
    Dispatched,
    DispatchStale,
    ConsumeRetries,
    ConsumeIdle,
    DispatchLocalDsqOffline,
    EnqFallback,
    SelectCpuFallback,
    WatchdogWarned,
    WatchdogEscalated,
    ReturnedToDefault,
    PolicyFaults,
    BypassEnqueue,
}

impl ScxEvent {
    const COUNT: usize = ScxEvent::BypassEnqueue as usize + 1;
}

/// 原子计数器组
pub(crate) struct ScxCounters {
    events: [AtomicU64; ScxEvent::COUNT],
}

impl ScxCounters {
    pub(crate) const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            events: [ZERO; ScxEvent::COUNT],
        }
    }

    #[inline]
    pub(crate) fn inc(&self, ev: ScxEvent) {
        self.add(ev, 1);
    }

    #[inline]
    pub(crate) fn add(&self, ev: ScxEvent, n: u64) {
        self.events[ev as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self, ev: ScxEvent) -> u64 {
        self.events[ev as usize].load(Ordering::Relaxed)
    }
}

/// 统计快照，供进程管理模块导出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScxStats {
    pub enqueue: u64,
    pub direct_dispatch: u64,
    pub dispatch_calls: u64,
    pub dispatched: u64,
    pub dispatch_stale: u64,
    pub consume_retries: u64,
    pub consume_idle: u64,
    pub dispatch_local_dsq_offline: u64,
    pub enq_fallback: u64,
    pub select_cpu_fallback: u64,
    pub watchdog_warned: u64,
    pub watchdog_escalated: u64,
    pub returned_to_default: u64,
    pub policy_faults: u64,
    pub bypass_enqueue: u64,
    /// 策略是否已降级到慢路径
    pub degraded: bool,
    pub nr_tasks: usize,
    pub nr_custom_dsqs: usize,
    pub nr_global_queued: usize,
}

impl ScxCounters {
    pub(crate) fn snapshot(&self) -> ScxStats {
        ScxStats {
            enqueue: self.get(ScxEvent::Enqueue),
            direct_dispatch: self.get(ScxEvent::DirectDispatch),
            dispatch_calls: self.get(ScxEvent::DispatchCalls),
            dispatched: self.get(ScxEvent::Dispatched),
            dispatch_stale: self.get(ScxEvent::DispatchStale),
            consume_retries: self.get(ScxEvent::ConsumeRetries),
            consume_idle: self.get(ScxEvent::ConsumeIdle),
            dispatch_local_dsq_offline: self.get(ScxEvent::DispatchLocalDsqOffline),
            enq_fallback: self.get(ScxEvent::EnqFallback),
            select_cpu_fallback: self.get(ScxEvent::SelectCpuFallback),
            watchdog_warned: self.get(ScxEvent::WatchdogWarned),
            watchdog_escalated: self.get(ScxEvent::WatchdogEscalated),
            returned_to_default: self.get(ScxEvent::ReturnedToDefault),
            policy_faults: self.get(ScxEvent::PolicyFaults),
            bypass_enqueue: self.get(ScxEvent::BypassEnqueue),
            ..ScxStats::default()
        }
    }
}
