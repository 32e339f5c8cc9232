//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 测试用宿主与策略

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::sched::ext::{
    CpuId, DeqFlags, DsqId, DsqOrdering, EnqFlags, ExitInfo, FaultAction, Pid, Scx, ScxConfig, ScxCtx,
    ScxHost, ScxOps, ScxResult, StallReport, TaskRef, WakeFlags,
};

pub const MS: u64 = 1_000_000;

/// 测试用自定义 DSQ
pub const D1: DsqId = DsqId::from_raw(0x10);
pub const D2: DsqId = DsqId::from_raw(0x20);

/// 模拟宿主：时钟只在测试推进时前进
pub struct TestHost {
    clock: AtomicU64,
    on_fault: FaultAction,
    pub kicks: Mutex<Vec<(CpuId, bool)>>,
    pub returned: Mutex<Vec<Pid>>,
    pub stalls: Mutex<Vec<StallReport>>,
    pub faults: Mutex<Vec<ExitInfo>>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_fault_action(FaultAction::Continue)
    }

    pub fn with_fault_action(on_fault: FaultAction) -> Self {
        Self {
            clock: AtomicU64::new(0),
            on_fault,
            kicks: Mutex::new(Vec::new()),
            returned: Mutex::new(Vec::new()),
            stalls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_now(&self, ns: u64) {
        self.clock.store(ns, Ordering::SeqCst);
    }
}

impl ScxHost for TestHost {
    fn now_ns(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn kick_cpu(&self, cpu: CpuId, preempt: bool) {
        self.kicks.lock().unwrap().push((cpu, preempt));
    }

    fn return_to_default_class(&self, task: &TaskRef) {
        self.returned.lock().unwrap().push(task.pid());
    }

    fn report_stall(&self, report: &StallReport) {
        self.stalls.lock().unwrap().push(report.clone());
    }

    fn policy_faulted(&self, info: &ExitInfo) -> FaultAction {
        self.faults.lock().unwrap().push(info.clone());
        self.on_fault
    }
}

/// 4 个 CPU，1 秒 watchdog，10ms 时间片
pub fn config() -> ScxConfig {
    ScxConfig::default()
        .with_nr_cpus(4)
        .with_watchdog_timeout_ms(1000)
        .with_slice_ns(10 * MS)
}

pub fn engine<O: ScxOps>(ops: O) -> (Scx<O>, Arc<TestHost>) {
    engine_with(ops, config(), TestHost::new())
}

/// 创建并启用引擎
pub fn engine_with<O: ScxOps>(ops: O, config: ScxConfig, host: TestHost) -> (Scx<O>, Arc<TestHost>) {
    let host = Arc::new(host);
    let scx = Scx::new(config, ops, host.clone()).expect("valid config");
    scx.enable().expect("enable");
    (scx, host)
}

/// 接入一组任务
pub fn attach<O: ScxOps>(scx: &Scx<O>, pids: impl IntoIterator<Item = Pid>) -> Vec<TaskRef> {
    pids.into_iter()
        .map(|pid| scx.attach_task(pid).expect("attach"))
        .collect()
}

/// 在 CPU 0 上依次唤醒
pub fn wake_all<O: ScxOps>(scx: &Scx<O>, tasks: &[TaskRef]) {
    for task in tasks {
        scx.wake_up(task, 0, WakeFlags::TTWU).expect("wake_up");
    }
}

/// 回调计数
#[derive(Default)]
pub struct Calls {
    pub select_cpu: AtomicUsize,
    pub enqueue: AtomicUsize,
    pub dequeue: AtomicUsize,
    pub dispatch: AtomicUsize,
    pub running: AtomicUsize,
    pub stopping: AtomicUsize,
    pub exit_task: AtomicUsize,
    pub exit: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn hit(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// 全部使用默认回调：入队到全局 DSQ
pub struct GlobalFifo;

impl ScxOps for GlobalFifo {
    fn name(&self) -> &str {
        "global_fifo"
    }
}

/// 所有任务进一个共享的自定义 DSQ，dispatch 时取一个到本地
pub struct SharedDsq {
    pub dsq: DsqId,
    pub ordering: DsqOrdering,
    pub calls: Calls,
}

impl SharedDsq {
    pub fn fifo() -> Self {
        Self {
            dsq: D1,
            ordering: DsqOrdering::Fifo,
            calls: Calls::default(),
        }
    }

    pub fn vtime() -> Self {
        Self {
            dsq: D2,
            ordering: DsqOrdering::Vtime,
            calls: Calls::default(),
        }
    }
}

impl ScxOps for SharedDsq {
    fn name(&self) -> &str {
        "shared_dsq"
    }

    fn init(&self, ctx: &mut ScxCtx<'_>) -> ScxResult<()> {
        ctx.create_dsq(self.dsq, self.ordering)
    }

    fn exit(&self, _info: &ExitInfo) {
        Calls::hit(&self.calls.exit);
    }

    fn exit_task(&self, _task: &TaskRef) {
        Calls::hit(&self.calls.exit_task);
    }

    fn enqueue(&self, ctx: &mut ScxCtx<'_>, task: &TaskRef, enq_flags: EnqFlags) {
        Calls::hit(&self.calls.enqueue);
        let _ = match self.ordering {
            DsqOrdering::Fifo => ctx.insert(self.dsq, task, 0, enq_flags),
            DsqOrdering::Vtime => ctx.insert_vtime(self.dsq, task, 0, task.vtime(), enq_flags),
        };
    }

    fn dequeue(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef, _deq_flags: DeqFlags) {
        Calls::hit(&self.calls.dequeue);
    }

    fn dispatch(&self, ctx: &mut ScxCtx<'_>, _cpu: CpuId, _prev: Option<&TaskRef>) {
        Calls::hit(&self.calls.dispatch);
        let _ = ctx.move_to_local(self.dsq);
    }

    fn running(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef) {
        Calls::hit(&self.calls.running);
    }

    fn stopping(&self, _ctx: &mut ScxCtx<'_>, _task: &TaskRef, _runnable: bool) {
        Calls::hit(&self.calls.stopping);
    }
}

/// 在 enqueue 中把任务直接派发到固定 CPU 的本地 DSQ
pub struct DirectToCpu {
    pub cpu: CpuId,
    pub flags: EnqFlags,
    pub calls: Calls,
}

impl DirectToCpu {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            flags: EnqFlags::empty(),
            calls: Calls::default(),
        }
    }
}

impl ScxOps for DirectToCpu {
    fn name(&self) -> &str {
        "direct_to_cpu"
    }

    fn enqueue(&self, ctx: &mut ScxCtx<'_>, task: &TaskRef, enq_flags: EnqFlags) {
        Calls::hit(&self.calls.enqueue);
        let _ = ctx.insert(DsqId::local_on(self.cpu), task, 0, enq_flags | self.flags);
    }

    fn dispatch(&self, _ctx: &mut ScxCtx<'_>, _cpu: CpuId, _prev: Option<&TaskRef>) {
        Calls::hit(&self.calls.dispatch);
    }
}

/// 任务进入 D1 之后再也不会被派发
pub struct BlackHole;

impl ScxOps for BlackHole {
    fn name(&self) -> &str {
        "black_hole"
    }

    fn init(&self, ctx: &mut ScxCtx<'_>) -> ScxResult<()> {
        ctx.create_dsq(D1, DsqOrdering::Fifo)
    }

    fn enqueue(&self, ctx: &mut ScxCtx<'_>, task: &TaskRef, enq_flags: EnqFlags) {
        let _ = ctx.insert(D1, task, 0, enq_flags);
    }
}
