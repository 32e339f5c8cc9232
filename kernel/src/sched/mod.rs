//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器模块
//!
//! 完全遵循 Linux 内核的调度器设计 (kernel/sched/)
//!
//! Linux 调度器架构：
//! - 调度类 (sched_class): fair, rt, idle, deadline, ext
//! - 运行队列 (rq): 每个 CPU 一个 rq
//! - 调度入口: schedule() -> __schedule() -> pick_next_task()
//!
//! 这里只包含 ext 调度类 (sched_ext)：调度决策交给可插拔策略，
//! 其余调度类和上下文切换由宿主内核负责。

pub mod ext;

pub use ext::{
    DsqId,
    DsqOrdering,
    EnqFlags,
    DeqFlags,
    WakeFlags,
    Scx,
    ScxConfig,
    ScxCtx,
    ScxError,
    ScxHost,
    ScxOps,
    ScxResult,
    ScxRq,
    ScxStats,
    ScxTask,
    ScxTaskState,
    TaskRef,
};
