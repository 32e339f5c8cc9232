//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Rux sched_ext 调度扩展
//!
//! 参考 Linux: kernel/sched/ext.c
//!
//! 本 crate 实现调度核心与可插拔调度策略（BPF scheduler 的对应物）之间的机制层：
//! - 派发队列 (DSQ): FIFO 链 + vtime 优先树
//! - 任务调度状态机: 原子状态字 + 代数计数器
//! - 派发/消费引擎: 每 CPU 的 pick_next_task 循环
//! - 直接派发快速路径与 watchdog
//!
//! 调度策略本身不在此实现，它通过 [`sched::ext::ScxOps`] 接入。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod errno;
pub mod sched;

#[cfg(test)]
mod tests;
