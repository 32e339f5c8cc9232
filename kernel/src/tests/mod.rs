//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 场景测试
//!
//! 各模块内部的 `#[cfg(test)]` 只覆盖单个数据结构；这里通过 [`Scx`] 的公开
//! 入口驱动整个引擎，宿主由 [`common::TestHost`] 模拟（手动推进的时钟，
//! 记录 kick / 停滞报告 / 策略故障）。
//!
//! 运行测试：
//! ```bash
//! cargo test --package rux-scx
//! ```
//!
//! [`Scx`]: crate::sched::ext::Scx

mod common;

mod concurrency;
