//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! sched_ext 错误分类

use core::fmt;

use crate::errno::Errno;

/// sched_ext 引擎错误
///
/// - `StaleState` 只在引擎内部重试，不会暴露给策略
/// - `InvalidState` / `NotQueued` / `PermissionDenied` / `Overflow` 视为策略缺陷
/// - `PolicyTimeout` 由 watchdog 产生
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScxError {
    /// 当前状态不允许该操作（例如重复插入已在队列中的任务）
    InvalidState,
    /// 任务不在指定的 DSQ 中
    NotQueued,
    /// CAS 竞争失败，调用者应重试
    StaleState,
    /// DSQ 不存在（可能已被并发销毁）
    Unavailable,
    /// watchdog 超时升级
    PolicyTimeout,
    /// 回调上下文的 kfunc 掩码不允许调用该原语
    PermissionDenied,
    /// DSQ ID 已存在
    Exists,
    /// 参数非法（DSQ ID 编码错误、配置越界等）
    InvalidArgument,
    /// 单次 dispatch 插入的任务数超过上限
    Overflow,
}

pub type ScxResult<T> = Result<T, ScxError>;

impl ScxError {
    /// 对应的内核错误码
    pub const fn as_errno(self) -> Errno {
        match self {
            ScxError::InvalidState => Errno::DeviceOrResourceBusy,
            ScxError::NotQueued => Errno::NoSuchProcess,
            ScxError::StaleState => Errno::TryAgain,
            ScxError::Unavailable => Errno::NoSuchFileOrDirectory,
            ScxError::PolicyTimeout => Errno::TimedOut,
            ScxError::PermissionDenied => Errno::OperationNotPermitted,
            ScxError::Exists => Errno::FileExists,
            ScxError::InvalidArgument => Errno::InvalidArgument,
            ScxError::Overflow => Errno::ValueTooLarge,
        }
    }

    /// 是否说明策略存在缺陷
    pub const fn is_policy_fault(self) -> bool {
        matches!(
            self,
            ScxError::InvalidState
                | ScxError::NotQueued
                | ScxError::PermissionDenied
                | ScxError::Overflow
                | ScxError::Unavailable
                | ScxError::InvalidArgument
                | ScxError::Exists
        )
    }
}

impl fmt::Display for ScxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ScxError::InvalidState => "operation not allowed in current task state",
            ScxError::NotQueued => "task is not queued on this DSQ",
            ScxError::StaleState => "state changed concurrently",
            ScxError::Unavailable => "DSQ does not exist",
            ScxError::PolicyTimeout => "task stalled past the watchdog timeout",
            ScxError::PermissionDenied => "kfunc not allowed from this callback",
            ScxError::Exists => "DSQ id already in use",
            ScxError::InvalidArgument => "invalid argument",
            ScxError::Overflow => "dispatch buffer overflow",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ScxError::StaleState.as_errno().as_neg_i32(), -11);
        assert_eq!(ScxError::InvalidArgument.as_errno(), Errno::InvalidArgument);
        assert_eq!(ScxError::PolicyTimeout.as_errno().as_i32(), 110);
    }

    #[test]
    fn test_stale_state_is_not_a_fault() {
        assert!(!ScxError::StaleState.is_policy_fault());
        assert!(!ScxError::PolicyTimeout.is_policy_fault());
        assert!(ScxError::InvalidState.is_policy_fault());
        assert!(ScxError::NotQueued.is_policy_fault());
    }
}
