//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 标准错误代码定义
//!
//! 和 include/uapi/asm-generic/errno.h 保持一致，仅保留 sched_ext 用到的部分

/// 标准错误代码
///
/// 使用方法：
/// ```rust
/// use rux_scx::errno::Errno;
///
/// // 返回错误（系统调用风格，返回负数）
/// assert_eq!(Errno::InvalidArgument.as_neg_i32(), -22);
/// ```
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted (EPERM, 1)
    OperationNotPermitted = 1,

    /// No such file or directory (ENOENT, 2)
    NoSuchFileOrDirectory = 2,

    /// No such process (ESRCH, 3)
    NoSuchProcess = 3,

    /// Try again (EAGAIN, 11)
    TryAgain = 11,

    /// Device or resource busy (EBUSY, 16)
    DeviceOrResourceBusy = 16,

    /// File exists (EEXIST, 17)
    FileExists = 17,

    /// No such device (ENODEV, 19)
    NoSuchDevice = 19,

    /// Invalid argument (EINVAL, 22)
    InvalidArgument = 22,

    /// Value too large (EOVERFLOW, 75)
    ValueTooLarge = 75,

    /// Connection timed out (ETIMEDOUT, 110)
    TimedOut = 110,
}

impl Errno {
    /// 获取错误代码的正数值（用于比较）
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 获取错误代码的负数值（用于系统调用返回）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -(self as i32)
    }
}

/// 常用的错误代码常量
pub mod constants {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EOVERFLOW: i32 = 75;
    pub const ETIMEDOUT: i32 = 110;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::NoSuchFileOrDirectory.as_i32(), constants::ENOENT);
        assert_eq!(Errno::TryAgain.as_i32(), constants::EAGAIN);
        assert_eq!(Errno::InvalidArgument.as_i32(), constants::EINVAL);
        assert_eq!(Errno::TimedOut.as_i32(), constants::ETIMEDOUT);
    }

    #[test]
    fn test_errno_negative() {
        assert_eq!(Errno::NoSuchProcess.as_neg_i32(), -3);
        assert_eq!(Errno::DeviceOrResourceBusy.as_neg_i32(), -16);
        assert_eq!(Errno::InvalidArgument.as_neg_i32(), -22);
    }
}
