//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep runtime addresses, file offsets and process
//! IDs from being mixed up at the resolver/attacher boundary.

use std::fmt;

/// Process ID (TGID in Linux terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// PID of the current process
    #[must_use]
    pub fn current() -> Self {
        Pid(std::process::id())
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

#[allow(clippy::cast_possible_wrap)]
impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// Runtime virtual address inside a process
///
/// Varies between runs because of ASLR; never used for attachment directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Position of a function inside the on-disk binary image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileOffset(pub u64);

impl fmt::Display for FileOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
        assert_eq!(VirtAddr(0x7f00_1000).to_string(), "0x7f001000");
        assert_eq!(FileOffset(0x9a0).to_string(), "+0x9a0");
    }

    #[test]
    fn test_pid_conversions() {
        assert_eq!(i32::from(Pid(1234)), 1234);
        assert_eq!(Pid::current().0, std::process::id());
    }
}
