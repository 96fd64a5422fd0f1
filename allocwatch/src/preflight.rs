//! Pre-flight checks for allocwatch
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use object::{Architecture, Object};
use std::path::Path;

use crate::domain::Pid;

/// Minimum kernel version with `BPF_MAP_TYPE_RINGBUF`
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns an error describing the first requirement that is not met
pub fn run_preflight_checks(probe_object: &Path, pid: Pid) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_probe_object(probe_object)?;
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do, but checking capabilities needs more
    // than libc gives us
    bail!(
        "Permission denied: allocwatch requires root privileges to load eBPF programs.\n\n\
         Run with: sudo allocwatch ..."
    );
}

/// Parse `major.minor` out of a kernel release like `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check if the kernel version is sufficient for eBPF ring buffers
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        debug!("Unrecognised kernel release {release}");
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             allocwatch requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// Check that the compiled probe exists and looks like a BPF object
fn check_probe_object(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!(
            "Probe object not found: {}\n\n\
             Build it with: cargo xtask build-ebpf\n\
             or point --probe-object at a compiled probe.",
            path.display()
        );
    }

    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read probe object: {}", path.display()))?;

    // Not fatal; the loader gives the definitive answer
    match object::File::parse(&*data) {
        Ok(obj) if obj.architecture() != Architecture::Bpf => {
            warn!("{} is a {:?} object, not BPF", path.display(), obj.architecture());
        }
        Ok(_) => {}
        Err(e) => warn!("{} is not an ELF object: {e}", path.display()),
    }

    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` does not exist
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}

/// Lift the locked-memory limit so maps and programs can be created
///
/// Kernels before 5.11 charge BPF memory against `RLIMIT_MEMLOCK`.
///
/// # Errors
/// Returns an error if the limit cannot be raised
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        let err = std::io::Error::last_os_error();
        bail!("Failed to raise RLIMIT_MEMLOCK: {err}");
    }

    debug!("RLIMIT_MEMLOCK raised to unlimited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_check() {
        // Might run on an old kernel; only make sure it doesn't panic
        let _ = check_kernel_version();
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.8-rc1"), Some((5, 8)));
        assert_eq!(parse_kernel_release("unknown"), None);
    }

    #[test]
    fn test_probe_object_not_found() {
        let err = check_probe_object(Path::new("/nonexistent/allocwatch")).unwrap_err();
        assert!(err.to_string().contains("Probe object not found"));
    }

    #[test]
    fn test_probe_object_not_elf_is_tolerated() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not an object").unwrap();
        assert!(check_probe_object(file.path()).is_ok());
    }

    #[test]
    fn test_process_not_found() {
        let err = check_process_exists(Pid(999_999_999)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_own_process_accessible() {
        check_process_exists(Pid::current()).unwrap();
        check_proc_access(Pid::current()).unwrap();
    }
}
