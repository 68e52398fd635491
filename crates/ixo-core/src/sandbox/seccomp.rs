//! Default-deny syscall allow-list.
//!
//! One profile, two renderings: a runtime JSON document handed to the
//! container runtime, and a compiled BPF program applied in a `pre_exec`
//! hook for the syscall-filter tier. Both share the same allow-list,
//! sized to run a standard interpreter: file I/O, memory management,
//! futex, clocks, polling, and basic thread/process lifecycle.
//!
//! Networking syscalls are deliberately *allowed by the filter* - the
//! network policy is enforced by the absence of interfaces inside the
//! namespace, not by the filter, so a blocked `socket()` can never be
//! mistaken for the policy working.
//!
//! Anything not listed is denied: the mismatch action kills the process.

use serde_json::json;
use thiserror::Error;

/// Allow-listed syscall names, used for the container runtime profile.
///
/// Grouped roughly by concern. The runtime resolves names per
/// architecture, so this list is portable even though the BPF rendering
/// below is x86_64-specific.
pub const ALLOWED_SYSCALLS: &[&str] = &[
    // File I/O
    "read", "write", "readv", "writev", "pread64", "pwrite64", "openat", "openat2", "close",
    "close_range", "lseek", "fstat", "newfstatat", "statx", "faccessat", "faccessat2", "access",
    "getdents64", "readlink", "readlinkat", "fcntl", "flock", "fsync", "fdatasync", "ftruncate",
    "dup", "dup2", "dup3", "pipe", "pipe2", "ioctl", "umask", "getcwd", "chdir", "fchdir",
    "mkdirat", "unlinkat", "renameat", "renameat2",
    // Memory
    "mmap", "munmap", "mprotect", "mremap", "brk", "madvise", "mincore", "msync", "membarrier",
    // Signals
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigaltstack", "kill", "tgkill",
    // Synchronization
    "futex", "futex_waitv", "set_robust_list", "get_robust_list", "rseq",
    // Clocks and timers
    "clock_gettime", "clock_getres", "clock_nanosleep", "nanosleep", "gettimeofday", "getitimer",
    "setitimer", "timer_create", "timer_settime", "timer_delete", "timerfd_create",
    "timerfd_settime",
    // Polling
    "poll", "ppoll", "select", "pselect6", "epoll_create", "epoll_create1", "epoll_ctl",
    "epoll_wait", "epoll_pwait", "eventfd2",
    // Process and thread lifecycle
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "exit", "exit_group", "wait4",
    "waitid", "set_tid_address", "gettid", "getpid", "getppid", "sched_yield",
    "sched_getaffinity", "arch_prctl", "prlimit64", "getrlimit", "getrusage",
    // Identity reads (no setters)
    "getuid", "geteuid", "getgid", "getegid", "getgroups", "uname", "getrandom",
    // Networking: allowed by filter, neutralized by the empty namespace
    "socket", "connect", "bind", "listen", "accept", "accept4", "sendto", "recvfrom", "sendmsg",
    "recvmsg", "getsockname", "getpeername", "setsockopt", "getsockopt", "socketpair", "shutdown",
];

/// Renders the allow-list as a container-runtime seccomp profile.
///
/// Default action is `SCMP_ACT_ERRNO` (EPERM) rather than a hard kill:
/// interpreters probe optional syscalls at startup, and a clean error
/// keeps them on their fallback paths.
#[must_use]
pub fn runtime_profile_json() -> serde_json::Value {
    json!({
        "defaultAction": "SCMP_ACT_ERRNO",
        "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_AARCH64"],
        "syscalls": [
            {
                "names": ALLOWED_SYSCALLS,
                "action": "SCMP_ACT_ALLOW"
            }
        ]
    })
}

/// Errors from filter compilation or application.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("seccomp error: {message}")]
pub struct SeccompError {
    /// What went wrong.
    pub message: String,
}

impl SeccompError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// x86_64 syscall numbers for the BPF rendering.
// See /usr/include/asm/unistd_64.h or `ausyscall --dump`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod nr {
    pub const ALLOWED: &[i64] = &[
        0,   // read
        1,   // write
        3,   // close
        5,   // fstat
        7,   // poll
        8,   // lseek
        9,   // mmap
        10,  // mprotect
        11,  // munmap
        12,  // brk
        13,  // rt_sigaction
        14,  // rt_sigprocmask
        15,  // rt_sigreturn
        16,  // ioctl
        17,  // pread64
        18,  // pwrite64
        19,  // readv
        20,  // writev
        21,  // access
        22,  // pipe
        23,  // select
        24,  // sched_yield
        25,  // mremap
        26,  // msync
        27,  // mincore
        28,  // madvise
        32,  // dup
        33,  // dup2
        35,  // nanosleep
        36,  // getitimer
        38,  // setitimer
        39,  // getpid
        41,  // socket
        42,  // connect
        43,  // accept
        44,  // sendto
        45,  // recvfrom
        46,  // sendmsg
        47,  // recvmsg
        48,  // shutdown
        49,  // bind
        50,  // listen
        51,  // getsockname
        52,  // getpeername
        53,  // socketpair
        54,  // setsockopt
        55,  // getsockopt
        56,  // clone
        57,  // fork
        58,  // vfork
        59,  // execve
        60,  // exit
        61,  // wait4
        62,  // kill
        63,  // uname
        72,  // fcntl
        73,  // flock
        74,  // fsync
        75,  // fdatasync
        77,  // ftruncate
        79,  // getcwd
        80,  // chdir
        81,  // fchdir
        89,  // readlink
        95,  // umask
        96,  // gettimeofday
        97,  // getrlimit
        98,  // getrusage
        102, // getuid
        104, // getgid
        107, // geteuid
        108, // getegid
        110, // getppid
        115, // getgroups
        131, // sigaltstack
        158, // arch_prctl
        186, // gettid
        202, // futex
        204, // sched_getaffinity
        213, // epoll_create
        217, // getdents64
        218, // set_tid_address
        222, // timer_create
        223, // timer_settime
        226, // timer_delete
        228, // clock_gettime
        229, // clock_getres
        230, // clock_nanosleep
        231, // exit_group
        232, // epoll_wait
        233, // epoll_ctl
        234, // tgkill
        247, // waitid
        257, // openat
        258, // mkdirat
        262, // newfstatat
        263, // unlinkat
        264, // renameat
        270, // pselect6
        271, // ppoll
        273, // set_robust_list
        274, // get_robust_list
        281, // epoll_pwait
        283, // timerfd_create
        286, // timerfd_settime
        288, // accept4
        290, // eventfd2
        291, // epoll_create1
        292, // dup3
        293, // pipe2
        302, // prlimit64
        316, // renameat2
        318, // getrandom
        324, // membarrier
        332, // statx
        334, // rseq
        435, // clone3
        436, // close_range
        437, // openat2
        439, // faccessat2
        449, // futex_waitv
    ];
}

/// A compiled BPF allow-list, ready to apply in a `pre_exec` hook.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub type CompiledFilter = seccompiler::BpfProgram;

/// Compiles the allow-list for the current architecture.
///
/// The mismatch action is `Errno(EPERM)`, matching the runtime profile:
/// deny-by-default without making interpreter feature probes fatal.
///
/// # Errors
///
/// Returns [`SeccompError`] if the filter fails to compile, which means
/// the table itself is inconsistent.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn compile_allowlist() -> Result<CompiledFilter, SeccompError> {
    use std::collections::BTreeMap;

    use seccompiler::{SeccompAction, SeccompFilter, SeccompRule, TargetArch};

    let rules: BTreeMap<i64, Vec<SeccompRule>> =
        nr::ALLOWED.iter().map(|&nr| (nr, Vec::new())).collect();

    let filter = SeccompFilter::new(
        rules,
        // Mismatch: deny with EPERM.
        SeccompAction::Errno(libc_eperm()),
        // Match: allow.
        SeccompAction::Allow,
        TargetArch::x86_64,
    )
    .map_err(|e| SeccompError::new(e.to_string()))?;

    let program: CompiledFilter = filter
        .try_into()
        .map_err(|e| SeccompError::new(format!("{e}")))?;
    Ok(program)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const fn libc_eperm() -> u32 {
    1 // EPERM
}

/// Applies a compiled filter to the current thread (and, via
/// `TSYNC`-less inheritance, to everything subsequently exec'd).
///
/// Must be called between `fork` and `exec`, i.e. inside `pre_exec`.
///
/// # Errors
///
/// Returns [`SeccompError`] if the kernel rejects the program.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn apply_filter(filter: &CompiledFilter) -> Result<(), SeccompError> {
    seccompiler::apply_filter(filter).map_err(|e| SeccompError::new(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_profile_shape() {
        let profile = runtime_profile_json();
        assert_eq!(profile["defaultAction"], "SCMP_ACT_ERRNO");
        let syscalls = profile["syscalls"].as_array().unwrap();
        assert_eq!(syscalls.len(), 1);
        assert_eq!(syscalls[0]["action"], "SCMP_ACT_ALLOW");
        let names = syscalls[0]["names"].as_array().unwrap();
        assert!(names.iter().any(|n| n == "read"));
        assert!(names.iter().any(|n| n == "openat"));
        assert!(names.iter().any(|n| n == "futex"));
        // Networking is allowed by the filter (neutralized by the netns).
        assert!(names.iter().any(|n| n == "socket"));
        // Privilege and mount manipulation is not in the list.
        assert!(!names.iter().any(|n| n == "setuid"));
        assert!(!names.iter().any(|n| n == "mount"));
        assert!(!names.iter().any(|n| n == "ptrace"));
        assert!(!names.iter().any(|n| n == "chroot"));
    }

    #[test]
    fn test_allowlist_has_interpreter_essentials() {
        for essential in ["read", "write", "mmap", "brk", "execve", "exit_group", "clock_gettime"]
        {
            assert!(
                ALLOWED_SYSCALLS.contains(&essential),
                "missing {essential}"
            );
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_compile_allowlist() {
        let filter = compile_allowlist().unwrap();
        assert!(!filter.is_empty());
    }
}
