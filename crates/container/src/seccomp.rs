// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Seccomp confinement
//!
//! A classic-BPF filter assembled at container start: unknown syscalls
//! fail with `EPERM`, everything a build environment legitimately needs
//! is enumerated. The filter is installed after the pivot, as the last
//! setup action before the payload runs.

use snafu::Snafu;

// BPF opcodes
const LD_W_ABS: u16 = 0x20;
const JEQ_K: u16 = 0x15;
const RET_K: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// offsets into struct seccomp_data
const DATA_NR: u32 = 0;
const DATA_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xC000_003E;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xC000_00B7;

/// Install the allowlist filter on the calling thread. Applies
/// `no_new_privs` first, as the kernel requires for unprivileged filters.
pub fn install_allowlist() -> Result<(), Error> {
    let program = build_program(&allowlist());

    let prog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };

    // SAFETY: prog points at a live, correctly sized filter array
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(Error::NoNewPrivs {
            errno: std::io::Error::last_os_error(),
        });
    }

    let rc = unsafe { libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &prog) };
    if rc != 0 {
        return Err(Error::InstallFilter {
            errno: std::io::Error::last_os_error(),
        });
    }

    Ok(())
}

/// Assemble the filter: arch guard, then one equality check per allowed
/// syscall, then the deny verdict
fn build_program(allowed: &[u32]) -> Vec<libc::sock_filter> {
    let n = allowed.len() as u8;

    let mut program = vec![
        stmt(LD_W_ABS, DATA_ARCH),
        // Foreign-arch callers go straight to the deny verdict
        jump(JEQ_K, AUDIT_ARCH, 0, n + 1),
        stmt(LD_W_ABS, DATA_NR),
    ];

    for (i, nr) in allowed.iter().enumerate() {
        program.push(jump(JEQ_K, *nr, n - i as u8, 0));
    }

    program.push(stmt(RET_K, SECCOMP_RET_ERRNO | libc::EPERM as u32));
    program.push(stmt(RET_K, SECCOMP_RET_ALLOW));

    program
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Syscalls a confined build may issue
fn allowlist() -> Vec<u32> {
    let mut list: Vec<usize> = vec![
        nc::SYS_READ,
        nc::SYS_WRITE,
        nc::SYS_READV,
        nc::SYS_WRITEV,
        nc::SYS_PREAD64,
        nc::SYS_PWRITE64,
        nc::SYS_CLOSE,
        nc::SYS_OPENAT,
        nc::SYS_FSTAT,
        nc::SYS_NEWFSTATAT,
        nc::SYS_STATX,
        nc::SYS_LSEEK,
        nc::SYS_MMAP,
        nc::SYS_MPROTECT,
        nc::SYS_MUNMAP,
        nc::SYS_MREMAP,
        nc::SYS_MSYNC,
        nc::SYS_MADVISE,
        nc::SYS_BRK,
        nc::SYS_RT_SIGACTION,
        nc::SYS_RT_SIGPROCMASK,
        nc::SYS_RT_SIGRETURN,
        nc::SYS_SIGALTSTACK,
        nc::SYS_IOCTL,
        nc::SYS_PPOLL,
        nc::SYS_PSELECT6,
        nc::SYS_SCHED_YIELD,
        nc::SYS_SCHED_GETAFFINITY,
        nc::SYS_DUP,
        nc::SYS_DUP3,
        nc::SYS_PIPE2,
        nc::SYS_NANOSLEEP,
        nc::SYS_CLOCK_NANOSLEEP,
        nc::SYS_CLOCK_GETTIME,
        nc::SYS_CLOCK_GETRES,
        nc::SYS_GETPID,
        nc::SYS_GETPPID,
        nc::SYS_GETTID,
        nc::SYS_SOCKET,
        nc::SYS_CONNECT,
        nc::SYS_ACCEPT,
        nc::SYS_ACCEPT4,
        nc::SYS_SENDTO,
        nc::SYS_RECVFROM,
        nc::SYS_SENDMSG,
        nc::SYS_RECVMSG,
        nc::SYS_SHUTDOWN,
        nc::SYS_BIND,
        nc::SYS_LISTEN,
        nc::SYS_GETSOCKNAME,
        nc::SYS_GETPEERNAME,
        nc::SYS_SOCKETPAIR,
        nc::SYS_SETSOCKOPT,
        nc::SYS_GETSOCKOPT,
        nc::SYS_CLONE,
        nc::SYS_EXECVE,
        nc::SYS_EXECVEAT,
        nc::SYS_EXIT,
        nc::SYS_EXIT_GROUP,
        nc::SYS_WAIT4,
        nc::SYS_WAITID,
        nc::SYS_KILL,
        nc::SYS_TGKILL,
        nc::SYS_UNAME,
        nc::SYS_FCNTL,
        nc::SYS_FLOCK,
        nc::SYS_FSYNC,
        nc::SYS_FDATASYNC,
        nc::SYS_TRUNCATE,
        nc::SYS_FTRUNCATE,
        nc::SYS_FALLOCATE,
        nc::SYS_GETDENTS64,
        nc::SYS_GETCWD,
        nc::SYS_CHDIR,
        nc::SYS_FCHDIR,
        nc::SYS_RENAMEAT2,
        nc::SYS_MKDIRAT,
        nc::SYS_LINKAT,
        nc::SYS_UNLINKAT,
        nc::SYS_SYMLINKAT,
        nc::SYS_READLINKAT,
        nc::SYS_FCHMOD,
        nc::SYS_FCHMODAT,
        nc::SYS_FCHOWN,
        nc::SYS_FCHOWNAT,
        nc::SYS_FACCESSAT,
        nc::SYS_UMASK,
        nc::SYS_GETRUSAGE,
        nc::SYS_SYSINFO,
        nc::SYS_TIMES,
        nc::SYS_GETUID,
        nc::SYS_GETGID,
        nc::SYS_GETEUID,
        nc::SYS_GETEGID,
        nc::SYS_SETPGID,
        nc::SYS_GETPGID,
        nc::SYS_SETSID,
        nc::SYS_GETGROUPS,
        nc::SYS_SETGROUPS,
        nc::SYS_CAPGET,
        nc::SYS_CAPSET,
        nc::SYS_UTIMENSAT,
        nc::SYS_FUTEX,
        nc::SYS_SET_TID_ADDRESS,
        nc::SYS_SET_ROBUST_LIST,
        nc::SYS_GET_ROBUST_LIST,
        nc::SYS_EPOLL_CREATE1,
        nc::SYS_EPOLL_CTL,
        nc::SYS_EPOLL_PWAIT,
        nc::SYS_EVENTFD2,
        nc::SYS_SIGNALFD4,
        nc::SYS_TIMERFD_CREATE,
        nc::SYS_TIMERFD_SETTIME,
        nc::SYS_TIMERFD_GETTIME,
        nc::SYS_INOTIFY_INIT1,
        nc::SYS_INOTIFY_ADD_WATCH,
        nc::SYS_INOTIFY_RM_WATCH,
        nc::SYS_PRCTL,
        nc::SYS_PRLIMIT64,
        nc::SYS_GETRANDOM,
        nc::SYS_MEMFD_CREATE,
        nc::SYS_COPY_FILE_RANGE,
        nc::SYS_SENDFILE,
        nc::SYS_SPLICE,
        nc::SYS_TEE,
        nc::SYS_STATFS,
        nc::SYS_FSTATFS,
        nc::SYS_READAHEAD,
    ];

    #[cfg(target_arch = "x86_64")]
    list.extend([
        nc::SYS_OPEN,
        nc::SYS_STAT,
        nc::SYS_LSTAT,
        nc::SYS_ACCESS,
        nc::SYS_POLL,
        nc::SYS_SELECT,
        nc::SYS_PIPE,
        nc::SYS_DUP2,
        nc::SYS_FORK,
        nc::SYS_VFORK,
        nc::SYS_RENAME,
        nc::SYS_MKDIR,
        nc::SYS_RMDIR,
        nc::SYS_CREAT,
        nc::SYS_LINK,
        nc::SYS_UNLINK,
        nc::SYS_SYMLINK,
        nc::SYS_READLINK,
        nc::SYS_CHMOD,
        nc::SYS_CHOWN,
        nc::SYS_LCHOWN,
        nc::SYS_GETTIMEOFDAY,
        nc::SYS_ARCH_PRCTL,
        nc::SYS_EPOLL_WAIT,
        nc::SYS_UTIME,
    ]);

    list.into_iter().map(|nr| nr as u32).collect()
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("prctl(no_new_privs): {errno}"))]
    NoNewPrivs { errno: std::io::Error },
    #[snafu(display("install seccomp filter: {errno}"))]
    InstallFilter { errno: std::io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_shape() {
        let allowed = allowlist();
        let program = build_program(&allowed);

        // arch load + guard + nr load + one check per syscall + two verdicts
        assert_eq!(program.len(), allowed.len() + 5);

        // Every check jumps inside the program
        for (i, instr) in program.iter().enumerate() {
            if instr.code == JEQ_K {
                assert!(i + 1 + (instr.jt as usize) < program.len());
                assert!(i + 1 + (instr.jf as usize) < program.len());
            }
        }

        // Last two instructions are deny then allow
        assert_eq!(program[program.len() - 2].k, SECCOMP_RET_ERRNO | libc::EPERM as u32);
        assert_eq!(program[program.len() - 1].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn every_check_targets_the_allow_verdict() {
        let allowed = allowlist();
        let program = build_program(&allowed);
        let allow_index = program.len() - 1;

        for (i, instr) in program.iter().enumerate().skip(3).take(allowed.len()) {
            assert_eq!(i + 1 + instr.jt as usize, allow_index);
        }
    }
}
