// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Joining a running container
//!
//! A helper process enters every namespace of the container init through
//! its procfs handles, in the same fixed order the namespaces were
//! created, then chdirs and execs the requested command. On success this
//! never returns; failures surface through the exit code.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fs_err as fs;
use nix::sched::{CloneFlags, setns};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, execvp, fork};
use snafu::{ResultExt, Snafu};

use crate::control;

/// Namespace entry order mirrors creation order
const NAMESPACES: &[(&str, CloneFlags)] = &[
    ("user", CloneFlags::CLONE_NEWUSER),
    ("mnt", CloneFlags::CLONE_NEWNS),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("net", CloneFlags::CLONE_NEWNET),
];

/// Enter the container and exec `command` with `arguments` from
/// `work_dir`. The process image is replaced (or the process exits with
/// the child's code when a pid namespace is involved).
pub fn join(container_id: &str, command: &str, arguments: &[String], work_dir: &Path) -> Result<Infallible, Error> {
    let pid = control::query_pid(container_id).context(ControlSnafu)?;

    enter_namespaces(pid)?;

    std::env::set_current_dir(work_dir).context(ChdirSnafu)?;

    descend_into_pid_namespace().context(DescendSnafu)?;

    let command = CString::new(command).map_err(|_| Error::BadCommand)?;
    let mut argv = vec![command.clone()];
    argv.extend(
        arguments
            .iter()
            .map(|a| CString::new(a.as_str()).map_err(|_| Error::BadCommand))
            .collect::<Result<Vec<_>, _>>()?,
    );

    execvp(&command, &argv).context(ExecSnafu)?;
    unreachable!("execvp returned without error")
}

/// setns into each of the init's namespaces, skipping ones we already
/// occupy (a rootful container shares our user namespace).
///
/// Every handle is opened before the first setns: entering the mount
/// namespace swaps procfs underneath us, and the container's procfs does
/// not know the init's host pid.
pub(crate) fn enter_namespaces(pid: u32) -> Result<(), Error> {
    let mut handles = Vec::with_capacity(NAMESPACES.len());

    for (name, flag) in NAMESPACES {
        let target = format!("/proc/{pid}/ns/{name}");
        let own = format!("/proc/self/ns/{name}");

        let same = match (fs::metadata(&target), fs::metadata(&own)) {
            (Ok(a), Ok(b)) => a.ino() == b.ino() && a.dev() == b.dev(),
            _ => false,
        };
        if same {
            continue;
        }

        let handle = fs::File::open(&target).with_context(|_| OpenNamespaceSnafu { name: *name })?;
        handles.push((*name, *flag, handle));
    }

    for (name, flag, handle) in handles {
        setns(handle.file(), flag).with_context(|_| EnterNamespaceSnafu { name })?;
    }

    Ok(())
}

/// A pid namespace entered with setns only applies to children created
/// afterwards, so fork once: the child carries on towards its exec, this
/// process waits and relays the child's exit verbatim.
pub(crate) fn descend_into_pid_namespace() -> std::io::Result<()> {
    // SAFETY: callers are single-threaded helpers or freshly forked
    // pre-exec children
    match unsafe { fork() }.map_err(std::io::Error::other)? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => {
            let code = match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
                _ => 1,
            };
            // SAFETY: plain process exit without unwinding the forked state
            unsafe { libc::_exit(code) }
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("control socket"))]
    Control { source: control::Error },
    #[snafu(display("open {name} namespace handle"))]
    OpenNamespace { name: &'static str, source: std::io::Error },
    #[snafu(display("enter {name} namespace"))]
    EnterNamespace { name: &'static str, source: nix::Error },
    #[snafu(display("chdir into requested working directory"))]
    Chdir { source: std::io::Error },
    #[snafu(display("command contains a nul byte"))]
    BadCommand,
    #[snafu(display("descend into pid namespace"))]
    Descend { source: std::io::Error },
    #[snafu(display("exec"))]
    Exec { source: nix::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_order_is_fixed() {
        let names: Vec<&str> = NAMESPACES.iter().map(|(name, _)| *name).collect();

        assert_eq!(names, vec!["user", "mnt", "uts", "ipc", "pid", "net"]);
    }
}
