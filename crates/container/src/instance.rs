// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A started container, owned by the daemon
//!
//! Operations enter the init's namespaces through procfs. Script and
//! spawn failures leave the container running; destruction is idempotent
//! and releases bind mounts in reverse declaration order.

use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::mount::{MntFlags, umount2};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use snafu::{ResultExt, Snafu};

use crate::cgroup::Cgroup;
use crate::lsm::PolicyManager;
use crate::{Bind, control, join};

pub struct Instance {
    id: String,
    pid: Pid,
    root: PathBuf,
    binds: Vec<Bind>,
    cgroup: Option<Cgroup>,
    policy_entries: usize,
    destroyed: bool,
}

impl Instance {
    pub(crate) fn new(
        id: String,
        pid: Pid,
        root: PathBuf,
        binds: Vec<Bind>,
        cgroup: Option<Cgroup>,
        policy_entries: usize,
    ) -> Self {
        Self {
            id,
            pid,
            root,
            binds,
            cgroup,
            policy_entries,
            destroyed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn cgroup_id(&self) -> Option<u64> {
        self.cgroup.as_ref().map(Cgroup::id)
    }

    /// Number of policy map entries installed at creation
    pub fn policy_entries(&self) -> usize {
        self.policy_entries
    }

    /// Write `script` into the rootfs with mode 0755 and run it through
    /// `/bin/sh`, streaming each output line to `on_line`. The exit code
    /// propagates verbatim.
    pub fn script(&self, script: &str, on_line: impl FnMut(&str) + Send) -> Result<i32, Error> {
        use std::os::unix::fs::PermissionsExt;

        let name = format!(".chef-script-{}", std::process::id());
        let host_path = self.root.join(&name);

        fs_err::write(&host_path, script).context(ScriptWriteSnafu)?;
        fs_err::set_permissions(&host_path, std::fs::Permissions::from_mode(0o755)).context(ScriptWriteSnafu)?;

        let result = self.exec(
            &["/bin/sh".into(), format!("/{name}")],
            Some(Path::new("/")),
            &[],
            on_line,
        );

        let _ = fs_err::remove_file(&host_path);

        result
    }

    /// Run a command inside the container, streaming output lines. The
    /// returned value is the command's exit code.
    pub fn exec(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        mut on_line: impl FnMut(&str) + Send,
    ) -> Result<i32, Error> {
        let (program, arguments) = command.split_first().ok_or(Error::EmptyCommand)?;

        let pid = self.pid.as_raw() as u32;

        let mut child = Command::new(program);
        child
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in env {
            child.env(key, value);
        }

        let cwd = cwd.map(Path::to_path_buf);
        // The chdir has to happen after the mount namespace switch (a
        // plain current_dir() would resolve on the host), and the payload
        // must be forked after setns so it lands inside the pid namespace
        unsafe {
            child.pre_exec(move || {
                join::enter_namespaces(pid).map_err(std::io::Error::other)?;
                if let Some(cwd) = &cwd {
                    std::env::set_current_dir(cwd)?;
                }
                join::descend_into_pid_namespace()
            });
        }

        let mut child = child.spawn().context(SpawnSnafu)?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        std::thread::scope(|scope| {
            let err_lines = scope.spawn(move || {
                let mut lines = vec![];
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => lines.push(line),
                        Err(_) => break,
                    }
                }
                lines
            });

            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => on_line(&line),
                    Err(_) => break,
                }
            }

            for line in err_lines.join().unwrap_or_default() {
                on_line(&line);
            }
        });

        let status = child.wait().context(SpawnSnafu)?;

        Ok(status.code().unwrap_or(1))
    }

    /// Launch a long-running process inside the container without waiting
    /// for it. Returns the host-visible pid.
    pub fn spawn(&self, command: &[String], cwd: Option<&Path>, env: &[(String, String)]) -> Result<u32, Error> {
        let (program, arguments) = command.split_first().ok_or(Error::EmptyCommand)?;

        let pid = self.pid.as_raw() as u32;
        let cwd = cwd.map(Path::to_path_buf);

        let mut child = Command::new(program);
        child.args(arguments).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        for (key, value) in env {
            child.env(key, value);
        }

        unsafe {
            child.pre_exec(move || {
                join::enter_namespaces(pid).map_err(std::io::Error::other)?;
                if let Some(cwd) = &cwd {
                    std::env::set_current_dir(cwd)?;
                }
                join::descend_into_pid_namespace()
            });
        }

        let child = child.spawn().context(SpawnSnafu)?;

        // The id names the relay process; it lives exactly as long as the
        // payload it forked inside the container
        Ok(child.id())
    }

    /// Copy a host file into the container rootfs
    pub fn upload(&self, host_path: &Path, container_path: &Path) -> Result<(), Error> {
        let relative = container_path.strip_prefix("/").unwrap_or(container_path);
        let dest = self.root.join(relative);

        if let Some(parent) = dest.parent() {
            fs_err::create_dir_all(parent).context(UploadSnafu)?;
        }

        fs_err::copy(host_path, &dest).context(UploadSnafu)?;

        Ok(())
    }

    /// Read a small file out of the container rootfs
    pub fn read_file(&self, container_path: &Path) -> Result<Vec<u8>, Error> {
        let relative = container_path.strip_prefix("/").unwrap_or(container_path);
        let mut file = fs_err::File::open(self.root.join(relative)).context(UploadSnafu)?;

        let mut bytes = vec![];
        file.read_to_end(&mut bytes).context(UploadSnafu)?;

        Ok(bytes)
    }

    /// Bind targets in reverse declaration order, as they are released
    pub fn unmount_plan(&self) -> Vec<PathBuf> {
        self.binds
            .iter()
            .rev()
            .map(|bind| {
                self.root
                    .join(bind.target.strip_prefix("/").unwrap_or(&bind.target))
            })
            .collect()
    }

    /// Stop the container and release everything it held. Idempotent; a
    /// second call is a no-op.
    pub fn destroy(&mut self, policy: Option<&PolicyManager>) -> Result<(), Error> {
        if self.destroyed {
            return Ok(());
        }

        // Ask the parked init to exit, fall back to the hammer
        if control::shutdown(&self.id).is_err() {
            let _ = kill(self.pid, Signal::SIGKILL);
        }
        let _ = waitpid(self.pid, None);

        // Namespace-local mounts died with the init; release any that are
        // visible from this side, reverse declaration order
        for target in self.unmount_plan() {
            let _ = umount2(&target, MntFlags::MNT_DETACH);
        }

        let _ = control::remove_socket(&self.id);

        if let (Some(manager), Some(cgroup_id)) = (policy, self.cgroup_id()) {
            manager.remove_container(cgroup_id).context(PolicySnafu)?;
        }

        if let Some(cgroup) = self.cgroup.take() {
            let _ = cgroup.destroy();
        }

        self.destroyed = true;

        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("empty command"))]
    EmptyCommand,
    #[snafu(display("write script into rootfs"))]
    ScriptWrite { source: std::io::Error },
    #[snafu(display("spawn inside container"))]
    Spawn { source: std::io::Error },
    #[snafu(display("upload into rootfs"))]
    Upload { source: std::io::Error },
    #[snafu(display("release policy entries"))]
    Policy { source: crate::lsm::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(binds: Vec<Bind>) -> Instance {
        Instance::new(
            "test".into(),
            Pid::from_raw(1),
            PathBuf::from("/srv/chroot"),
            binds,
            None,
            0,
        )
    }

    #[test]
    fn unmount_plan_reverses_declaration_order() {
        let instance = instance(vec![
            Bind {
                source: "/srv/a".into(),
                target: "/a".into(),
                read_only: true,
            },
            Bind {
                source: "/srv/b".into(),
                target: "/b".into(),
                read_only: false,
            },
        ]);

        assert_eq!(
            instance.unmount_plan(),
            vec![PathBuf::from("/srv/chroot/b"), PathBuf::from("/srv/chroot/a")]
        );
    }
}
