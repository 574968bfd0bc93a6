// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cgroup v2 confinement
//!
//! Each started container gets a leaf under `chef-cvd` in the unified
//! hierarchy. The cgroup's kernfs inode doubles as the policy map key for
//! the BPF-LSM path rules.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use fs_err as fs;
use nix::unistd::Pid;
use snafu::{ResultExt, Snafu};

use crate::Quota;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PARENT: &str = "chef-cvd";

/// Microseconds per period used for `cpu.max`
const CPU_PERIOD: u64 = 100_000;

#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    id: u64,
}

impl Cgroup {
    /// Create the container's cgroup and apply quotas
    pub fn create(name: &str, quota: Quota) -> Result<Self, Error> {
        let path = PathBuf::from(CGROUP_ROOT).join(PARENT).join(name);
        fs::create_dir_all(&path).context(CreateSnafu)?;

        if let Some(percent) = quota.cpu_percent {
            let max = CPU_PERIOD * u64::from(percent) / 100;
            fs::write(path.join("cpu.max"), format!("{max} {CPU_PERIOD}")).context(LimitSnafu)?;
        }

        if let Some(bytes) = quota.memory_bytes {
            fs::write(path.join("memory.max"), bytes.to_string()).context(LimitSnafu)?;
        }

        let id = fs::metadata(&path).context(CreateSnafu)?.ino();

        Ok(Self { path, id })
    }

    /// The cgroup id used as a policy map key component
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Move a process into this cgroup
    pub fn add_pid(&self, pid: Pid) -> Result<(), Error> {
        fs::write(self.path.join("cgroup.procs"), pid.as_raw().to_string()).context(AttachSnafu)
    }

    /// Remove the cgroup. Fails while member processes remain.
    pub fn destroy(self) -> Result<(), Error> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Remove { source: e }),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("create cgroup"))]
    Create { source: io::Error },
    #[snafu(display("apply cgroup limit"))]
    Limit { source: io::Error },
    #[snafu(display("attach process to cgroup"))]
    Attach { source: io::Error },
    #[snafu(display("remove cgroup"))]
    Remove { source: io::Error },
}
