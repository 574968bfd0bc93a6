// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Rootless uid/gid mapping
//!
//! Maps the invoking user to root inside the new user namespace, with the
//! subordinate ranges from `/etc/subuid` / `/etc/subgid` following so
//! package ownership inside the rootfs behaves. Written via the newuidmap
//! helpers when present, falling back to a single-user direct map.

use std::io;
use std::process::Command;

use fs_err as fs;
use nix::unistd::{Gid, Pid, Uid};
use snafu::{ResultExt, Snafu};

/// Established the uid & gid mappings for the spawned container process
pub fn idmap(pid: Pid) -> Result<(), Error> {
    let uid = Uid::effective();
    let gid = Gid::effective();

    let sub_uid = subordinate_range("/etc/subuid", uid.as_raw());
    let sub_gid = subordinate_range("/etc/subgid", gid.as_raw());

    match (sub_uid, sub_gid) {
        (Some(sub_uid), Some(sub_gid)) => {
            // 0 maps to us, 1.. map into the subordinate range
            run_map_helper("newuidmap", pid, uid.as_raw(), sub_uid)?;
            run_map_helper("newgidmap", pid, gid.as_raw(), sub_gid)?;
        }
        _ => {
            direct_map(pid, uid.as_raw(), gid.as_raw())?;
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: u32,
    count: u32,
}

/// First subordinate range granted to `id` in an `/etc/sub[ug]id` file
fn subordinate_range(path: &str, id: u32) -> Option<Range> {
    let content = fs::read_to_string(path).ok()?;

    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        let owner = fields.next()?;

        if owner != id.to_string() {
            return None;
        }

        Some(Range {
            start: fields.next()?.parse().ok()?,
            count: fields.next()?.parse().ok()?,
        })
    })
}

fn run_map_helper(helper: &str, pid: Pid, id: u32, range: Range) -> Result<(), Error> {
    let output = Command::new(helper)
        .args([
            pid.as_raw().to_string(),
            // root inside the namespace is the invoking user
            "0".into(),
            id.to_string(),
            "1".into(),
            // everything else comes from the subordinate range
            "1".into(),
            range.start.to_string(),
            range.count.to_string(),
        ])
        .output()
        .with_context(|_| HelperSnafu { helper: helper.to_owned() })?;

    if !output.status.success() {
        return Err(Error::HelperFailed {
            helper: helper.to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

/// Single-user mapping written directly into procfs. `setgroups` must be
/// denied before an unprivileged gid_map write is accepted.
fn direct_map(pid: Pid, uid: u32, gid: u32) -> Result<(), Error> {
    let proc = format!("/proc/{pid}");

    fs::write(format!("{proc}/uid_map"), format!("0 {uid} 1")).context(ProcSnafu)?;
    fs::write(format!("{proc}/setgroups"), "deny").context(ProcSnafu)?;
    fs::write(format!("{proc}/gid_map"), format!("0 {gid} 1")).context(ProcSnafu)?;

    Ok(())
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("spawn {helper}"))]
    Helper { helper: String, source: io::Error },
    #[snafu(display("{helper}: {stderr}"))]
    HelperFailed { helper: String, stderr: String },
    #[snafu(display("write proc mapping"))]
    Proc { source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subordinate_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subuid");
        fs::write(&path, "someone:100000:65536\n1000:165536:65536\n").unwrap();

        let range = subordinate_range(path.to_str().unwrap(), 1000).unwrap();
        assert_eq!((range.start, range.count), (165_536, 65_536));

        assert!(subordinate_range(path.to_str().unwrap(), 42).is_none());
    }
}
