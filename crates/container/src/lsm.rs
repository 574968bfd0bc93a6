// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! BPF-LSM policy map management
//!
//! One manager exists per daemon process. It owns the pinned hash map at
//! `/sys/fs/bpf/cvd/policy_map` consumed by the LSM enforcement program;
//! containers hold only their cgroup id as a handle into it. Keys resolve
//! `(dev, ino)` inside the container rootfs so a symlink cannot rebind a
//! rule onto a host inode. When the kernel lacks BPF-LSM the engine falls
//! back to seccomp-only confinement; that is never fatal.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fs_err as fs;
use protecc::{Permissions, Profile};
use snafu::{ResultExt, Snafu};

pub const PIN_PATH: &str = "/sys/fs/bpf/cvd/policy_map";
pub const MAX_ENTRIES: u32 = 10_240;

const LSM_LIST: &str = "/sys/kernel/security/lsm";

// bpf(2) commands
const BPF_MAP_CREATE: i32 = 0;
const BPF_MAP_UPDATE_ELEM: i32 = 2;
const BPF_MAP_DELETE_ELEM: i32 = 3;
const BPF_MAP_GET_NEXT_KEY: i32 = 4;
const BPF_OBJ_PIN: i32 = 6;
const BPF_OBJ_GET: i32 = 7;

const BPF_MAP_TYPE_HASH: u32 = 1;
const BPF_ANY: u64 = 0;

/// Policy map key: which file, seen from which container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolicyKey {
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolicyValue {
    pub allow_mask: u32,
}

/// Owns the pinned policy map for the daemon's lifetime
#[derive(Debug)]
pub struct PolicyManager {
    map: OwnedFd,
}

impl PolicyManager {
    /// Open the pinned map, creating and pinning it when absent. Returns
    /// `None` when the kernel cannot enforce BPF-LSM policy; callers run
    /// seccomp-only in that case.
    pub fn open() -> Result<Option<Self>, Error> {
        if !available() {
            tracing::info!("bpf-lsm unavailable, falling back to seccomp-only confinement");
            return Ok(None);
        }

        let map = match obj_get(PIN_PATH) {
            Ok(fd) => fd,
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                let fd = map_create()?;
                if let Some(parent) = Path::new(PIN_PATH).parent() {
                    fs::create_dir_all(parent).context(PinDirSnafu)?;
                }
                obj_pin(PIN_PATH, &fd)?;
                fd
            }
            Err(e) => return Err(Error::Open { errno: e }),
        };

        Ok(Some(Self { map }))
    }

    /// True when the running kernel can take BPF-LSM policy: 5.7 or newer
    /// with `bpf` in the boot-time LSM list
    pub fn kernel_supported() -> bool {
        available()
    }

    /// Resolve every profile path inside `rootfs` and install its mask for
    /// `cgroup_id`. Existing entries for the same key are replaced.
    /// Returns the number of entries installed.
    pub fn populate(&self, cgroup_id: u64, rootfs: &Path, profile: &Profile) -> Result<usize, Error> {
        let mut installed = 0;

        let mut stack = vec![rootfs.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else { continue };

                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }

                // Match on the container-visible path
                let visible = Path::new("/").join(path.strip_prefix(rootfs).unwrap_or(&path));
                let Some(granted) = profile.granted(&visible.to_string_lossy()) else {
                    continue;
                };

                // dev/ino from the rootfs side, symlinks unresolved
                self.insert(
                    PolicyKey {
                        cgroup_id,
                        dev: meta.dev(),
                        ino: meta.ino(),
                    },
                    PolicyValue { allow_mask: granted.0 },
                )?;
                installed += 1;
            }
        }

        Ok(installed)
    }

    /// Insert or replace one entry
    pub fn insert(&self, key: PolicyKey, value: PolicyValue) -> Result<(), Error> {
        let mut attr = MapElemAttr {
            map_fd: self.map.as_raw_fd() as u32,
            _pad: 0,
            key: &key as *const PolicyKey as u64,
            value_or_next: &value as *const PolicyValue as u64,
            flags: BPF_ANY,
        };

        match bpf(BPF_MAP_UPDATE_ELEM, &mut attr) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::E2BIG) => Err(Error::MapFull),
            Err(e) => Err(Error::Update { errno: e }),
        }
    }

    /// Delete every entry keyed by `cgroup_id`. Enumerates the whole map
    /// with `GET_NEXT_KEY`; deletions restart the walk since removal
    /// invalidates the iteration cursor.
    pub fn remove_container(&self, cgroup_id: u64) -> Result<usize, Error> {
        let mut removed = 0;

        'restart: loop {
            let mut cursor: Option<PolicyKey> = None;

            loop {
                let Some(next) = self.next_key(cursor.as_ref())? else {
                    return Ok(removed);
                };

                if next.cgroup_id == cgroup_id {
                    self.delete(&next)?;
                    removed += 1;
                    continue 'restart;
                }

                cursor = Some(next);
            }
        }
    }

    fn delete(&self, key: &PolicyKey) -> Result<(), Error> {
        let mut attr = MapElemAttr {
            map_fd: self.map.as_raw_fd() as u32,
            _pad: 0,
            key: key as *const PolicyKey as u64,
            value_or_next: 0,
            flags: 0,
        };

        match bpf(BPF_MAP_DELETE_ELEM, &mut attr) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(Error::Update { errno: e }),
        }
    }

    fn next_key(&self, after: Option<&PolicyKey>) -> Result<Option<PolicyKey>, Error> {
        let mut next = PolicyKey {
            cgroup_id: 0,
            dev: 0,
            ino: 0,
        };

        let mut attr = MapElemAttr {
            map_fd: self.map.as_raw_fd() as u32,
            _pad: 0,
            key: after.map(|k| k as *const PolicyKey as u64).unwrap_or(0),
            value_or_next: &mut next as *mut PolicyKey as u64,
            flags: 0,
        };

        match bpf(BPF_MAP_GET_NEXT_KEY, &mut attr) {
            Ok(_) => Ok(Some(next)),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err(e) => Err(Error::Update { errno: e }),
        }
    }
}

/// Kernel 5.7+ with `bpf` in the active LSM list
fn available() -> bool {
    kernel_at_least(5, 7) && lsm_list_contains_bpf()
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    let Ok(uname) = nix::sys::utsname::uname() else {
        return false;
    };

    parse_release(&uname.release().to_string_lossy())
        .map(|(maj, min)| (maj, min) >= (major, minor))
        .unwrap_or(false)
}

fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn lsm_list_contains_bpf() -> bool {
    fs::read_to_string(LSM_LIST)
        .map(|list| list.trim().split(',').any(|lsm| lsm == "bpf"))
        .unwrap_or(false)
}

/// Attribute union layout for map element commands
#[repr(C, align(8))]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value_or_next: u64,
    flags: u64,
}

#[repr(C, align(8))]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C, align(8))]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn map_create() -> Result<OwnedFd, Error> {
    let mut attr = MapCreateAttr {
        map_type: BPF_MAP_TYPE_HASH,
        key_size: std::mem::size_of::<PolicyKey>() as u32,
        value_size: std::mem::size_of::<PolicyValue>() as u32,
        max_entries: MAX_ENTRIES,
        map_flags: 0,
    };

    let fd = bpf(BPF_MAP_CREATE, &mut attr).map_err(|errno| Error::Create { errno })?;

    // SAFETY: a successful BPF_MAP_CREATE returns a fresh descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn obj_pin(path: &str, fd: &OwnedFd) -> Result<(), Error> {
    let path = std::ffi::CString::new(path).expect("pin path has no interior nul");

    let mut attr = ObjAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: fd.as_raw_fd() as u32,
        file_flags: 0,
    };

    bpf(BPF_OBJ_PIN, &mut attr).map_err(|errno| Error::Pin { errno })?;
    Ok(())
}

fn obj_get(path: &str) -> io::Result<OwnedFd> {
    let path = std::ffi::CString::new(path).expect("pin path has no interior nul");

    let mut attr = ObjAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };

    let fd = bpf(BPF_OBJ_GET, &mut attr)?;

    // SAFETY: a successful BPF_OBJ_GET returns a fresh descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn bpf<T>(cmd: i32, attr: &mut T) -> io::Result<i64> {
    // SAFETY: attr is a live, zero-padded attribute struct of the size we
    // report
    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("open pinned policy map: {errno}"))]
    Open { errno: io::Error },
    #[snafu(display("create policy map: {errno}"))]
    Create { errno: io::Error },
    #[snafu(display("create pin directory"))]
    PinDir { source: io::Error },
    #[snafu(display("pin policy map: {errno}"))]
    Pin { errno: io::Error },
    #[snafu(display("policy map is full"))]
    MapFull,
    #[snafu(display("policy map operation: {errno}"))]
    Update { errno: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_the_map_abi() {
        assert_eq!(std::mem::size_of::<PolicyKey>(), 24);
        assert_eq!(std::mem::size_of::<PolicyValue>(), 4);
    }

    #[test]
    fn release_parsing() {
        assert_eq!(parse_release("6.8.0-41-generic"), Some((6, 8)));
        assert_eq!(parse_release("5.7.19"), Some((5, 7)));
        assert_eq!(parse_release("garbage"), None);

        assert!((6, 8) >= (5, 7));
        assert!((5, 6) < (5, 7));
    }
}
