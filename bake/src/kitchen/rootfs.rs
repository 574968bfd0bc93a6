// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Chroot bootstrap
//!
//! Builds the minimal POSIX skeleton every kitchen chroot needs before
//! ingredients land: directory tree, identity files, and the `bakectl`
//! helper the in-container tooling expects at `/usr/bin/bakectl`.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use fs_err as fs;
use thiserror::Error;
use tracing::debug;

use crate::Paths;

const SKELETON: &[&str] = &[
    "bin",
    "dev",
    "etc",
    "lib",
    "proc",
    "run",
    "sys",
    "tmp",
    "usr/bin",
    "usr/lib",
    "usr/share",
    "var",
    // Mount points for the kitchen binds
    "chef/project",
    "chef/install",
    "chef/build",
    "chef/ingredients",
    "chef/toolchains",
];

pub fn setup(paths: &Paths) -> Result<(), Error> {
    let chroot = paths.rootfs().host;

    for dir in SKELETON {
        fs::create_dir_all(chroot.join(dir))?;
    }

    // usrmerge-style compatibility links
    ensure_symlink("usr/bin", &chroot.join("bin"))?;
    ensure_symlink("usr/lib", &chroot.join("lib"))?;

    write_identity(&chroot)?;
    install_bakectl(&chroot)?;

    debug!("chroot skeleton ready at {}", chroot.display());

    Ok(())
}

fn write_identity(chroot: &Path) -> Result<(), Error> {
    fs::write(
        chroot.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/sh\nchef:x:1000:1000:chef:/chef:/bin/sh\n",
    )?;
    fs::write(chroot.join("etc/group"), "root:x:0:\nchef:x:1000:\n")?;
    fs::write(chroot.join("etc/hostname"), "chef\n")?;
    fs::write(chroot.join("etc/hosts"), "127.0.0.1 localhost chef\n")?;

    Ok(())
}

/// The helper joins the running build container for nested tool calls,
/// so it must exist inside the rootfs
fn install_bakectl(chroot: &Path) -> Result<(), Error> {
    let target = chroot.join("usr/bin/bakectl");

    let this = std::env::current_exe().map_err(Error::ResolveSelf)?;
    fs::copy(&this, &target)?;
    fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;

    Ok(())
}

fn ensure_symlink(target: &str, link: &Path) -> Result<(), Error> {
    // A populated directory takes precedence over the compat link
    if link.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
        let empty = fs::read_dir(link)?.next().is_none();
        if !empty {
            return Ok(());
        }
        fs::remove_dir(link)?;
    } else if link.symlink_metadata().is_ok() {
        return Ok(());
    }

    std::os::unix::fs::symlink(target, link)?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("resolve bake executable")]
    ResolveSelf(#[source] io::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe::from_str(
            r"
id: 5a3e2c10-0d28-4f93-9f71-2ab1c8e61b09
name: sample
version: 1.0.0
parts:
  - name: sample
    steps:
      - name: build
        type: build
        system: make
",
        )
        .unwrap();
        let recipe_path = dir.path().join("recipe.yaml");
        fs_err::write(&recipe_path, "").unwrap();
        let paths = Paths::new(&recipe, &recipe_path, dir.path().join("home")).unwrap();

        setup(&paths).unwrap();

        let chroot = paths.rootfs().host;
        assert!(chroot.join("usr/bin").is_dir());
        assert!(chroot.join("chef/project").is_dir());
        assert!(chroot.join("tmp").is_dir());
        assert!(fs::read_to_string(chroot.join("etc/passwd")).unwrap().contains("chef:x:1000"));
        assert_eq!(fs::read_link(chroot.join("bin")).unwrap().to_str(), Some("usr/bin"));
        assert!(chroot.join("usr/bin/bakectl").exists());
    }
}
