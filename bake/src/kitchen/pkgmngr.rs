// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-chroot package managers
//!
//! When an ingredient lands in its area, the matching package manager
//! makes it visible to the build: registering metadata inside the chroot
//! and exporting whatever environment the build tools expect. Managers
//! are a small capability set chosen by tag, not a hierarchy.

use std::io;
use std::path::Path;

use fs_err as fs;
use tracing::debug;

use crate::BuildEnv;

/// What a package manager contributes to the kitchen
pub trait PackageManager {
    fn name(&self) -> &'static str;

    /// Register one unpacked ingredient with the chroot
    fn make_available(&self, chroot: &Path, ingredient_dir: &Path) -> io::Result<()>;

    /// Export environment required for the registered ingredients to be
    /// found
    fn add_overrides(&self, env: &mut BuildEnv);
}

/// Select the manager for a tag. Unknown tags fall back to pkgconfig,
/// which covers the C/C++ ecosystem the oven backends target.
pub fn by_tag(tag: &str) -> &'static dyn PackageManager {
    match tag {
        "pkgconfig" | "pkg-config" => &PkgConfig,
        _ => &PkgConfig,
    }
}

/// Symlinks every `.pc` file into `<chroot>/pkgconfig` and points
/// `PKG_CONFIG_PATH` at it
pub struct PkgConfig;

impl PackageManager for PkgConfig {
    fn name(&self) -> &'static str {
        "pkgconfig"
    }

    fn make_available(&self, chroot: &Path, ingredient_dir: &Path) -> io::Result<()> {
        let registry = chroot.join("pkgconfig");
        fs::create_dir_all(&registry)?;

        for pc in crate::util::enumerate_files(ingredient_dir, |path| {
            path.extension().and_then(|e| e.to_str()) == Some("pc")
        })? {
            let Some(name) = pc.file_name() else { continue };
            let link = registry.join(name);

            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
            }
            std::os::unix::fs::symlink(&pc, &link)?;

            debug!("registered {}", pc.display());
        }

        Ok(())
    }

    fn add_overrides(&self, env: &mut BuildEnv) {
        env.set("PKG_CONFIG_PATH", "/pkgconfig");
        // Relocated .pc files carry absolute prefixes from their build
        env.set("PKG_CONFIG_ALLOW_SYSTEM_CFLAGS", "1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_files_are_linked_into_the_registry() {
        let chroot = tempfile::tempdir().unwrap();
        let area = tempfile::tempdir().unwrap();

        fs::create_dir_all(area.path().join("usr/lib/pkgconfig")).unwrap();
        fs::write(area.path().join("usr/lib/pkgconfig/zlib.pc"), "Name: zlib\n").unwrap();
        fs::write(area.path().join("usr/lib/pkgconfig/readme.txt"), "").unwrap();

        PkgConfig.make_available(chroot.path(), area.path()).unwrap();

        let registry = chroot.path().join("pkgconfig");
        assert!(registry.join("zlib.pc").symlink_metadata().unwrap().is_symlink());
        assert!(!registry.join("readme.txt").exists());
    }

    #[test]
    fn overrides_export_the_registry_path() {
        let mut env = BuildEnv::default();

        PkgConfig.add_overrides(&mut env);

        assert_eq!(env.get("PKG_CONFIG_PATH"), Some("/pkgconfig"));
    }

    #[test]
    fn unknown_tags_fall_back() {
        assert_eq!(by_tag("mystery").name(), "pkgconfig");
    }
}
