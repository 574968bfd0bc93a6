// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf};

use recipe::Recipe;

use crate::{host_arch, host_platform, util};

/// Host/guest path pairs for one kitchen.
///
/// Everything host-side lives under
/// `<data-dir>/kitchen/<recipe-uuid>/ns/`; the guest side is the fixed
/// `/chef` layout the container sees.
#[derive(Debug, Clone)]
pub struct Paths {
    kitchen_dir: PathBuf,
    recipe_dir: PathBuf,
    platform: String,
    arch: String,
}

pub struct Mapping {
    pub host: PathBuf,
    pub guest: PathBuf,
}

impl Paths {
    pub fn new(recipe: &Recipe, recipe_path: &std::path::Path, home: impl Into<PathBuf>) -> io::Result<Self> {
        let recipe_dir = recipe_path.parent().unwrap_or(std::path::Path::new(".")).canonicalize()?;

        let paths = Self {
            kitchen_dir: home.into().join(".chef").join("kitchen").join(recipe.project.id.to_string()),
            recipe_dir,
            platform: host_platform().to_owned(),
            arch: host_arch().to_owned(),
        };

        util::ensure_dir_exists(&paths.rootfs().host)?;
        util::ensure_dir_exists(&paths.build().host)?;
        util::ensure_dir_exists(&paths.install().host)?;
        util::ensure_dir_exists(&paths.toolchains().host)?;
        util::ensure_dir_exists(&paths.host_ingredients())?;
        util::ensure_dir_exists(&paths.build_ingredients().host)?;
        util::ensure_dir_exists(&paths.runtime_ingredients().host)?;
        util::ensure_dir_exists(&paths.output_dir())?;

        Ok(paths)
    }

    pub fn kitchen_dir(&self) -> &PathBuf {
        &self.kitchen_dir
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    fn ns(&self) -> PathBuf {
        self.kitchen_dir.join("ns")
    }

    pub fn rootfs(&self) -> Mapping {
        Mapping {
            host: self.ns().join("chroot"),
            guest: "/".into(),
        }
    }

    /// The bound project directory, read-only inside the container
    pub fn project(&self) -> Mapping {
        Mapping {
            host: self.recipe_dir.clone(),
            guest: "/chef/project".into(),
        }
    }

    pub fn install(&self) -> Mapping {
        Mapping {
            host: self.ns().join("install"),
            guest: "/chef/install".into(),
        }
    }

    pub fn build(&self) -> Mapping {
        Mapping {
            host: self.ns().join("build"),
            guest: PathBuf::from("/chef/build").join(&self.platform).join(&self.arch),
        }
    }

    /// Host utilities area, unpacked straight into the chroot
    pub fn host_ingredients(&self) -> PathBuf {
        self.ns().join("ingredients").join("host")
    }

    pub fn build_ingredients(&self) -> Mapping {
        Mapping {
            host: self.ns().join("ingredients").join("build"),
            guest: PathBuf::from("/chef/ingredients").join(&self.platform).join(&self.arch),
        }
    }

    /// Runtime ingredients are staged beside the install tree so the
    /// packer can merge them
    pub fn runtime_ingredients(&self) -> Mapping {
        Mapping {
            host: self.ns().join("ingredients").join("runtime"),
            guest: "/chef/ingredients/runtime".into(),
        }
    }

    pub fn toolchains(&self) -> Mapping {
        Mapping {
            host: self.ns().join("toolchains"),
            guest: "/chef/toolchains".into(),
        }
    }

    /// Finished packs land here
    pub fn output_dir(&self) -> PathBuf {
        self.recipe_dir.clone()
    }

    pub fn recipe_cache(&self) -> PathBuf {
        self.kitchen_dir.join("cache.json")
    }

    /// For the provided [`Mapping`], return the guest path as it lives on
    /// the host fs
    pub fn guest_host_path(&self, mapping: &Mapping) -> PathBuf {
        let relative = mapping.guest.strip_prefix("/").unwrap_or(&mapping.guest);

        self.rootfs().host.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_recipe(dir: &std::path::Path) -> (Recipe, PathBuf) {
        let path = dir.join("recipe.yaml");
        fs_err::write(
            &path,
            r"
id: 1c0e8d5c-41e5-4e2a-b2a7-6d3f1f2f9f10
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

        (recipe::from_slice(&fs_err::read(&path).unwrap()).unwrap(), path)
    }

    #[test]
    fn layout_is_keyed_by_recipe_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let (recipe, path) = sample_recipe(dir.path());

        let paths = Paths::new(&recipe, &path, dir.path().join("home")).unwrap();

        assert!(
            paths
                .kitchen_dir()
                .ends_with(".chef/kitchen/1c0e8d5c-41e5-4e2a-b2a7-6d3f1f2f9f10")
        );
        assert!(paths.rootfs().host.ends_with("ns/chroot"));
        assert_eq!(paths.project().guest, PathBuf::from("/chef/project"));
    }

    #[test]
    fn guest_paths_resolve_under_the_chroot() {
        let dir = tempfile::tempdir().unwrap();
        let (recipe, path) = sample_recipe(dir.path());

        let paths = Paths::new(&recipe, &path, dir.path().join("home")).unwrap();
        let install = paths.install();

        assert_eq!(paths.guest_host_path(&install), paths.rootfs().host.join("chef/install"));
    }
}
