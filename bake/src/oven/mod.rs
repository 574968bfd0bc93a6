// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Oven backends
//!
//! Each step dispatches on its `system` field to a build-system adapter.
//! Backends compose a shell script from the same backend data; the
//! kitchen runs the script inside the container and streams output back
//! through a line handler.

use std::path::PathBuf;

use thiserror::Error;

use crate::BuildEnv;

mod cmake;
mod configure;
mod make;
mod meson;
mod script;

/// Everything a backend may draw on when composing its script
#[derive(Debug, Clone)]
pub struct BackendData {
    /// Project sources, as seen inside the container
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub install_dir: PathBuf,
    pub toolchains_dir: PathBuf,
    pub build_ingredients_dir: PathBuf,
    pub platform: String,
    pub arch: String,
    pub recipe_name: String,
    /// Raw arguments string from the step
    pub arguments: String,
    pub env: BuildEnv,
    pub in_tree: bool,
    pub parallel: bool,
    pub jobs: usize,
}

impl BackendData {
    /// Where the build actually runs
    pub fn work_dir(&self) -> &PathBuf {
        if self.in_tree { &self.source_dir } else { &self.build_dir }
    }
}

/// Compose the shell script for one step
pub fn script_for(system: &str, data: &BackendData) -> Result<String, Error> {
    let body = match system {
        "cmake" => cmake::compose(data),
        "meson" => meson::compose(data),
        "make" => make::compose(data),
        "configure" => configure::compose(data),
        "script" => script::compose(data),
        _ => {
            return Err(Error::UnknownBackend {
                system: system.to_owned(),
            });
        }
    };

    Ok(format!("#!/bin/sh\nset -e\n{}\n{body}", data.env.script_prelude()))
}

/// Platform specific install prefix for produced artifacts
pub(crate) fn install_prefix(data: &BackendData) -> String {
    format!("{}/usr", data.install_dir.display())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown build system `{system}`")]
    UnknownBackend { system: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_data() -> BackendData {
        BackendData {
            source_dir: "/chef/project".into(),
            build_dir: "/chef/build/linux/x86_64".into(),
            install_dir: "/chef/install".into(),
            toolchains_dir: "/chef/toolchains".into(),
            build_ingredients_dir: "/chef/ingredients/linux/x86_64".into(),
            platform: "linux".into(),
            arch: "x86_64".into(),
            recipe_name: "editor".into(),
            arguments: String::new(),
            env: BuildEnv::default(),
            in_tree: false,
            parallel: true,
            jobs: 4,
        }
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(matches!(
            script_for("ninja-turtle", &sample_data()),
            Err(Error::UnknownBackend { .. })
        ));
    }

    #[test]
    fn scripts_fail_fast() {
        let script = script_for("make", &sample_data()).unwrap();

        assert!(script.starts_with("#!/bin/sh\nset -e\n"));
    }

    #[test]
    fn in_tree_switches_the_work_dir() {
        let mut data = sample_data();
        assert_eq!(data.work_dir(), &PathBuf::from("/chef/build/linux/x86_64"));

        data.in_tree = true;
        assert_eq!(data.work_dir(), &PathBuf::from("/chef/project"));
    }
}
