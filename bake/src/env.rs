// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build environment composition
//!
//! The kitchen materializes one environment list at initialization; the
//! `CHEF_BUILD_*` entries start empty and are filled in while ingredients
//! are set up. Package managers append their own overrides.

use crate::Paths;

#[derive(Debug, Clone, Default)]
pub struct BuildEnv {
    entries: Vec<(String, String)>,
}

impl BuildEnv {
    pub fn new(paths: &Paths) -> Self {
        let ingredients = paths.build_ingredients().guest.display().to_string();

        let mut env = Self::default();

        env.set("USER", "chef");
        env.set("USERNAME", "chef");
        env.set("HOME", "/chef");
        env.set("PATH", "/usr/bin:/bin:/chef/toolchains/bin");
        env.set("LD_LIBRARY_PATH", format!("{ingredients}/lib:{ingredients}/usr/lib"));
        env.set("CHEF_TARGET_ARCH", paths.arch());
        env.set("CHEF_TARGET_PLATFORM", paths.platform());
        env.set("GIT_SSL_NO_VERIFY", "1");

        // Filled during ingredient setup
        env.set("CHEF_BUILD_PATH", "");
        env.set("CHEF_BUILD_INCLUDE", "");
        env.set("CHEF_BUILD_LIBS", "");
        env.set("CHEF_BUILD_CCFLAGS", "");
        env.set("CHEF_BUILD_LDFLAGS", "");

        env
    }

    /// Insert or replace a variable
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();

        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Append a path-like fragment to a `:`-separated variable
    pub fn append_path(&mut self, key: &str, fragment: impl AsRef<str>) {
        let fragment = fragment.as_ref();

        match self.get(key) {
            Some("") | None => self.set(key, fragment),
            Some(current) => {
                let merged = format!("{current}:{fragment}");
                self.set(key, merged);
            }
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Render as `export` lines for a shell script prelude
    pub fn script_prelude(&self) -> String {
        use std::fmt::Write;

        let mut prelude = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(&mut prelude, "export {key}=\"{value}\"");
        }
        prelude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_path_merges() {
        let mut env = BuildEnv::default();

        env.set("CHEF_BUILD_PATH", "");
        env.append_path("CHEF_BUILD_PATH", "/a/bin");
        env.append_path("CHEF_BUILD_PATH", "/b/bin");

        assert_eq!(env.get("CHEF_BUILD_PATH"), Some("/a/bin:/b/bin"));
    }

    #[test]
    fn set_replaces() {
        let mut env = BuildEnv::default();

        env.set("HOME", "/chef");
        env.set("HOME", "/elsewhere");

        assert_eq!(env.get("HOME"), Some("/elsewhere"));
        assert_eq!(env.entries().len(), 1);
    }

    #[test]
    fn prelude_exports_every_entry() {
        let mut env = BuildEnv::default();
        env.set("A", "1");
        env.set("B", "two");

        assert_eq!(env.script_prelude(), "export A=\"1\"\nexport B=\"two\"\n");
    }
}
