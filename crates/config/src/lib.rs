// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Layered YAML configuration
//!
//! Configuration types declare a domain; the manager merges every
//! `<domain>.yaml` file and `<domain>.d/*.yaml` drop-in found across the
//! active scope's bases, vendor before admin so local configuration wins.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use fs_err as fs;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

const EXTENSION: &str = "yaml";

pub trait Config: DeserializeOwned {
    fn domain() -> String;
}

#[derive(Debug, Clone)]
pub struct Manager {
    scope: Scope,
}

impl Manager {
    /// Config is loaded / merged from `usr/share/<program>` & `etc/<program>`
    /// relative to `root` and saved to `etc/<program>/<domain>.d/<name>.yaml`
    pub fn system(root: impl Into<PathBuf>, program: impl ToString) -> Self {
        Self {
            scope: Scope::System {
                root: root.into(),
                program: program.to_string(),
            },
        }
    }

    /// Config is loaded from $XDG_CONFIG_HOME/<program> and saved to
    /// $XDG_CONFIG_HOME/<program>/<domain>.d/<name>.yaml
    pub fn user(program: impl ToString) -> Result<Self, CreateUserError> {
        Ok(Self {
            scope: Scope::User {
                config: dirs::config_dir().ok_or(CreateUserError)?,
                program: program.to_string(),
            },
        })
    }

    /// Config is loaded from `path` and saved to `path`/<domain>.d/<name>.yaml
    pub fn custom(path: impl Into<PathBuf>) -> Self {
        Self {
            scope: Scope::Custom(path.into()),
        }
    }

    pub fn load<T: Config>(&self) -> Vec<T> {
        let domain = T::domain();

        let mut configs = vec![];

        for base in self.scope.load_bases() {
            for path in enumerate_paths(&base, &domain) {
                if let Some(config) = read_config(path) {
                    configs.push(config);
                }
            }
        }

        configs
    }

    pub fn save<T: Config + Serialize>(&self, name: impl fmt::Display, config: &T) -> Result<(), SaveError> {
        let domain = T::domain();

        let dir = self.scope.save_base().join(format!("{domain}.d"));

        fs::create_dir_all(&dir).map_err(|io| SaveError::CreateDir(dir.clone(), io))?;

        let path = dir.join(format!("{name}.{EXTENSION}"));

        let serialized = serde_yaml::to_string(config)?;

        fs::write(&path, serialized).map_err(|io| SaveError::Write(path, io))?;

        Ok(())
    }

    pub fn delete<T: Config>(&self, name: impl fmt::Display) -> io::Result<()> {
        let domain = T::domain();

        let path = self.scope.save_base().join(format!("{domain}.d")).join(format!("{name}.{EXTENSION}"));

        fs::remove_file(path)?;

        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("$HOME or $XDG_CONFIG_HOME env not set")]
pub struct CreateUserError;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("create config dir {0:?}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("serialize config")]
    Yaml(#[from] serde_yaml::Error),
    #[error("write config file {0:?}")]
    Write(PathBuf, #[source] io::Error),
}

/// `<base>/<domain>.yaml` plus sorted `<base>/<domain>.d/*.yaml`
fn enumerate_paths(base: &Path, domain: &str) -> Vec<PathBuf> {
    let mut paths = vec![];

    let file = base.join(format!("{domain}.{EXTENSION}"));
    if file.exists() {
        paths.push(file);
    }

    if let Ok(read_dir) = fs::read_dir(base.join(format!("{domain}.d"))) {
        let mut entries = read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(EXTENSION))
            .collect::<Vec<_>>();
        entries.sort();
        paths.extend(entries);
    }

    paths
}

fn read_config<T: Config>(path: PathBuf) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_yaml::from_slice(&bytes).ok()
}

#[derive(Debug, Clone)]
enum Scope {
    System { program: String, root: PathBuf },
    User { program: String, config: PathBuf },
    Custom(PathBuf),
}

impl Scope {
    /// Bases searched on load, lowest priority first
    fn load_bases(&self) -> Vec<PathBuf> {
        match self {
            Scope::System { root, program } => vec![
                root.join("usr").join("share").join(program),
                root.join("etc").join(program),
            ],
            Scope::User { config, program } => vec![
                Path::new("/usr/share").join(program),
                Path::new("/etc").join(program),
                config.join(program),
            ],
            Scope::Custom(dir) => vec![dir.clone()],
        }
    }

    fn save_base(&self) -> PathBuf {
        match self {
            Scope::System { root, program } => root.join("etc").join(program),
            Scope::User { config, program } => config.join(program),
            Scope::Custom(dir) => dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Registry {
        endpoint: String,
    }

    impl Config for Registry {
        fn domain() -> String {
            "registry".into()
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::custom(dir.path());

        manager
            .save(
                "default",
                &Registry {
                    endpoint: "https://packs.example.org".into(),
                },
            )
            .unwrap();

        let loaded = manager.load::<Registry>();
        assert_eq!(
            loaded,
            vec![Registry {
                endpoint: "https://packs.example.org".into()
            }]
        );
    }

    #[test]
    fn base_file_precedes_dropins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("registry.yaml"), "endpoint: https://a").unwrap();
        fs::create_dir_all(dir.path().join("registry.d")).unwrap();
        fs::write(dir.path().join("registry.d/z.yaml"), "endpoint: https://b").unwrap();

        let loaded = Manager::custom(dir.path()).load::<Registry>();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].endpoint, "https://a");
        assert_eq!(loaded[1].endpoint, "https://b");
    }

    #[test]
    fn delete_removes_saved_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::custom(dir.path());

        manager
            .save(
                "default",
                &Registry {
                    endpoint: "https://packs.example.org".into(),
                },
            )
            .unwrap();
        manager.delete::<Registry>("default").unwrap();

        assert!(manager.load::<Registry>().is_empty());
    }
}
