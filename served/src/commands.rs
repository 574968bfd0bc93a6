// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Installed command registry
//!
//! Every installed pack contributes its command manifest. A command maps
//! the wrapper path under `/chef/bin` to the owning package's container
//! and the executable inside it. The registry persists as JSON beside
//! the inventory state.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wire::CommandRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledCommand {
    pub name: String,
    pub publisher: String,
    pub package: String,
    pub container_id: String,
    /// Executable path inside the container
    pub path: PathBuf,
    pub arguments: Vec<String>,
    pub cwd: PathBuf,
}

impl InstalledCommand {
    pub fn record(&self) -> CommandRecord {
        CommandRecord {
            container_id: self.container_id.clone(),
            path: self.path.clone(),
            arguments: self.arguments.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

#[derive(Debug)]
pub struct CommandRegistry {
    path: PathBuf,
    commands: BTreeMap<String, InstalledCommand>,
}

impl CommandRegistry {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();

        let commands = match fs_err::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, commands })
    }

    /// Look up by the path the wrapper binary was invoked as; only the
    /// file name is significant
    pub fn by_invoked_path(&self, invoked: &Path) -> Option<&InstalledCommand> {
        let name = invoked.file_name()?.to_str()?;
        self.commands.get(name)
    }

    pub fn insert(&mut self, command: InstalledCommand) -> Result<(), Error> {
        self.commands.insert(command.name.clone(), command);
        self.save()
    }

    /// Drop every command a package registered. Returns their names.
    pub fn remove_package(&mut self, publisher: &str, package: &str) -> Result<Vec<String>, Error> {
        let removed: Vec<String> = self
            .commands
            .values()
            .filter(|c| c.publisher == publisher && c.package == package)
            .map(|c| c.name.clone())
            .collect();

        for name in &removed {
            self.commands.remove(name);
        }

        if !removed.is_empty() {
            self.save()?;
        }

        Ok(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstalledCommand> {
        self.commands.values()
    }

    fn save(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let file = fs_err::File::create(&self.path)?;
        serde_json::to_writer_pretty(file, &self.commands)?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("deserialize command registry")]
    Json(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str) -> InstalledCommand {
        InstalledCommand {
            name: name.into(),
            publisher: "greenhouse".into(),
            package: "editor".into(),
            container_id: "editor".into(),
            path: PathBuf::from("usr/bin").join(name),
            arguments: vec![],
            cwd: "/".into(),
        }
    }

    #[test]
    fn lookup_uses_the_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = CommandRegistry::load(dir.path().join("commands.json")).unwrap();
        registry.insert(command("edit")).unwrap();

        assert!(registry.by_invoked_path(Path::new("/chef/bin/edit")).is_some());
        assert!(registry.by_invoked_path(Path::new("edit")).is_some());
        assert!(registry.by_invoked_path(Path::new("/chef/bin/other")).is_none());
    }

    #[test]
    fn registry_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.json");

        let mut registry = CommandRegistry::load(&path).unwrap();
        registry.insert(command("edit")).unwrap();

        let reloaded = CommandRegistry::load(&path).unwrap();
        assert_eq!(reloaded.by_invoked_path(Path::new("edit")).unwrap().package, "editor");
    }

    #[test]
    fn remove_package_drops_all_of_its_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = CommandRegistry::load(dir.path().join("commands.json")).unwrap();

        registry.insert(command("edit")).unwrap();
        registry.insert(command("edit-diff")).unwrap();

        let removed = registry.remove_package("greenhouse", "editor").unwrap();

        assert_eq!(removed.len(), 2);
        assert!(registry.by_invoked_path(Path::new("edit")).is_none());
    }
}
