// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe checkpoint cache
//!
//! A JSON key-value store scoped to one recipe's kitchen. Writes happen
//! inside explicit transactions: `begin` stages, `commit` persists
//! atomically, dropping an uncommitted transaction discards it. Nothing
//! ever commits mid-step.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use fs_err as fs;
use thiserror::Error;

#[derive(Debug)]
pub struct RecipeCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    staged: Option<BTreeMap<String, String>>,
}

impl RecipeCache {
    /// Open the cache backing file, starting empty when absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();

        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries,
            staged: None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// True when a checkpoint key has been recorded
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Begin a transaction. Fails when one is already open.
    pub fn begin(&mut self) -> Result<(), Error> {
        if self.staged.is_some() {
            return Err(Error::TransactionOpen);
        }

        self.staged = Some(self.entries.clone());
        Ok(())
    }

    /// Stage a key into the open transaction
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        self.staged
            .as_mut()
            .ok_or(Error::NoTransaction)?
            .insert(key.into(), value.into());
        Ok(())
    }

    /// Stage removal of a key
    pub fn unset(&mut self, key: &str) -> Result<(), Error> {
        self.staged.as_mut().ok_or(Error::NoTransaction)?.remove(key);
        Ok(())
    }

    /// Persist the open transaction
    pub fn commit(&mut self) -> Result<(), Error> {
        let staged = self.staged.take().ok_or(Error::NoTransaction)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a torn write cannot lose checkpoints
        let scratch = self.path.with_extension("tmp");
        let file = fs::File::create(&scratch)?;
        serde_json::to_writer_pretty(file, &staged)?;
        fs::rename(&scratch, &self.path)?;

        self.entries = staged;
        Ok(())
    }

    /// Discard the open transaction, if any
    pub fn rollback(&mut self) {
        self.staged = None;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("a cache transaction is already open")]
    TransactionOpen,
    #[error("no cache transaction is open")]
    NoTransaction,
    #[error("deserialize recipe cache")]
    Json(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_checkpoints_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = RecipeCache::open(&path).unwrap();
        cache.begin().unwrap();
        cache.set("setup_rootfs", "done").unwrap();
        cache.commit().unwrap();

        let reopened = RecipeCache::open(&path).unwrap();
        assert!(reopened.contains("setup_rootfs"));
    }

    #[test]
    fn uncommitted_changes_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = RecipeCache::open(&path).unwrap();
        cache.begin().unwrap();
        cache.set("setup_rootfs", "done").unwrap();

        // Not committed: neither in memory nor on disk
        assert!(!cache.contains("setup_rootfs"));
        assert!(!RecipeCache::open(&path).unwrap().contains("setup_rootfs"));

        cache.rollback();
        cache.begin().unwrap();
        cache.commit().unwrap();
        assert!(!cache.contains("setup_rootfs"));
    }

    #[test]
    fn nested_transactions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RecipeCache::open(dir.path().join("cache.json")).unwrap();

        cache.begin().unwrap();
        assert!(matches!(cache.begin(), Err(Error::TransactionOpen)));
    }

    #[test]
    fn set_outside_transaction_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RecipeCache::open(dir.path().join("cache.json")).unwrap();

        assert!(matches!(cache.set("k", "v"), Err(Error::NoTransaction)));
    }
}
