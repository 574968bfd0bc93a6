// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Proof record storage
//!
//! Proofs arrive from the registry alongside packs and are kept in a JSON
//! file next to the inventory state. Lookups are by opaque key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, PackageProof, PublisherProof};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    publishers: Vec<PublisherProof>,
    #[serde(default)]
    packages: Vec<PackageProof>,
}

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    records: Records,
}

impl Store {
    /// Load proof records, starting empty when the file does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let path = path.into();

        let records = match fs_err::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publisher(&self, publisher: &str) -> Result<&PublisherProof, Error> {
        self.records
            .publishers
            .iter()
            .find(|p| p.publisher == publisher)
            .ok_or(Error::UnknownPublisher)
    }

    pub fn package(&self, publisher: &str, package: &str, revision: u64) -> Result<&PackageProof, Error> {
        self.records
            .packages
            .iter()
            .find(|p| p.publisher == publisher && p.package == package && p.revision == revision)
            .ok_or(Error::UnknownPackage)
    }

    /// Record a publisher proof, replacing any previous proof for the same
    /// publisher
    pub fn add_publisher(&mut self, proof: PublisherProof) {
        self.records.publishers.retain(|p| p.publisher != proof.publisher);
        self.records.publishers.push(proof);
    }

    pub fn add_package(&mut self, proof: PackageProof) {
        self.records
            .packages
            .retain(|p| !(p.publisher == proof.publisher && p.package == proof.package && p.revision == proof.revision));
        self.records.packages.push(proof);
    }

    pub fn save(&self) -> Result<(), LoadError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let file = fs_err::File::create(&self.path)?;
        serde_json::to_writer_pretty(file, &self.records)?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("deserialize proof records")]
    Json(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(publisher: &str) -> PublisherProof {
        PublisherProof {
            publisher: publisher.into(),
            public_key: vec![1, 2, 3],
            signature: vec![4, 5, 6],
        }
    }

    #[test]
    fn lookup_miss_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("proofs.json")).unwrap();

        assert!(matches!(store.publisher("nobody"), Err(Error::UnknownPublisher)));
        assert!(matches!(store.package("nobody", "thing", 1), Err(Error::UnknownPackage)));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proofs.json");

        let mut store = Store::load(&path).unwrap();
        store.add_publisher(proof("greenhouse"));
        store.add_package(PackageProof {
            publisher: "greenhouse".into(),
            package: "editor".into(),
            revision: 2,
            digest: vec![0xAB; 64],
            signature: vec![0xCD; 16],
        });
        store.save().unwrap();

        let reloaded = Store::load(&path).unwrap();
        assert_eq!(reloaded.publisher("greenhouse").unwrap(), &proof("greenhouse"));
        assert_eq!(reloaded.package("greenhouse", "editor", 2).unwrap().revision, 2);
    }

    #[test]
    fn replacement_keeps_one_proof_per_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::load(dir.path().join("proofs.json")).unwrap();

        store.add_publisher(proof("greenhouse"));
        let mut updated = proof("greenhouse");
        updated.public_key = vec![9];
        store.add_publisher(updated);

        assert_eq!(store.publisher("greenhouse").unwrap().public_key, vec![9]);
    }
}
