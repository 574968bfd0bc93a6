// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Local pack inventory
//!
//! A JSON-backed index of every pack fetched onto this host, keyed by
//! (publisher, package, platform, arch, channel, revision). The list is
//! loaded fully at startup and rewritten on mutation while holding an
//! advisory lock on a sibling lock file, so concurrent daemons serialize
//! their updates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use self::lockfile::Lock;

mod lockfile;

/// One cached pack on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    pub publisher: String,
    pub package: String,
    pub platform: String,
    pub arch: String,
    pub channel: String,
    pub revision: u64,
    /// Location of the pack file within the pack store
    pub path: PathBuf,
    /// Seconds since the unix epoch at the time of caching
    pub added: u64,
    /// Whether the pack has been unpacked into an install root
    pub unpacked: bool,
}

/// Lookup key for [`Inventory::get_pack`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key<'a> {
    pub publisher: &'a str,
    pub package: &'a str,
    pub platform: &'a str,
    pub arch: &'a str,
    pub channel: &'a str,
    pub revision: u64,
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}-{} {}#{}",
            self.publisher, self.package, self.platform, self.arch, self.channel, self.revision
        )
    }
}

impl Pack {
    fn matches(&self, key: &Key<'_>) -> bool {
        self.in_group(key) && self.revision == key.revision
    }

    fn in_group(&self, key: &Key<'_>) -> bool {
        self.publisher == key.publisher
            && self.package == key.package
            && self.platform == key.platform
            && self.arch == key.arch
            && self.channel == key.channel
    }

    fn key(&self) -> Key<'_> {
        Key {
            publisher: &self.publisher,
            package: &self.package,
            platform: &self.platform,
            arch: &self.arch,
            channel: &self.channel,
            revision: self.revision,
        }
    }
}

#[derive(Debug)]
pub struct Inventory {
    state_path: PathBuf,
    packs: Vec<Pack>,
}

impl Inventory {
    /// Load the inventory state file, starting empty when absent
    pub fn load(state_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let state_path = state_path.into();

        let packs = match fs_err::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(e.into()),
        };

        Ok(Self { state_path, packs })
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn packs(&self) -> &[Pack] {
        &self.packs
    }

    /// Linear scan for an exact key. Entries number in the tens to
    /// hundreds, an index buys nothing here.
    pub fn get_pack(&self, key: Key<'_>) -> Option<&Pack> {
        self.packs.iter().find(|pack| pack.matches(&key))
    }

    /// Latest cached revision within a key's group, ignoring the key's own
    /// revision
    pub fn latest_revision(&self, key: Key<'_>) -> Option<u64> {
        self.packs
            .iter()
            .filter(|pack| pack.in_group(&key))
            .map(|pack| pack.revision)
            .max()
    }

    /// Record a newly fetched pack and persist. The revision must be
    /// strictly greater than every cached revision of the same group.
    pub fn add(&mut self, pack: Pack) -> Result<&Pack, Error> {
        if let Some(latest) = self.latest_revision(pack.key()) {
            if pack.revision <= latest {
                return Err(Error::RevisionNotAscending {
                    offered: pack.revision,
                    latest,
                });
            }
        }

        self.packs.push(pack);
        self.save()?;

        Ok(self.packs.last().expect("pack was just pushed"))
    }

    /// Flag a cached pack's unpacked state and persist
    pub fn set_unpacked(&mut self, key: Key<'_>, unpacked: bool) -> Result<(), Error> {
        let pack = self
            .packs
            .iter_mut()
            .find(|pack| pack.matches(&key))
            .ok_or_else(|| Error::UnknownPack(key.to_string()))?;

        pack.unpacked = unpacked;
        self.save()
    }

    /// Drop a cached pack and persist
    pub fn remove(&mut self, key: Key<'_>) -> Result<Pack, Error> {
        let index = self
            .packs
            .iter()
            .position(|pack| pack.matches(&key))
            .ok_or_else(|| Error::UnknownPack(key.to_string()))?;

        let pack = self.packs.remove(index);
        self.save()?;

        Ok(pack)
    }

    /// Serialize the full list under the state file lock
    pub fn save(&self) -> Result<(), Error> {
        if let Some(parent) = self.state_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let _lock = lockfile::acquire(self.lock_path())?;

        let file = fs_err::File::create(&self.state_path)?;
        serde_json::to_writer_pretty(file, &self.packs)?;

        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        self.state_path.with_extension("lock")
    }
}

/// Seconds since the unix epoch, for [`Pack::added`]
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("revision {offered} is not above the cached revision {latest}")]
    RevisionNotAscending { offered: u64, latest: u64 },
    #[error("no cached pack for {0}")]
    UnknownPack(String),
    #[error("state file lock")]
    Lock(#[from] lockfile::Error),
    #[error("deserialize inventory state")]
    Json(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(package: &str, revision: u64) -> Pack {
        Pack {
            publisher: "greenhouse".into(),
            package: package.into(),
            platform: "linux".into(),
            arch: "amd64".into(),
            channel: "stable".into(),
            revision,
            path: PathBuf::from(format!("/var/chef/packs/{package}-{revision}.pack")),
            added: 1_700_000_000,
            unpacked: false,
        }
    }

    fn key(package: &str, revision: u64) -> Key<'static> {
        Key {
            publisher: "greenhouse",
            package: Box::leak(package.to_owned().into_boxed_str()),
            platform: "linux",
            arch: "amd64",
            channel: "stable",
            revision,
        }
    }

    #[test]
    fn load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");

        let mut inventory = Inventory::load(&state).unwrap();
        inventory.add(pack("editor", 1)).unwrap();
        inventory.add(pack("editor", 2)).unwrap();
        inventory.add(pack("zlib", 7)).unwrap();

        let reloaded = Inventory::load(&state).unwrap();
        assert_eq!(reloaded.packs(), inventory.packs());
        assert_eq!(reloaded.get_pack(key("editor", 2)).unwrap().revision, 2);
        assert!(reloaded.get_pack(key("editor", 3)).is_none());
    }

    #[test]
    fn revisions_must_ascend() {
        let dir = tempfile::tempdir().unwrap();
        let mut inventory = Inventory::load(dir.path().join("state.json")).unwrap();

        inventory.add(pack("editor", 5)).unwrap();

        assert!(matches!(
            inventory.add(pack("editor", 5)),
            Err(Error::RevisionNotAscending { offered: 5, latest: 5 })
        ));
        assert!(matches!(
            inventory.add(pack("editor", 4)),
            Err(Error::RevisionNotAscending { .. })
        ));

        // A different channel is its own group
        let mut other = pack("editor", 1);
        other.channel = "devel".into();
        inventory.add(other).unwrap();
    }

    #[test]
    fn unpacked_flag_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");

        let mut inventory = Inventory::load(&state).unwrap();
        inventory.add(pack("editor", 1)).unwrap();
        inventory.set_unpacked(key("editor", 1), true).unwrap();

        assert!(Inventory::load(&state).unwrap().get_pack(key("editor", 1)).unwrap().unpacked);
    }

    #[test]
    fn remove_unknown_pack_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut inventory = Inventory::load(dir.path().join("state.json")).unwrap();

        assert!(matches!(inventory.remove(key("editor", 1)), Err(Error::UnknownPack(_))));
    }
}
