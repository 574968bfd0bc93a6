// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Mount rule profiles
//!
//! The second blob type: a flat rule list instead of a trie. Each rule
//! allows mounts whose source matches a glob pattern, optionally pinned to
//! a filesystem type, with a mask of permitted mount flags.

use crate::blob::{
    Cursor, FLAG_CASE_INSENSITIVE, FLAG_MOUNT_PROFILE, Header, PROFILE_MAGIC, PROFILE_VERSION, STRING_NONE, Strings,
    StringsRef, write_u32,
};
use crate::pattern::{self, Pattern};
use crate::{CompileFlags, Error};

const HEADER_SIZE: usize = 20;
const RULE_RECORD_SIZE: usize = 12;

#[derive(Debug, Clone)]
pub struct MountRule {
    /// Glob over the mount source path
    pub source: String,
    /// Required filesystem type, any if absent
    pub fstype: Option<String>,
    /// Mask of mount flags this rule permits
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct MountProfile {
    rules: Vec<(Pattern, MountRule)>,
    flags: CompileFlags,
}

impl MountProfile {
    pub fn compile(rules: impl IntoIterator<Item = MountRule>, flags: CompileFlags) -> Result<Self, Error> {
        let rules = rules
            .into_iter()
            .map(|rule| Ok((pattern::parse(&rule.source)?, rule)))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { rules, flags })
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// True iff some rule covers `source` with the given filesystem type
    /// and every requested mount flag permitted
    pub fn allows(&self, source: &str, fstype: Option<&str>, mount_flags: u32) -> bool {
        let ci = self.flags.case_insensitive();

        self.rules.iter().any(|(pattern, rule)| {
            let matched = pattern.matches(source.as_bytes(), ci) != pattern.negated;

            matched
                && rule.fstype.as_deref().is_none_or(|required| Some(required) == fstype)
                && mount_flags & rule.flags == mount_flags
        })
    }

    pub fn export(&self) -> Vec<u8> {
        let mut strings = Strings::default();

        let records: Vec<(u32, u32, u32)> = self
            .rules
            .iter()
            .map(|(_, rule)| {
                (
                    rule.flags,
                    strings.intern(&rule.source),
                    rule.fstype.as_deref().map(|s| strings.intern(s)).unwrap_or(STRING_NONE),
                )
            })
            .collect();

        let mut flags = FLAG_MOUNT_PROFILE;
        if self.flags.case_insensitive() {
            flags |= FLAG_CASE_INSENSITIVE;
        }

        let mut out = vec![];
        write_u32(&mut out, PROFILE_MAGIC);
        write_u32(&mut out, PROFILE_VERSION);
        write_u32(&mut out, flags);
        write_u32(&mut out, records.len() as u32);
        write_u32(&mut out, strings.region.len() as u32);

        for (mount_flags, source, fstype) in records {
            write_u32(&mut out, mount_flags);
            write_u32(&mut out, source);
            write_u32(&mut out, fstype);
        }

        out.extend(&strings.region);
        out
    }

    pub fn import(bytes: &[u8]) -> Result<Self, Error> {
        let header = Header::parse(bytes)?;

        if header.flags & FLAG_MOUNT_PROFILE == 0 {
            return Err(Error::InvalidBlob("mount profile flag missing"));
        }

        let tables = header
            .rule_count
            .checked_mul(RULE_RECORD_SIZE)
            .ok_or(Error::InvalidBlob("table sizes overflow"))?;
        let required = HEADER_SIZE + tables + header.strings_size;
        if bytes.len() < required {
            return Err(Error::InvalidBlob("buffer shorter than recorded size"));
        }

        let strings = StringsRef::parse(&bytes[required - header.strings_size..required])?;
        let mut cursor = Cursor::new(&bytes[HEADER_SIZE..]);

        let mut rules = Vec::with_capacity(header.rule_count);
        for _ in 0..header.rule_count {
            let mount_flags = cursor.u32()?;
            let source_offset = cursor.u32()?;
            let fstype_offset = cursor.u32()?;

            let source = strings.get(source_offset)?.to_owned();
            let fstype = if fstype_offset == STRING_NONE {
                None
            } else {
                Some(strings.get(fstype_offset)?.to_owned())
            };

            let pattern =
                pattern::parse(&source).map_err(|_| Error::InvalidBlob("malformed mount source pattern"))?;

            rules.push((
                pattern,
                MountRule {
                    source,
                    fstype,
                    flags: mount_flags,
                },
            ));
        }

        let flags = if header.flags & FLAG_CASE_INSENSITIVE != 0 {
            CompileFlags::CASE_INSENSITIVE
        } else {
            CompileFlags::NONE
        };

        Ok(Self { rules, flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS_RDONLY: u32 = 1;
    const MS_NOSUID: u32 = 2;

    fn sample() -> MountProfile {
        MountProfile::compile(
            [
                MountRule {
                    source: "/var/chef/mnt/**".into(),
                    fstype: None,
                    flags: MS_RDONLY | MS_NOSUID,
                },
                MountRule {
                    source: "/dev/sd??".into(),
                    fstype: Some("ext4".into()),
                    flags: MS_RDONLY,
                },
            ],
            CompileFlags::NONE,
        )
        .unwrap()
    }

    #[test]
    fn rule_matching() {
        let profile = sample();

        assert!(profile.allows("/var/chef/mnt/a/b", None, MS_RDONLY));
        assert!(profile.allows("/dev/sda1", Some("ext4"), MS_RDONLY));
        assert!(!profile.allows("/dev/sda1", Some("vfat"), MS_RDONLY));
        assert!(!profile.allows("/dev/sda1", Some("ext4"), MS_NOSUID));
        assert!(!profile.allows("/etc/passwd", None, 0));
    }

    #[test]
    fn export_import_roundtrip() {
        let profile = sample();
        let imported = MountProfile::import(&profile.export()).unwrap();

        assert_eq!(imported.num_rules(), profile.num_rules());
        assert!(imported.allows("/var/chef/mnt/x", None, MS_RDONLY));
        assert!(!imported.allows("/etc/passwd", None, 0));
    }

    #[test]
    fn path_blob_is_not_a_mount_profile() {
        let path_blob = crate::Profile::compile([("/x", crate::Permissions::READ)], CompileFlags::NONE)
            .unwrap()
            .export();

        assert!(matches!(MountProfile::import(&path_blob), Err(Error::InvalidBlob(_))));
    }
}
