// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Security profile compilation
//!
//! A profile maps path glob patterns to permission masks. Patterns are
//! compiled into a byte-indexed trie; pattern sets free of unbounded
//! wildcards are additionally lowered to a DFA so matching runs in a
//! single pass over the path. Profiles serialize to a versioned binary
//! blob for hand-off between processes.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

pub use self::blob::{PROFILE_MAGIC, PROFILE_VERSION, STRING_NONE};
pub use self::mount::{MountProfile, MountRule};
use self::pattern::Pattern;

mod blob;
mod dfa;
mod mount;
mod pattern;
mod trie;

/// Permission bits carried by a profile rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXEC: Self = Self(4);
    pub const ALL: Self = Self(7);

    pub fn contains(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, c) in [(Self::READ, 'r'), (Self::WRITE, 'w'), (Self::EXEC, 'x')] {
            write!(f, "{}", if self.contains(bit) { c } else { '-' })?;
        }
        Ok(())
    }
}

/// Profile compilation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileFlags(pub u32);

impl CompileFlags {
    pub const NONE: Self = Self(0);
    pub const CASE_INSENSITIVE: Self = Self(1);

    pub fn case_insensitive(self) -> bool {
        self.0 & Self::CASE_INSENSITIVE.0 != 0
    }
}

/// One source rule of a profile
#[derive(Debug, Clone)]
pub(crate) struct Rule {
    pattern: Pattern,
    mask: Permissions,
}

/// A compiled path profile
#[derive(Debug, Clone)]
pub struct Profile {
    rules: Vec<Rule>,
    trie: trie::Trie,
    dfa: Option<dfa::Dfa>,
    flags: CompileFlags,
}

impl Profile {
    /// Compile `(pattern, mask)` pairs. Patterns are validated up front;
    /// an unbalanced bracket set rejects the whole profile.
    pub fn compile<'a>(
        rules: impl IntoIterator<Item = (&'a str, Permissions)>,
        flags: CompileFlags,
    ) -> Result<Self, Error> {
        let rules = rules
            .into_iter()
            .map(|(source, mask)| {
                Ok(Rule {
                    pattern: pattern::parse(source)?,
                    mask,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self::build(rules, flags))
    }

    pub(crate) fn build(rules: Vec<Rule>, flags: CompileFlags) -> Self {
        let ci = flags.case_insensitive();

        let mut trie = trie::Trie::default();
        for rule in rules.iter().filter(|r| !r.pattern.negated) {
            trie.insert(&rule.pattern, rule.mask);
        }

        let dfa = dfa::Dfa::build(&rules, ci);

        Self { rules, trie, dfa, flags }
    }

    pub fn flags(&self) -> CompileFlags {
        self.flags
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// True iff `path` matches the profile with every bit of `required`
    /// granted
    pub fn matches(&self, path: &str, required: Permissions) -> bool {
        let Some(granted) = self.granted(path) else {
            return false;
        };

        granted.contains(required)
    }

    /// The union of masks of every rule matching `path`, or `None` when no
    /// rule matches
    pub fn granted(&self, path: &str) -> Option<Permissions> {
        let ci = self.flags.case_insensitive();

        if let Some(dfa) = &self.dfa {
            return dfa.matches(path.as_bytes());
        }

        let mut granted = self.trie.matches(path.as_bytes(), ci);

        // Negated rules grant their mask when the inner pattern does not
        // match
        for rule in self.rules.iter().filter(|r| r.pattern.negated) {
            if !rule.pattern.matches(path.as_bytes(), ci) {
                granted = Some(granted.unwrap_or(Permissions::NONE) | rule.mask);
            }
        }

        granted
    }

    /// True when matching runs on the DFA fast path
    pub fn accelerated(&self) -> bool {
        self.dfa.is_some()
    }

    /// Serialize into the versioned profile blob
    pub fn export(&self) -> Vec<u8> {
        blob::export_path_profile(self)
    }

    /// Reconstruct a profile from an exported blob. Any structural
    /// violation is rejected.
    pub fn import(bytes: &[u8]) -> Result<Self, Error> {
        blob::import_path_profile(bytes)
    }

    pub(crate) fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub(crate) fn trie(&self) -> &trie::Trie {
        &self.trie
    }
}

impl Rule {
    pub(crate) fn new(pattern: Pattern, mask: Permissions) -> Self {
        Self { pattern, mask }
    }

    pub(crate) fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub(crate) fn mask(&self) -> Permissions {
        self.mask
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
    #[error("invalid profile blob: {0}")]
    InvalidBlob(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_matching() {
        let profile = Profile::compile([("/tmp/file[a-z]", Permissions::ALL)], CompileFlags::NONE).unwrap();

        assert!(profile.matches("/tmp/filea", Permissions::NONE));
        assert!(!profile.matches("/tmp/fileA", Permissions::NONE));
        assert!(!profile.matches("/tmp/file1", Permissions::NONE));
    }

    #[test]
    fn class_matching_case_insensitive() {
        let profile = Profile::compile([("/tmp/file[a-z]", Permissions::ALL)], CompileFlags::CASE_INSENSITIVE).unwrap();

        assert!(profile.matches("/tmp/fileA", Permissions::NONE));
    }

    #[test]
    fn required_mask_is_honoured() {
        let profile = Profile::compile([("/etc/*.conf", Permissions::READ)], CompileFlags::NONE).unwrap();

        assert!(profile.matches("/etc/app.conf", Permissions::READ));
        assert!(!profile.matches("/etc/app.conf", Permissions::WRITE));
        assert!(!profile.matches("/etc/sub/app.conf", Permissions::READ));
    }

    #[test]
    fn globstar_crosses_separators() {
        let profile = Profile::compile([("/usr/**", Permissions::READ | Permissions::EXEC)], CompileFlags::NONE).unwrap();

        assert!(profile.matches("/usr/bin/sh", Permissions::EXEC));
        assert!(profile.matches("/usr/lib/x/y/z.so", Permissions::READ));
        assert!(!profile.matches("/var/lib/z", Permissions::READ));
    }

    #[test]
    fn negated_pattern_inverts() {
        let profile = Profile::compile([("!/proc/**", Permissions::WRITE)], CompileFlags::NONE).unwrap();

        assert!(profile.matches("/home/user/file", Permissions::WRITE));
        assert!(!profile.matches("/proc/self/mem", Permissions::WRITE));
    }

    #[test]
    fn unbalanced_bracket_is_rejected() {
        assert!(Profile::compile([("/tmp/file[a-z", Permissions::ALL)], CompileFlags::NONE).is_err());
    }

    #[test]
    fn bounded_profiles_use_the_dfa() {
        let bounded = Profile::compile([("/tmp/file[a-z]", Permissions::ALL)], CompileFlags::NONE).unwrap();
        let unbounded = Profile::compile([("/tmp/*", Permissions::ALL)], CompileFlags::NONE).unwrap();

        assert!(bounded.accelerated());
        assert!(!unbounded.accelerated());
    }

    #[test]
    fn union_across_rules() {
        let profile = Profile::compile(
            [("/data/blob", Permissions::READ), ("/data/*", Permissions::WRITE)],
            CompileFlags::NONE,
        )
        .unwrap();

        assert_eq!(profile.granted("/data/blob"), Some(Permissions::READ | Permissions::WRITE));
        assert_eq!(profile.granted("/data/other"), Some(Permissions::WRITE));
        assert_eq!(profile.granted("/elsewhere"), None);
    }
}
