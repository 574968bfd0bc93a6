// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! DFA acceleration
//!
//! Pattern sets free of unbounded wildcards (`*`, `**`) and of negated
//! rules describe fixed-length matches, so the rule set lowers to a DFA
//! running in one pass over the path. Bytes are first collapsed through a
//! 256-entry classmap; transitions are indexed `(state, class)`.

use std::collections::BTreeMap;

use crate::pattern::Pattern;
use crate::{Permissions, Rule};

/// Transition target meaning "no transition"
pub(crate) const DEAD: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub(crate) struct Dfa {
    pub classmap: [u8; 256],
    pub num_classes: u32,
    /// `num_states × num_classes`, row-major
    pub transitions: Vec<u32>,
    pub accept: Vec<bool>,
    pub perms: Vec<Permissions>,
}

impl Dfa {
    /// Lower the rule set, or `None` when any rule is unbounded or negated
    pub fn build(rules: &[Rule], ci: bool) -> Option<Self> {
        if rules.is_empty() || rules.iter().any(|r| r.pattern().negated || r.pattern().unbounded()) {
            return None;
        }

        let patterns: Vec<(&Pattern, Permissions)> = rules.iter().map(|r| (r.pattern(), r.mask())).collect();

        // Byte equivalence: two bytes are interchangeable iff every token
        // position in every pattern treats them identically
        let mut classmap = [0u8; 256];
        let mut signatures: BTreeMap<Vec<bool>, u8> = BTreeMap::new();

        for b in 0..=255u8 {
            let signature: Vec<bool> = patterns
                .iter()
                .flat_map(|(pattern, _)| pattern.tokens.iter().map(|t| t.matches_byte(b, ci)))
                .collect();

            let next = signatures.len() as u8;
            classmap[b as usize] = *signatures.entry(signature).or_insert(next);
        }

        let num_classes = signatures.len() as u32;

        // Representative byte per class for transition probing
        let mut representative = vec![0u8; num_classes as usize];
        for b in (0..=255u8).rev() {
            representative[classmap[b as usize] as usize] = b;
        }

        // Subset construction over (pattern, position) NFA states
        let start: Vec<(usize, usize)> = (0..patterns.len()).map(|p| (p, 0)).collect();

        let mut states: BTreeMap<Vec<(usize, usize)>, u32> = BTreeMap::new();
        states.insert(start.clone(), 0);

        let mut work = vec![start];
        let mut transitions = vec![];
        let mut accept = vec![];
        let mut perms = vec![];

        while let Some(set) = work.pop() {
            let id = states[&set] as usize;

            if transitions.len() <= id * num_classes as usize {
                transitions.resize((id + 1) * num_classes as usize, DEAD);
                accept.resize(id + 1, false);
                perms.resize(id + 1, Permissions::NONE);
            }

            let mut mask = Permissions::NONE;
            let mut accepting = false;
            for &(p, pos) in &set {
                if pos == patterns[p].0.tokens.len() {
                    accepting = true;
                    mask |= patterns[p].1;
                }
            }
            accept[id] = accepting;
            perms[id] = mask;

            for class in 0..num_classes {
                let b = representative[class as usize];

                let next: Vec<(usize, usize)> = set
                    .iter()
                    .filter_map(|&(p, pos)| {
                        let token = patterns[p].0.tokens.get(pos)?;
                        token.matches_byte(b, ci).then_some((p, pos + 1))
                    })
                    .collect();

                if next.is_empty() {
                    continue;
                }

                let next_id = match states.get(&next) {
                    Some(&id) => id,
                    None => {
                        let id = states.len() as u32;
                        states.insert(next.clone(), id);
                        work.push(next);
                        id
                    }
                };

                transitions[id * num_classes as usize + class as usize] = next_id;
            }
        }

        // Late-discovered states may not have had their rows sized yet
        let num_states = states.len();
        transitions.resize(num_states * num_classes as usize, DEAD);
        accept.resize(num_states, false);
        perms.resize(num_states, Permissions::NONE);

        Some(Self {
            classmap,
            num_classes,
            transitions,
            accept,
            perms,
        })
    }

    /// Run the state machine to completion. Returns the accept state's
    /// mask, or `None` when the walk dies or ends non-accepting.
    pub fn matches(&self, path: &[u8]) -> Option<Permissions> {
        let mut state = 0u32;

        for &b in path {
            let class = self.classmap[b as usize] as usize;
            state = self.transitions[state as usize * self.num_classes as usize + class];
            if state == DEAD {
                return None;
            }
        }

        self.accept[state as usize].then(|| self.perms[state as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::parse;

    fn build(patterns: &[(&str, Permissions)], ci: bool) -> Option<Dfa> {
        let rules: Vec<Rule> = patterns
            .iter()
            .map(|(source, mask)| Rule::new(parse(source).unwrap(), *mask))
            .collect();
        Dfa::build(&rules, ci)
    }

    #[test]
    fn bounded_patterns_lower() {
        let dfa = build(&[("/tmp/file[a-z]", Permissions::ALL)], false).unwrap();

        assert_eq!(dfa.matches(b"/tmp/filea"), Some(Permissions::ALL));
        assert_eq!(dfa.matches(b"/tmp/fileA"), None);
        assert_eq!(dfa.matches(b"/tmp/file1"), None);
        assert_eq!(dfa.matches(b"/tmp/file"), None);
    }

    #[test]
    fn unbounded_patterns_do_not() {
        assert!(build(&[("/tmp/*", Permissions::ALL)], false).is_none());
        assert!(build(&[("!/tmp/x", Permissions::ALL)], false).is_none());
    }

    #[test]
    fn overlapping_rules_union_at_accept() {
        let dfa = build(
            &[("/a/?", Permissions::READ), ("/a/b", Permissions::WRITE)],
            false,
        )
        .unwrap();

        assert_eq!(dfa.matches(b"/a/b"), Some(Permissions::READ | Permissions::WRITE));
        assert_eq!(dfa.matches(b"/a/c"), Some(Permissions::READ));
    }

    #[test]
    fn case_insensitive_classmap() {
        let dfa = build(&[("/tmp/file[a-z]", Permissions::ALL)], true).unwrap();

        assert_eq!(dfa.matches(b"/tmp/fileA"), Some(Permissions::ALL));
    }
}
