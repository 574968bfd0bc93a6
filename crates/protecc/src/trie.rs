// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Byte-indexed pattern trie
//!
//! Patterns sharing a prefix share nodes. Terminal nodes accumulate the
//! permission masks of every rule ending there. Matching walks the trie
//! with an explicit stack so wildcard backtracking never recurses.

use crate::pattern::{ClassSpec, Pattern, Token};
use crate::Permissions;

const SEPARATOR: u8 = b'/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Label {
    Byte(u8),
    Any,
    Star,
    Globstar,
    Class(ClassSpec),
}

impl Label {
    fn from_token(token: &Token) -> Self {
        match token {
            Token::Byte(b) => Label::Byte(*b),
            Token::Any => Label::Any,
            Token::Star => Label::Star,
            Token::Globstar => Label::Globstar,
            Token::Class(class) => Label::Class(class.clone()),
        }
    }

    fn matches_byte(&self, b: u8, ci: bool) -> bool {
        match self {
            Label::Byte(m) => *m == b || (ci && crate::pattern::fold(*m) == crate::pattern::fold(b)),
            Label::Any => b != SEPARATOR,
            Label::Class(class) => class.matches(b, ci),
            // Star and Globstar consume runs, handled by the walker
            Label::Star | Label::Globstar => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    pub edges: Vec<Edge>,
    pub mask: Permissions,
    pub terminal: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub label: Label,
    pub target: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Trie {
    pub nodes: Vec<Node>,
}

impl Default for Trie {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }
}

impl Trie {
    pub const ROOT: usize = 0;

    pub fn insert(&mut self, pattern: &Pattern, mask: Permissions) {
        let mut node = Self::ROOT;

        for token in &pattern.tokens {
            let label = Label::from_token(token);

            let existing = self.nodes[node].edges.iter().find(|e| e.label == label).map(|e| e.target);

            node = match existing {
                Some(target) => target,
                None => {
                    self.nodes.push(Node::default());
                    let target = self.nodes.len() - 1;
                    self.nodes[node].edges.push(Edge { label, target });
                    target
                }
            };
        }

        self.nodes[node].terminal = true;
        self.nodes[node].mask |= mask;
    }

    /// The union of terminal masks over every way of matching `path`, or
    /// `None` when the trie matches nowhere
    pub fn matches(&self, path: &[u8], ci: bool) -> Option<Permissions> {
        let mut granted = None;
        let mut stack = vec![(Self::ROOT, 0usize)];

        while let Some((node, pos)) = stack.pop() {
            let node = &self.nodes[node];

            if pos == path.len() && node.terminal {
                granted = Some(granted.unwrap_or(Permissions::NONE) | node.mask);
            }

            for edge in &node.edges {
                match &edge.label {
                    Label::Star => {
                        stack.push((edge.target, pos));
                        for k in pos..path.len() {
                            if path[k] == SEPARATOR {
                                break;
                            }
                            stack.push((edge.target, k + 1));
                        }
                    }
                    Label::Globstar => {
                        for k in pos..=path.len() {
                            stack.push((edge.target, k));
                        }
                    }
                    label => {
                        if pos < path.len() && label.matches_byte(path[pos], ci) {
                            stack.push((edge.target, pos + 1));
                        }
                    }
                }
            }
        }

        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::parse;

    fn trie(patterns: &[(&str, Permissions)]) -> Trie {
        let mut trie = Trie::default();
        for (source, mask) in patterns {
            trie.insert(&parse(source).unwrap(), *mask);
        }
        trie
    }

    #[test]
    fn prefix_sharing() {
        let t = trie(&[
            ("/usr/bin/sh", Permissions::EXEC),
            ("/usr/bin/sed", Permissions::EXEC),
        ]);

        // `/usr/bin/s` is shared: 10 shared nodes + h + ed + root
        assert_eq!(t.nodes.len(), 1 + 10 + 1 + 2);
        assert_eq!(t.matches(b"/usr/bin/sh", false), Some(Permissions::EXEC));
        assert_eq!(t.matches(b"/usr/bin/sed", false), Some(Permissions::EXEC));
        assert_eq!(t.matches(b"/usr/bin/se", false), None);
    }

    #[test]
    fn terminal_masks_accumulate() {
        let t = trie(&[("/a", Permissions::READ), ("/a", Permissions::WRITE)]);

        assert_eq!(t.matches(b"/a", false), Some(Permissions::READ | Permissions::WRITE));
    }

    #[test]
    fn star_backtracking() {
        let t = trie(&[("/x/*.conf", Permissions::READ)]);

        assert_eq!(t.matches(b"/x/a.conf", false), Some(Permissions::READ));
        assert_eq!(t.matches(b"/x/a.conf.bak", false), None);
        // Star must backtrack over the first `.conf`
        assert_eq!(t.matches(b"/x/a.conf.conf", false), Some(Permissions::READ));
    }
}
