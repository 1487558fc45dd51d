// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The rule and chain model consumed by [`Table`](../table/struct.Table.html).
//!
//! A [`Rule`](struct.Rule.html) is treated as an opaque fragment of
//! `iptables` rule-spec: everything that follows `-A <chain>` on an
//! `iptables-save` line. This module renders rules into the
//! `iptables-restore` line grammar and derives the per-slot identity hashes
//! that let the synchronizer recognize its own rules in `iptables-save`
//! output without parsing rule bodies.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Number of characters of the encoded digest kept as the rule identity.
///
/// 16 characters of URL-safe base64 carry 96 bits, which is plenty to make
/// accidental collisions within a single chain implausible while keeping the
/// comments short. The charset has to stay within `[A-Za-z0-9_-]` so that
/// hashes survive the comment-extraction regex unmangled.
const RULE_HASH_LENGTH: usize = 16;

/// A single rule, stored as its textual rule-spec (matches and target),
/// e.g. `-m conntrack --ctstate INVALID -j DROP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    spec: String,
}

impl Rule {
    /// Create a rule from its rule-spec.
    pub fn new<S: Into<String>>(spec: S) -> Rule {
        Rule { spec: spec.into() }
    }

    /// The textual rule-spec this rule was created from.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Render this rule as an append to the end of `chain_name`.
    ///
    /// `prefix_fragment` is emitted as the first match of the rule so that a
    /// comment contained in it cannot be shadowed by comments in the
    /// rule-spec itself.
    pub fn render_append(&self, chain_name: &str, prefix_fragment: &str) -> String {
        format!("-A {} {} {}", chain_name, prefix_fragment, self.spec)
    }

    /// Render this rule as an insert at position 1 of `chain_name`.
    pub fn render_insert(&self, chain_name: &str, prefix_fragment: &str) -> String {
        format!("-I {} 1 {} {}", chain_name, prefix_fragment, self.spec)
    }

    /// Render this rule as a replacement of rule number `rule_num` (1-based)
    /// of `chain_name`.
    pub fn render_replace(
        &self,
        chain_name: &str,
        rule_num: usize,
        prefix_fragment: &str,
    ) -> String {
        format!("-R {} {} {} {}", chain_name, rule_num, prefix_fragment, self.spec)
    }
}

/// A named, ordered sequence of rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Name of the chain. The kernel limits chain names to 28 characters;
    /// callers are expected to respect that.
    pub name: String,

    /// The rules of the chain, in order.
    pub rules: Vec<Rule>,
}

impl Chain {
    /// Create a chain from a name and its ordered rules.
    pub fn new<S: Into<String>>(name: S, rules: Vec<Rule>) -> Chain {
        Chain {
            name: name.into(),
            rules: rules,
        }
    }

    /// The identity hash of every rule slot of this chain, in order.
    pub fn rule_hashes(&self) -> Vec<String> {
        rule_hashes(&self.name, &self.rules)
    }
}

/// Calculate the identity hashes for `rules` as the contents of a chain
/// named `chain_name`.
///
/// The hash of slot `i` covers the chain name, the slot index and the
/// rule-spec: identical content in the same slot of an identically-named
/// chain hashes identically, while moving a rule to another slot (or editing
/// it) changes its hash.
pub fn rule_hashes(chain_name: &str, rules: &[Rule]) -> Vec<String> {
    rules
        .iter()
        .enumerate()
        .map(|(index, rule)| rule_hash(chain_name, index, rule))
        .collect()
}

fn rule_hash(chain_name: &str, index: usize, rule: &Rule) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chain_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(index.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(rule.spec.as_bytes());

    let mut hash = URL_SAFE_NO_PAD.encode(hasher.finalize());
    hash.truncate(RULE_HASH_LENGTH);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_append() {
        let rule = Rule::new("-j ACCEPT");
        assert_eq!(
            rule.render_append("ts-fwd", "-m comment --comment \"ts:abc\""),
            "-A ts-fwd -m comment --comment \"ts:abc\" -j ACCEPT"
        );
    }

    #[test]
    fn render_insert_is_always_position_one() {
        let rule = Rule::new("-j ts-fwd");
        assert_eq!(
            rule.render_insert("FORWARD", "-m comment --comment \"ts:abc\""),
            "-I FORWARD 1 -m comment --comment \"ts:abc\" -j ts-fwd"
        );
    }

    #[test]
    fn render_replace() {
        let rule = Rule::new("-j DROP");
        assert_eq!(
            rule.render_replace("ts-fwd", 2, "-m comment --comment \"ts:abc\""),
            "-R ts-fwd 2 -m comment --comment \"ts:abc\" -j DROP"
        );
    }

    #[test]
    fn hashes_are_stable() {
        let rules = vec![Rule::new("-j ACCEPT"), Rule::new("-j DROP")];
        assert_eq!(rule_hashes("ts-fwd", &rules), rule_hashes("ts-fwd", &rules));
    }

    #[test]
    fn hashes_have_expected_length_and_charset() {
        for hash in rule_hashes("ts-fwd", &[Rule::new("-j ACCEPT")]) {
            assert_eq!(hash.len(), 16);
            assert!(hash
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn hash_depends_on_slot() {
        let rule = Rule::new("-j ACCEPT");
        let hashes = rule_hashes("ts-fwd", &[rule.clone(), rule]);
        assert_ne!(hashes[0], hashes[1]);
    }

    #[test]
    fn hash_depends_on_content() {
        let a = rule_hashes("ts-fwd", &[Rule::new("-j ACCEPT")]);
        let b = rule_hashes("ts-fwd", &[Rule::new("-j DROP")]);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_depends_on_chain_name() {
        let rules = vec![Rule::new("-j ACCEPT")];
        assert_ne!(rule_hashes("ts-fwd", &rules), rule_hashes("ts-in", &rules));
    }

    #[test]
    fn chain_hashes_match_free_function() {
        let rules = vec![Rule::new("-j ACCEPT"), Rule::new("-j DROP")];
        let chain = Chain::new("ts-fwd", rules.clone());
        assert_eq!(chain.rule_hashes(), rule_hashes("ts-fwd", &rules));
    }
}
