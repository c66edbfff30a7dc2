//! Aho-Corasick multi-pattern automaton.
//!
//! Built once from a rule set, then immutable and safe for concurrent scans.
//! Construction builds a goto trie over all compilable patterns, computes
//! failure links breadth-first, and propagates outputs along those links so
//! every node's output set covers all pattern suffixes ending there.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{MatchResult, Rule};

use super::sampling::SamplingGate;

const ROOT: usize = 0;

#[derive(Debug, Default)]
struct Node {
    next: HashMap<u8, usize>,
    fail: usize,
    /// Indices into `rules` for patterns ending at this node.
    out: Vec<usize>,
}

/// Immutable multi-pattern matcher.
pub struct Automaton {
    nodes: Vec<Node>,
    rules: Vec<Rule>,
    rule_count: usize,
    longest_pattern: usize,
    build_hash: String,
    build_duration: Duration,
}

impl Automaton {
    /// Build an automaton over the compilable subset of `rules`.
    ///
    /// Disabled or empty-pattern rules are skipped silently; an enabled rule
    /// with `sample_percent` outside `[1, 100]` fails the build.
    pub fn build(rules: Vec<Rule>) -> SwarmResult<Self> {
        let start = Instant::now();

        let compiled: Vec<Rule> = rules.into_iter().filter(Rule::is_compilable).collect();
        for rule in &compiled {
            if rule.sample_percent < 1 || rule.sample_percent > 100 {
                return Err(SwarmError::validation(
                    "sample_percent",
                    format!(
                        "rule '{}' has sample_percent {} outside [1, 100]",
                        rule.id, rule.sample_percent
                    ),
                ));
            }
        }

        let mut nodes = vec![Node::default()];
        let mut longest_pattern = 0;

        // Goto trie.
        for (idx, rule) in compiled.iter().enumerate() {
            longest_pattern = longest_pattern.max(rule.pattern.len());
            let mut current = ROOT;
            for &byte in &rule.pattern {
                let existing = nodes[current].next.get(&byte).copied();
                current = match existing {
                    Some(next) => next,
                    None => {
                        nodes.push(Node::default());
                        let next = nodes.len() - 1;
                        nodes[current].next.insert(byte, next);
                        next
                    }
                };
            }
            nodes[current].out.push(idx);
        }

        // Failure links, breadth-first. Root's children fail to root; deeper
        // nodes fail to the longest proper suffix present in the trie.
        let mut queue = VecDeque::new();
        let root_children: Vec<usize> = nodes[ROOT].next.values().copied().collect();
        for child in root_children {
            nodes[child].fail = ROOT;
            queue.push_back(child);
        }

        while let Some(current) = queue.pop_front() {
            let transitions: Vec<(u8, usize)> =
                nodes[current].next.iter().map(|(&b, &n)| (b, n)).collect();
            for (byte, child) in transitions {
                let mut fail = nodes[current].fail;
                while fail != ROOT && !nodes[fail].next.contains_key(&byte) {
                    fail = nodes[fail].fail;
                }
                let mut fail_target = *nodes[fail].next.get(&byte).unwrap_or(&ROOT);
                if fail_target == child {
                    fail_target = ROOT;
                }
                nodes[child].fail = fail_target;

                // Propagate outputs from the failure target.
                let inherited = nodes[fail_target].out.clone();
                nodes[child].out.extend(inherited);
                queue.push_back(child);
            }
        }

        let build_hash = fingerprint(&compiled);
        let rule_count = compiled.len();

        Ok(Self {
            nodes,
            rules: compiled,
            rule_count,
            longest_pattern,
            build_hash,
            build_duration: start.elapsed(),
        })
    }

    /// Empty automaton; matches nothing.
    pub fn empty() -> Self {
        Self::build(Vec::new()).expect("empty rule set always builds")
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn build_hash(&self) -> &str {
        &self.build_hash
    }

    pub fn build_duration(&self) -> Duration {
        self.build_duration
    }

    pub fn longest_pattern(&self) -> usize {
        self.longest_pattern
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Scan `input`, applying each rule's sampling gate with a fresh RNG
    /// seeded from the thread-local pool.
    pub fn scan(&self, input: &[u8]) -> Vec<MatchResult> {
        let mut rng = SmallRng::from_rng(rand::thread_rng()).expect("seed from thread rng");
        self.scan_with_rng(input, &mut rng)
    }

    /// Scan with a caller-supplied RNG; deterministic under a seeded RNG.
    pub fn scan_with_rng<R: Rng>(&self, input: &[u8], rng: &mut R) -> Vec<MatchResult> {
        self.scan_inner(input, rng, true)
    }

    /// Scan with the sampling gate wide open. Used for equivalence tests.
    pub fn scan_unsampled(&self, input: &[u8]) -> Vec<MatchResult> {
        let mut rng = SmallRng::seed_from_u64(0);
        self.scan_inner(input, &mut rng, false)
    }

    fn scan_inner<R: Rng>(&self, input: &[u8], rng: &mut R, sample: bool) -> Vec<MatchResult> {
        let mut matches = Vec::new();
        if self.rule_count == 0 {
            return matches;
        }

        let mut current = ROOT;
        for (i, &byte) in input.iter().enumerate() {
            while current != ROOT && !self.nodes[current].next.contains_key(&byte) {
                current = self.nodes[current].fail;
            }
            current = *self.nodes[current].next.get(&byte).unwrap_or(&ROOT);

            for &rule_idx in &self.nodes[current].out {
                let rule = &self.rules[rule_idx];
                if sample && !SamplingGate::admit(rule.sample_percent, rng) {
                    continue;
                }
                matches.push(MatchResult {
                    rule_id: rule.id.clone(),
                    rule_kind: rule.kind,
                    offset: i + 1 - rule.pattern.len(),
                    length: rule.pattern.len(),
                    severity: rule.severity,
                    rule_version: rule.version,
                    sampled: rule.sample_percent < 100,
                    automaton_hash: self.build_hash.clone(),
                });
            }
        }

        matches
    }
}

/// Stable fingerprint: hex prefix of SHA-256 over `id\0pattern` pairs sorted
/// by rule id. Identical rule content always yields an identical hash.
fn fingerprint(rules: &[Rule]) -> String {
    let mut keyed: Vec<(&str, &[u8])> = rules
        .iter()
        .map(|r| (r.id.as_str(), r.pattern.as_slice()))
        .collect();
    keyed.sort();

    let mut hasher = Sha256::new();
    for (id, pattern) in keyed {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(pattern);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Severity;

    fn rule(id: &str, pattern: &[u8]) -> Rule {
        Rule::new(id, pattern.to_vec(), Severity::Medium)
    }

    fn offsets_of(matches: &[MatchResult], rule_id: &str) -> Vec<usize> {
        matches
            .iter()
            .filter(|m| m.rule_id == rule_id)
            .map(|m| m.offset)
            .collect()
    }

    #[test]
    fn test_single_pattern() {
        let automaton = Automaton::build(vec![rule("r1", b"evil")]).unwrap();
        let matches = automaton.scan_unsampled(b"an evil payload, truly evil");
        assert_eq!(offsets_of(&matches, "r1"), vec![3, 23]);
        assert!(matches.iter().all(|m| m.length == 4));
    }

    #[test]
    fn test_overlapping_patterns() {
        let automaton = Automaton::build(vec![rule("aba", b"aba"), rule("ba", b"ba")]).unwrap();
        let matches = automaton.scan_unsampled(b"ababa");
        assert_eq!(offsets_of(&matches, "aba"), vec![0, 2]);
        assert_eq!(offsets_of(&matches, "ba"), vec![1, 3]);
    }

    #[test]
    fn test_suffix_outputs_propagate() {
        // "he" is a proper suffix of "she"; both must fire at the same end.
        let automaton =
            Automaton::build(vec![rule("she", b"she"), rule("he", b"he")]).unwrap();
        let matches = automaton.scan_unsampled(b"she");
        assert_eq!(offsets_of(&matches, "she"), vec![0]);
        assert_eq!(offsets_of(&matches, "he"), vec![1]);
    }

    #[test]
    fn test_empty_input_no_matches() {
        let automaton = Automaton::build(vec![rule("r1", b"x")]).unwrap();
        assert!(automaton.scan_unsampled(b"").is_empty());
    }

    #[test]
    fn test_disabled_rule_excluded() {
        let mut off = rule("off", b"target");
        off.enabled = false;
        let automaton = Automaton::build(vec![off]).unwrap();
        assert_eq!(automaton.rule_count(), 0);
        assert!(automaton.scan_unsampled(b"target target").is_empty());
    }

    #[test]
    fn test_sample_percent_out_of_range_is_build_error() {
        let mut bad = rule("bad", b"x");
        bad.sample_percent = 0;
        assert!(Automaton::build(vec![bad]).is_err());

        let mut bad = rule("bad", b"x");
        bad.sample_percent = 101;
        assert!(Automaton::build(vec![bad]).is_err());
    }

    #[test]
    fn test_build_hash_stable_across_order() {
        let a = Automaton::build(vec![rule("a", b"one"), rule("b", b"two")]).unwrap();
        let b = Automaton::build(vec![rule("b", b"two"), rule("a", b"one")]).unwrap();
        assert_eq!(a.build_hash(), b.build_hash());
        assert_eq!(a.build_hash().len(), 16);
    }

    #[test]
    fn test_build_hash_changes_with_content() {
        let a = Automaton::build(vec![rule("a", b"one")]).unwrap();
        let b = Automaton::build(vec![rule("a", b"two")]).unwrap();
        assert_ne!(a.build_hash(), b.build_hash());
    }

    #[test]
    fn test_matches_carry_metadata() {
        let mut r = rule("meta", b"xyz");
        r.version = 9;
        r.severity = Severity::Critical;
        let automaton = Automaton::build(vec![r]).unwrap();
        let matches = automaton.scan_unsampled(b"..xyz..");
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.rule_version, 9);
        assert_eq!(m.severity, Severity::Critical);
        assert_eq!(m.automaton_hash, automaton.build_hash());
        assert!(!m.sampled);
    }

    #[test]
    fn test_matches_naive_search() {
        let rules = vec![
            rule("r1", b"ab"),
            rule("r2", b"bc"),
            rule("r3", b"abc"),
            rule("r4", b"c"),
        ];
        let automaton = Automaton::build(rules.clone()).unwrap();
        let input = b"abcabcxabc";

        let mut expected: Vec<(String, usize)> = Vec::new();
        for r in &rules {
            for i in 0..=input.len().saturating_sub(r.pattern.len()) {
                if input[i..i + r.pattern.len()] == r.pattern[..] {
                    expected.push((r.id.clone(), i));
                }
            }
        }
        expected.sort();

        let mut actual: Vec<(String, usize)> = automaton
            .scan_unsampled(input)
            .into_iter()
            .map(|m| (m.rule_id, m.offset))
            .collect();
        actual.sort();

        assert_eq!(actual, expected);
    }
}
