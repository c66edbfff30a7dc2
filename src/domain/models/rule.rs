//! Signature rule and match domain models.

use serde::{Deserialize, Serialize};

/// Kind of detection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Pattern,
    Dsl,
    Yara,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Dsl => "dsl",
            Self::Yara => "yara",
        }
    }
}

/// Severity attached to a rule and carried on its matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

fn default_sample_percent() -> u8 {
    100
}

fn default_enabled() -> bool {
    true
}

/// A detection rule as loaded from the rule directory.
///
/// Only enabled rules with a non-empty pattern participate in automaton
/// construction. `sample_percent` outside `[1, 100]` is a build error, not a
/// silently clamped value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    /// Raw pattern bytes. Serialized in rule files as a plain string when
    /// valid UTF-8, otherwise as `hex:`-prefixed hex.
    #[serde(with = "pattern_bytes")]
    pub pattern: Vec<u8>,
    /// Monotonic version, bumped by the rule author on change.
    #[serde(default)]
    pub version: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub severity: Severity,
    /// Percentage of matches to emit, in [1, 100].
    #[serde(default = "default_sample_percent")]
    pub sample_percent: u8,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Rule {
    pub fn new(id: impl Into<String>, pattern: impl Into<Vec<u8>>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            kind: RuleKind::Pattern,
            pattern: pattern.into(),
            version: 1,
            enabled: true,
            severity,
            sample_percent: 100,
            tags: Vec::new(),
        }
    }

    /// Whether this rule should be compiled into an automaton.
    pub fn is_compilable(&self) -> bool {
        self.enabled && !self.pattern.is_empty()
    }
}

/// Pattern bytes in rule files. Valid UTF-8 patterns serialize as plain
/// strings; non-UTF-8 patterns (raw signature byte sequences) serialize as
/// `hex:<lowercase hex>`. A UTF-8 pattern that itself starts with `hex:` is
/// hex-encoded too, so decoding is unambiguous and every pattern
/// round-trips byte-for-byte.
mod pattern_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    const HEX_PREFIX: &str = "hex:";

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(s) if !s.starts_with(HEX_PREFIX) => ser.serialize_str(s),
            _ => ser.serialize_str(&format!("{HEX_PREFIX}{}", hex::encode(bytes))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        match s.strip_prefix(HEX_PREFIX) {
            Some(encoded) => hex::decode(encoded)
                .map_err(|e| D::Error::custom(format!("invalid hex pattern: {e}"))),
            None => Ok(s.into_bytes()),
        }
    }
}

/// A single emission from an automaton scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub rule_id: String,
    pub rule_kind: RuleKind,
    /// Byte offset of the first matched byte within the scanned buffer.
    pub offset: usize,
    /// Length of the matched pattern.
    pub length: usize,
    pub severity: Severity,
    pub rule_version: u64,
    /// True when the rule's sampling gate thinned emissions (sample < 100).
    pub sampled: bool,
    /// Fingerprint of the automaton that produced this match.
    pub automaton_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_compilable() {
        let rule = Rule::new("r1", b"malware".to_vec(), Severity::High);
        assert!(rule.is_compilable());

        let mut disabled = rule.clone();
        disabled.enabled = false;
        assert!(!disabled.is_compilable());

        let mut empty = rule;
        empty.pattern.clear();
        assert!(!empty.is_compilable());
    }

    #[test]
    fn test_rule_json_round_trip() {
        let rule = Rule {
            id: "r-42".into(),
            kind: RuleKind::Pattern,
            pattern: b"GET /admin".to_vec(),
            version: 3,
            enabled: true,
            severity: Severity::Critical,
            sample_percent: 50,
            tags: vec!["web".into()],
        };
        let bytes = serde_json::to_vec(&rule).unwrap();
        let back: Rule = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rule, back);
    }

    #[test]
    fn test_binary_pattern_round_trips_as_hex() {
        let rule = Rule::new("bin-1", vec![0x4d, 0x5a, 0x90, 0x00, 0xff, 0xfe], Severity::High);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["pattern"], "hex:4d5a9000fffe");

        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_literal_hex_prefix_pattern_round_trips() {
        // A UTF-8 pattern that happens to start with the escape prefix must
        // not be mistaken for encoded bytes.
        let rule = Rule::new("tricky", b"hex:not-encoded".to_vec(), Severity::Low);
        let json = serde_json::to_value(&rule).unwrap();
        assert_ne!(json["pattern"], "hex:not-encoded");

        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back.pattern, b"hex:not-encoded".to_vec());
    }

    #[test]
    fn test_malformed_hex_pattern_rejected() {
        let err = serde_json::from_value::<Rule>(serde_json::json!({
            "id": "bad",
            "kind": "pattern",
            "pattern": "hex:zz",
            "severity": "low",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid hex pattern"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
