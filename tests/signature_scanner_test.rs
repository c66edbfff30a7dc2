//! Signature engine tests: scan correctness, streaming overlap, hot reload,
//! the HTTP surface, and an automaton-vs-naive equivalence property.

use std::sync::Arc;

use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusBuilder;
use proptest::prelude::*;
use tokio::sync::Mutex as AsyncMutex;

use swarmguard::domain::models::{MatchResult, Rule, Severity};
use swarmguard::domain::SwarmResult;
use swarmguard::infrastructure::http::scanner_api::{self, ScannerState};
use swarmguard::services::signature::{
    Automaton, HotReloadScanner, RuleLoader, RuleSet, ScanMetricsCollector, StreamScanner,
};

fn rule(id: &str, pattern: &[u8]) -> Rule {
    Rule::new(id, pattern.to_vec(), Severity::Medium)
}

fn keyed(matches: Vec<MatchResult>) -> Vec<(String, usize)> {
    let mut out: Vec<(String, usize)> = matches
        .into_iter()
        .map(|m| (m.rule_id, m.offset))
        .collect();
    out.sort();
    out
}

struct SwappableLoader {
    ruleset: AsyncMutex<RuleSet>,
}

impl SwappableLoader {
    fn new(rules: Vec<Rule>) -> Arc<Self> {
        Arc::new(Self {
            ruleset: AsyncMutex::new(RuleSet {
                rules,
                manifest_hash: None,
            }),
        })
    }
}

#[async_trait]
impl RuleLoader for SwappableLoader {
    async fn load(&self) -> SwarmResult<RuleSet> {
        Ok(self.ruleset.lock().await.clone())
    }
}

#[tokio::test]
async fn test_overlap_scenario_matches_both_rules() {
    let automaton = Automaton::build(vec![rule("aba", b"aba"), rule("ba", b"ba")]).unwrap();
    let single = keyed(automaton.scan_unsampled(b"ababa"));
    assert!(single.contains(&("aba".to_string(), 0)));
    assert!(single.contains(&("ba".to_string(), 1)));

    // Streaming the same input in 3-byte chunks with overlap >= 3 yields the
    // same absolute offsets.
    let scanner = StreamScanner::new(Arc::new(automaton), 3, 3);
    let chunked = keyed(scanner.scan_bytes_chunked(b"ababa"));
    assert_eq!(single, chunked);
}

#[tokio::test]
async fn test_reload_same_content_same_hash_and_emissions() {
    let loader = SwappableLoader::new(vec![rule("r1", b"abc"), rule("r2", b"bcd")]);
    let scanner = HotReloadScanner::new(loader).await.unwrap();

    let before_hash = scanner.automaton().build_hash().to_string();
    let before = keyed(scanner.automaton().scan_unsampled(b"xxabcdxx"));

    scanner.reload().await.unwrap();

    assert_eq!(scanner.automaton().build_hash(), before_hash);
    assert_eq!(keyed(scanner.automaton().scan_unsampled(b"xxabcdxx")), before);
}

#[tokio::test]
async fn test_reload_new_rules_visible_to_new_scans() {
    let loader = SwappableLoader::new(vec![rule("old", b"old-sig")]);
    let scanner = HotReloadScanner::new(loader.clone()).await.unwrap();

    let held = scanner.automaton();
    loader.ruleset.lock().await.rules = vec![rule("new", b"new-sig")];
    scanner.reload().await.unwrap();

    // The held instance still matches the old content; fresh scans see the
    // replacement.
    assert_eq!(held.scan_unsampled(b"old-sig").len(), 1);
    let fresh = scanner.automaton();
    assert!(fresh.scan_unsampled(b"old-sig").is_empty());
    assert_eq!(fresh.scan_unsampled(b"new-sig").len(), 1);
}

async fn start_scanner(rules: Vec<Rule>) -> (String, reqwest::Client) {
    let loader = SwappableLoader::new(rules);
    let scanner = HotReloadScanner::new(loader).await.unwrap();
    let state = Arc::new(ScannerState {
        scanner,
        collector: Arc::new(ScanMetricsCollector::new()),
        metrics_handle: PrometheusBuilder::new().build_recorder().handle(),
    });

    let app = scanner_api::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), reqwest::Client::new())
}

#[tokio::test]
async fn test_scan_endpoint_returns_matches_and_headers() {
    let (base, client) = start_scanner(vec![rule("sig-1", b"malware")]).await;

    let response = client
        .post(format!("{base}/scan"))
        .body(&b"this malware payload"[..])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers().get("x-rule-count").unwrap(), "1");
    assert!(!response
        .headers()
        .get("x-scanner-version")
        .unwrap()
        .is_empty());

    let matches: Vec<MatchResult> = response.json().await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].rule_id, "sig-1");
    assert_eq!(matches[0].offset, 5);
    assert_eq!(matches[0].length, 7);
}

#[tokio::test]
async fn test_scan_endpoint_empty_body_no_matches() {
    let (base, client) = start_scanner(vec![rule("sig-1", b"x")]).await;
    let matches: Vec<MatchResult> = client
        .post(format!("{base}/scan"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(matches.is_empty());
}

#[tokio::test]
async fn test_rules_endpoint_hides_patterns() {
    let (base, client) = start_scanner(vec![rule("sig-1", b"secret-pattern")]).await;
    let body: serde_json::Value = client
        .get(format!("{base}/v1/rules"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["rule_count"], 1);
    let listed = &body["rules"][0];
    assert_eq!(listed["id"], "sig-1");
    assert_eq!(listed["pattern_len"], 14);
    assert!(listed.get("pattern").is_none());
}

#[tokio::test]
async fn test_stats_endpoint_counts_scans() {
    let (base, client) = start_scanner(vec![rule("sig-1", b"hit")]).await;

    for _ in 0..3 {
        client
            .post(format!("{base}/scan"))
            .body(&b"one hit here"[..])
            .send()
            .await
            .unwrap();
    }

    let body: serde_json::Value = client
        .get(format!("{base}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["stats"]["scans_total"], 3);
    assert_eq!(body["stats"]["matches_total"], 3);
    assert_eq!(body["stats"]["top_rules"][0]["rule_id"], "sig-1");
}

#[tokio::test]
async fn test_reload_endpoint_reports_outcome() {
    let (base, client) = start_scanner(vec![rule("sig-1", b"abc")]).await;
    let body: serde_json::Value = client
        .post(format!("{base}/reload"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "unchanged");
    assert_eq!(body["rule_count"], 1);
}

/// Naive multi-pattern scan used as the oracle.
fn naive_matches(input: &[u8], rules: &[Rule]) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    for rule in rules {
        if !rule.enabled || rule.pattern.is_empty() {
            continue;
        }
        for i in 0..=input.len().saturating_sub(rule.pattern.len()) {
            if input[i..i + rule.pattern.len()] == rule.pattern[..] {
                out.push((rule.id.clone(), i));
            }
        }
    }
    out.sort();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The automaton's unsampled emissions equal the naive scan for any
    /// input and any small pattern set over a narrow alphabet (narrow to
    /// force overlaps and shared suffixes).
    #[test]
    fn prop_automaton_equals_naive(
        input in proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 0..200),
        patterns in proptest::collection::hash_set(
            proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 1..5),
            1..6,
        ),
    ) {
        let rules: Vec<Rule> = patterns
            .iter()
            .enumerate()
            .map(|(i, p)| rule(&format!("r{i}"), p))
            .collect();

        let automaton = Automaton::build(rules.clone()).unwrap();
        let got = keyed(automaton.scan_unsampled(&input));
        let want = naive_matches(&input, &rules);
        prop_assert_eq!(got, want);
    }

    /// Chunked scanning with sufficient overlap equals single-pass scanning.
    #[test]
    fn prop_chunked_equals_single_pass(
        input in proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b')], 0..300),
        chunk_size in 1usize..32,
    ) {
        let rules = vec![rule("p1", b"ab"), rule("p2", b"aba"), rule("p3", b"bb")];
        let automaton = Arc::new(Automaton::build(rules).unwrap());

        let single = keyed(automaton.scan_unsampled(&input));
        let scanner = StreamScanner::new(automaton, chunk_size, 0);
        let chunked = keyed(scanner.scan_bytes_chunked(&input));
        prop_assert_eq!(single, chunked);
    }
}

#[test]
fn test_sampling_distribution_thins_roughly_proportionally() {
    let mut sampled = rule("sampled", b"a");
    sampled.sample_percent = 25;
    let automaton = Automaton::build(vec![sampled]).unwrap();

    let input = vec![b'a'; 10_000];
    let matches = automaton.scan(&input);
    let n = matches.len();
    assert!(n > 1_500 && n < 3_500, "expected ~2500 emissions, got {n}");
    assert!(matches.iter().all(|m| m.sampled));
}

#[test]
fn test_fresh_collector_snapshot_is_zeroed() {
    let collector = ScanMetricsCollector::new();
    let stats = collector.snapshot();
    assert_eq!(stats.scans_total, 0);
    assert!(stats.top_rules.is_empty());
}
