//! Content-addressed hot reload of the scanning automaton.
//!
//! A loader produces the current rule list on demand; a hash over the
//! enabled rules decides whether a rebuild is needed. Rebuilds happen off
//! the scan path and publish atomically: readers holding the previous
//! automaton finish their scans on it, new scans pick up the replacement.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use sha2::{Digest, Sha256};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::Rule;

use super::automaton::Automaton;

/// A rule list plus the optional manifest hash that must authenticate it.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    /// Expected composite content hash; reload fails on mismatch.
    pub manifest_hash: Option<String>,
}

/// Source of truth for the current rule list.
#[async_trait]
pub trait RuleLoader: Send + Sync {
    async fn load(&self) -> SwarmResult<RuleSet>;
}

/// Loads `*.json` and `*.yaml` rule files from a directory. An optional
/// `manifest.json` (`{"content_hash": "..."}`) pins the expected content.
pub struct DirRuleLoader {
    dir: PathBuf,
}

impl DirRuleLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RuleLoader for DirRuleLoader {
    async fn load(&self) -> SwarmResult<RuleSet> {
        let mut rules = Vec::new();
        let mut manifest_hash = None;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SwarmError::Internal(format!("rule dir unreadable: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwarmError::Internal(format!("rule dir unreadable: {e}")))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();

            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping unreadable rule file");
                    continue;
                }
            };

            if name == "manifest.json" {
                #[derive(serde::Deserialize)]
                struct Manifest {
                    content_hash: String,
                }
                let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
                    SwarmError::validation("manifest.json", format!("invalid manifest: {e}"))
                })?;
                manifest_hash = Some(manifest.content_hash);
                continue;
            }

            let loaded: Vec<Rule> = match ext.as_str() {
                "json" => serde_json::from_slice(&bytes).map_err(|e| {
                    SwarmError::validation(name.clone(), format!("invalid rule file: {e}"))
                })?,
                "yaml" | "yml" => serde_yaml::from_slice(&bytes).map_err(|e| {
                    SwarmError::validation(name.clone(), format!("invalid rule file: {e}"))
                })?,
                _ => continue,
            };
            rules.extend(loaded);
        }

        Ok(RuleSet {
            rules,
            manifest_hash,
        })
    }
}

/// Composite content hash over the enabled rules, sorted by id:
/// SHA-256 of `id\0pattern\0severity` records.
pub fn content_hash(rules: &[Rule]) -> String {
    let mut enabled: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
    enabled.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    for rule in enabled {
        hasher.update(rule.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(&rule.pattern);
        hasher.update([0u8]);
        hasher.update(rule.severity.as_str().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Outcome of a reload check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Swapped,
    Unchanged,
}

impl ReloadOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Swapped => "swapped",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Owns the live automaton and swaps it when rule content changes.
pub struct HotReloadScanner {
    loader: Arc<dyn RuleLoader>,
    current: RwLock<Arc<Automaton>>,
    last_hash: Mutex<String>,
    running: Arc<AtomicBool>,
}

impl HotReloadScanner {
    /// Build the initial automaton from the loader. Fails when the first
    /// load fails; a scanner must never start without rules it was pointed at.
    pub async fn new(loader: Arc<dyn RuleLoader>) -> SwarmResult<Arc<Self>> {
        let scanner = Arc::new(Self {
            loader,
            current: RwLock::new(Arc::new(Automaton::empty())),
            last_hash: Mutex::new(String::new()),
            running: Arc::new(AtomicBool::new(false)),
        });
        scanner.reload().await?;
        Ok(scanner)
    }

    /// Current automaton. One pointer clone per scan; in-flight scans keep
    /// their instance alive after a swap.
    pub fn automaton(&self) -> Arc<Automaton> {
        self.current.read().expect("automaton lock poisoned").clone()
    }

    /// Check the loader for new content and swap if it changed.
    pub async fn reload(&self) -> SwarmResult<ReloadOutcome> {
        let outcome = self.reload_inner().await;
        let label = match &outcome {
            Ok(o) => o.as_str(),
            Err(_) => "error",
        };
        counter!("swarm_signatures_reloads_total", "result" => label).increment(1);
        outcome
    }

    async fn reload_inner(&self) -> SwarmResult<ReloadOutcome> {
        let ruleset = self.loader.load().await?;
        let hash = content_hash(&ruleset.rules);

        if let Some(expected) = &ruleset.manifest_hash {
            if *expected != hash {
                return Err(SwarmError::validation(
                    "manifest",
                    format!("manifest hash {expected} does not match content hash {hash}"),
                ));
            }
        }

        {
            let last = self.last_hash.lock().expect("hash lock poisoned");
            if *last == hash {
                return Ok(ReloadOutcome::Unchanged);
            }
        }

        // Build off the scan path, then publish with one short write lock.
        let automaton = Arc::new(Automaton::build(ruleset.rules)?);
        gauge!("swarm_signature_rules_loaded").set(automaton.rule_count() as f64);
        tracing::info!(
            rules = automaton.rule_count(),
            hash = automaton.build_hash(),
            build_ms = automaton.build_duration().as_millis() as u64,
            "signature automaton rebuilt"
        );

        *self.current.write().expect("automaton lock poisoned") = automaton;
        *self.last_hash.lock().expect("hash lock poisoned") = hash;
        Ok(ReloadOutcome::Swapped)
    }

    /// Start the background reload ticker.
    pub fn start(self: &Arc<Self>, check_interval: Duration) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scanner = self.clone();

        tokio::spawn(async move {
            while scanner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(check_interval).await;
                if let Err(e) = scanner.reload().await {
                    tracing::warn!(error = %e, "signature reload failed; keeping prior automaton");
                }
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
