//! Signature-scanning engine: automaton construction and matching, sampling,
//! streaming scans, hot reload, and scan instrumentation.

pub mod automaton;
pub mod metrics;
pub mod reload;
pub mod sampling;
pub mod stream;

pub use self::automaton::Automaton;
pub use self::metrics::{ScanMetricsCollector, ScanStats};
pub use self::reload::{
    content_hash, DirRuleLoader, HotReloadScanner, ReloadOutcome, RuleLoader, RuleSet,
};
pub use self::sampling::SamplingGate;
pub use self::stream::StreamScanner;
