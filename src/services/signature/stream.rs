//! Chunked scanning for large inputs.
//!
//! Each chunk is scanned together with a preserved overlap suffix from the
//! previous chunk, so patterns spanning a chunk boundary still match. Matches
//! wholly inside the overlap were already reported by the previous round and
//! are suppressed; offsets are rebased to absolute stream positions.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::MatchResult;

use super::automaton::Automaton;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Streaming scanner over a fixed automaton.
pub struct StreamScanner {
    automaton: Arc<Automaton>,
    chunk_size: usize,
    overlap: usize,
}

impl StreamScanner {
    /// Overlap is at least the automaton's longest pattern so no spanning
    /// match can be lost.
    pub fn new(automaton: Arc<Automaton>, chunk_size: usize, min_overlap: usize) -> Self {
        let overlap = min_overlap.max(automaton.longest_pattern());
        Self {
            automaton,
            chunk_size: chunk_size.max(1),
            overlap,
        }
    }

    pub fn with_defaults(automaton: Arc<Automaton>) -> Self {
        Self::new(automaton, DEFAULT_CHUNK_SIZE, 0)
    }

    /// Scan an async byte stream to completion.
    pub async fn scan_reader<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
    ) -> SwarmResult<Vec<MatchResult>> {
        let mut state = ChunkState::new(self.overlap);
        let mut matches = Vec::new();
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| SwarmError::Internal(format!("stream read failed: {e}")))?;
            if n == 0 {
                break;
            }
            matches.extend(state.push(&self.automaton, &chunk[..n]));
        }

        Ok(matches)
    }

    /// Scan an in-memory input chunk-by-chunk. Equivalent to a single-pass
    /// scan of the whole buffer.
    pub fn scan_bytes_chunked(&self, input: &[u8]) -> Vec<MatchResult> {
        let mut state = ChunkState::new(self.overlap);
        let mut matches = Vec::new();
        for chunk in input.chunks(self.chunk_size) {
            matches.extend(state.push(&self.automaton, chunk));
        }
        matches
    }
}

/// Carries the overlap tail and the absolute position across chunks.
struct ChunkState {
    overlap: usize,
    carry: Vec<u8>,
    /// Absolute stream offset of `carry[0]`.
    base: usize,
}

impl ChunkState {
    fn new(overlap: usize) -> Self {
        Self {
            overlap,
            carry: Vec::new(),
            base: 0,
        }
    }

    fn push(&mut self, automaton: &Automaton, chunk: &[u8]) -> Vec<MatchResult> {
        let carried = self.carry.len();
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.extend_from_slice(chunk);

        let mut matches = automaton.scan(&buffer);
        // Matches that end inside the carried prefix were emitted last round.
        matches.retain(|m| m.offset + m.length > carried);
        for m in &mut matches {
            m.offset += self.base;
        }

        let keep = self.overlap.min(buffer.len());
        self.base += buffer.len() - keep;
        self.carry = buffer[buffer.len() - keep..].to_vec();

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Rule, Severity};

    fn automaton(patterns: &[(&str, &[u8])]) -> Arc<Automaton> {
        let rules = patterns
            .iter()
            .map(|(id, p)| Rule::new(*id, p.to_vec(), Severity::Low))
            .collect();
        Arc::new(Automaton::build(rules).unwrap())
    }

    fn keyed(matches: Vec<MatchResult>) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = matches
            .into_iter()
            .map(|m| (m.rule_id, m.offset))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_chunked_equals_single_pass() {
        let automaton = automaton(&[("aba", b"aba"), ("ba", b"ba")]);
        let input = b"ababa";

        let single = keyed(automaton.scan_unsampled(input));

        let scanner = StreamScanner::new(automaton.clone(), 3, 3);
        let chunked = keyed(scanner.scan_bytes_chunked(input));

        assert_eq!(single, chunked);
        assert!(!single.is_empty());
    }

    #[test]
    fn test_boundary_spanning_match() {
        let automaton = automaton(&[("needle", b"needle")]);
        // 4-byte chunks split the pattern across a boundary.
        let scanner = StreamScanner::new(automaton, 4, 0);
        let matches = scanner.scan_bytes_chunked(b"xxneedlexx");
        assert_eq!(keyed(matches), vec![("needle".to_string(), 2)]);
    }

    #[test]
    fn test_no_duplicate_emissions_in_overlap() {
        let automaton = automaton(&[("ab", b"ab")]);
        let scanner = StreamScanner::new(automaton, 2, 4);
        let matches = scanner.scan_bytes_chunked(b"abababab");
        assert_eq!(
            keyed(matches),
            vec![
                ("ab".to_string(), 0),
                ("ab".to_string(), 2),
                ("ab".to_string(), 4),
                ("ab".to_string(), 6),
            ]
        );
    }

    #[test]
    fn test_empty_input() {
        let automaton = automaton(&[("x", b"x")]);
        let scanner = StreamScanner::with_defaults(automaton);
        assert!(scanner.scan_bytes_chunked(b"").is_empty());
    }

    #[tokio::test]
    async fn test_scan_reader_matches_chunked() {
        let automaton = automaton(&[("seg", b"segment"), ("men", b"men")]);
        let input = b"a segment among segments".to_vec();

        let scanner = StreamScanner::new(automaton.clone(), 5, 0);
        let from_reader = keyed(scanner.scan_reader(input.as_slice()).await.unwrap());
        let single = keyed(automaton.scan_unsampled(&input));
        assert_eq!(from_reader, single);
    }

    #[test]
    fn test_large_input_offsets_are_absolute() {
        let automaton = automaton(&[("end", b"terminus")]);
        let mut input = vec![b'.'; 200_000];
        let at = input.len() - 8;
        input[at..].copy_from_slice(b"terminus");

        let scanner = StreamScanner::with_defaults(automaton);
        let matches = scanner.scan_bytes_chunked(&input);
        assert_eq!(keyed(matches), vec![("end".to_string(), at)]);
    }
}
