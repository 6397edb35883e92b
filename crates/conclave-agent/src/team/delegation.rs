use std::sync::OnceLock;

use regex::Regex;

use conclave_core::traits::{Delegation, IntentExtractor};

/// Longest unfinished marker tail kept between chunks.
const MAX_PENDING: usize = 4096;

const MARKER_OPEN: &str = "[DELEGATE";

fn marker() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"\[DELEGATE:\s*([^|\]]+?)\s*\|\s*([^\]]+?)\s*\]").ok())
        .as_ref()
}

/// Finds `[DELEGATE: agent_id | task]` markers in assistant text.
/// Malformed markers are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerExtractor;

impl IntentExtractor for MarkerExtractor {
    fn extract(&self, text: &str) -> Vec<Delegation> {
        let Some(re) = marker() else {
            return vec![];
        };
        re.captures_iter(text)
            .map(|caps| Delegation {
                agent_id: caps[1].trim().to_string(),
                task: caps[2].trim().to_string(),
            })
            .filter(|d| !d.agent_id.is_empty() && !d.task.is_empty())
            .collect()
    }
}

/// Applies an extractor to streamed text, where a marker may be split
/// across chunks. Each complete marker is reported exactly once.
pub struct DelegationScanner<'a> {
    extractor: &'a dyn IntentExtractor,
    pending: String,
}

impl<'a> DelegationScanner<'a> {
    pub fn new(extractor: &'a dyn IntentExtractor) -> Self {
        Self {
            extractor,
            pending: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Delegation> {
        self.pending.push_str(chunk);
        let found = self.extractor.extract(&self.pending);

        // Keep only a possibly unfinished marker. Tasks may contain '[', so
        // after the last ']' prefer an opened marker over a bare bracket.
        let tail = self.pending.rfind(']').map_or(0, |close| close + 1);
        let keep_from = self.pending[tail..]
            .find(MARKER_OPEN)
            .or_else(|| self.pending[tail..].rfind('['))
            .map(|open| tail + open);
        match keep_from {
            Some(open) if self.pending.len() - open <= MAX_PENDING => {
                self.pending.drain(..open);
            }
            _ => self.pending.clear(),
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_markers() {
        let text = "Plan:\n[DELEGATE: dev-1 | implement the parser]\nthen [DELEGATE:qa|write tests ]";
        let found = MarkerExtractor.extract(text);
        assert_eq!(
            found,
            vec![
                Delegation {
                    agent_id: "dev-1".into(),
                    task: "implement the parser".into()
                },
                Delegation {
                    agent_id: "qa".into(),
                    task: "write tests".into()
                },
            ]
        );
    }

    #[test]
    fn test_malformed_markers_ignored() {
        for text in [
            "[DELEGATE: dev-1]",
            "[DELEGATE dev-1 | task]",
            "[DELEGATE: | task]",
            "DELEGATE: dev | task",
            "no markers here",
        ] {
            assert!(MarkerExtractor.extract(text).is_empty(), "{}", text);
        }
    }

    #[test]
    fn test_scanner_joins_split_marker() {
        let extractor = MarkerExtractor;
        let mut scanner = DelegationScanner::new(&extractor);
        assert!(scanner.push("Sure. [DELEG").is_empty());
        assert!(scanner.push("ATE: dev | build").is_empty());
        let found = scanner.push(" it] and done.");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task, "build it");
        // Already reported
        assert!(scanner.push(" more text").is_empty());
    }

    #[test]
    fn test_scanner_keeps_task_with_bracket() {
        let extractor = MarkerExtractor;
        let mut scanner = DelegationScanner::new(&extractor);
        assert!(scanner.push("ok [DELEGATE: a | fix [x").is_empty());
        let found = scanner.push("] now]");
        assert_eq!(
            found,
            vec![Delegation {
                agent_id: "a".into(),
                task: "fix [x".into()
            }]
        );
    }

    #[test]
    fn test_scanner_reports_each_marker_once() {
        let extractor = MarkerExtractor;
        let mut scanner = DelegationScanner::new(&extractor);
        assert_eq!(scanner.push("[DELEGATE: a | one] [DELEGATE: b | two]").len(), 2);
        assert!(scanner.push("[x]").is_empty());
    }
}
