use serde::{Deserialize, Serialize};

use super::Term;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, command: Vec<u8>) -> Self {
        Self { term, command }
    }
}

/// Delivered on the commit channel once an entry is known to be committed.
/// `term` is the term the entry was created in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub index: usize,
    pub term: Term,
    pub command: Vec<u8>,
}

/// Replicated log, indexed from 0. The index of an entry is its position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    pub fn term_at(&self, index: usize) -> Option<Term> {
        self.entries.get(index).map(|e| e.term)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.entries.len().checked_sub(1)
    }

    /// Index and term of the last entry, `(None, None)` for an empty log.
    pub fn last_index_and_term(&self) -> (Option<usize>, Option<Term>) {
        (self.last_index(), self.entries.last().map(|e| e.term))
    }

    pub fn append(&mut self, entry: LogEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Entries from `start` to the end of the log.
    pub fn entries_from(&self, start: usize) -> Vec<LogEntry> {
        self.entries.get(start..).unwrap_or_default().to_vec()
    }

    /// Entries with index in `(after, through]`.
    pub fn range_after(&self, after: Option<usize>, through: usize) -> Vec<LogEntry> {
        let start = after.map_or(0, |i| i + 1);
        let end = (through + 1).min(self.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    /// Consistency check for AppendEntries. An absent previous index always matches.
    pub fn matches(&self, prev_index: Option<usize>, prev_term: Option<Term>) -> bool {
        match prev_index {
            None => true,
            Some(index) => prev_term.is_some() && self.term_at(index) == prev_term,
        }
    }

    /// Merges `incoming` after `prev_index`, leaving any matching prefix untouched and
    /// truncating from the first entry whose term differs. Returns true if the log changed.
    pub fn merge(&mut self, prev_index: Option<usize>, incoming: &[LogEntry]) -> bool {
        let mut insert_at = prev_index.map_or(0, |i| i + 1);
        let mut next_new = 0;

        while insert_at < self.entries.len() && next_new < incoming.len() {
            if self.entries[insert_at].term != incoming[next_new].term {
                break;
            }
            insert_at += 1;
            next_new += 1;
        }

        if next_new >= incoming.len() {
            return false;
        }

        self.entries.truncate(insert_at);
        self.entries.extend_from_slice(&incoming[next_new..]);
        true
    }

    /// Hint returned to a leader whose `prev_index` did not match: either the log
    /// length (when `prev_index` is beyond the end) or the term stored at `prev_index`
    /// together with the first index holding that term.
    pub fn conflict_hint(&self, prev_index: usize) -> (usize, Option<Term>) {
        if prev_index >= self.entries.len() {
            return (self.entries.len(), None);
        }

        let term = self.entries[prev_index].term;
        let mut first = prev_index;
        while first > 0 && self.entries[first - 1].term == term {
            first -= 1;
        }
        (first, Some(term))
    }

    pub fn last_index_of_term(&self, term: Term) -> Option<usize> {
        self.entries.iter().rposition(|e| e.term == term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(terms: &[Term]) -> Log {
        Log::from_entries(
            terms
                .iter()
                .enumerate()
                .map(|(i, &term)| LogEntry::new(term, vec![i as u8]))
                .collect(),
        )
    }

    fn terms(log: &Log) -> Vec<Term> {
        log.entries().iter().map(|e| e.term).collect()
    }

    #[test]
    fn empty_log_has_no_last_entry() {
        let log = Log::new();
        assert_eq!(log.last_index_and_term(), (None, None));
        assert!(log.entries_from(0).is_empty());
        assert!(log.matches(None, None));
        assert!(!log.matches(Some(0), Some(1)));
    }

    #[test]
    fn append_returns_position() {
        let mut log = Log::new();
        assert_eq!(log.append(LogEntry::new(1, b"a".to_vec())), 0);
        assert_eq!(log.append(LogEntry::new(1, b"b".to_vec())), 1);
        assert_eq!(log.last_index_and_term(), (Some(1), Some(1)));
        assert_eq!(log.entries_from(1).len(), 1);
        assert!(log.entries_from(2).is_empty());
        assert!(log.entries_from(7).is_empty());
    }

    #[test]
    fn range_after_slices_half_open_interval() {
        let log = log_of(&[1, 1, 2, 3]);
        assert_eq!(log.range_after(None, 1).len(), 2);
        assert_eq!(terms(&Log::from_entries(log.range_after(Some(1), 3))), vec![2, 3]);
        assert!(log.range_after(Some(3), 3).is_empty());
        assert_eq!(log.range_after(Some(2), 10).len(), 1);
    }

    #[test]
    fn merge_is_idempotent_for_matching_prefix() {
        let mut log = log_of(&[1, 1, 2]);
        let incoming = log.entries_from(1);
        assert!(!log.merge(Some(0), &incoming));
        assert_eq!(terms(&log), vec![1, 1, 2]);

        // A shorter, matching redelivery must not truncate the tail.
        let incoming = log.entries()[..1].to_vec();
        assert!(!log.merge(None, &incoming));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn merge_truncates_from_first_divergence() {
        let mut log = log_of(&[1, 1, 2, 2]);
        let incoming = vec![LogEntry::new(1, vec![1]), LogEntry::new(3, vec![9])];
        assert!(log.merge(Some(0), &incoming));
        assert_eq!(terms(&log), vec![1, 1, 3]);
        assert_eq!(log.get(2).map(|e| e.command.clone()), Some(vec![9]));
    }

    #[test]
    fn merge_appends_past_end() {
        let mut log = log_of(&[1]);
        assert!(log.merge(Some(0), &[LogEntry::new(2, vec![]), LogEntry::new(2, vec![])]));
        assert_eq!(terms(&log), vec![1, 2, 2]);
    }

    #[test]
    fn conflict_hint_beyond_end_reports_length() {
        let log = log_of(&[1, 1]);
        assert_eq!(log.conflict_hint(5), (2, None));
    }

    #[test]
    fn conflict_hint_reports_first_index_of_term() {
        let log = log_of(&[1, 2, 2, 2, 3]);
        assert_eq!(log.conflict_hint(3), (1, Some(2)));
        assert_eq!(log.conflict_hint(0), (0, Some(1)));
        assert_eq!(log.conflict_hint(4), (4, Some(3)));
    }

    #[test]
    fn last_index_of_term_scans_from_the_end() {
        let log = log_of(&[1, 2, 2, 4]);
        assert_eq!(log.last_index_of_term(2), Some(2));
        assert_eq!(log.last_index_of_term(3), None);
    }

    #[test]
    fn matches_compares_term_at_prev_index() {
        let log = log_of(&[1, 2]);
        assert!(log.matches(Some(1), Some(2)));
        assert!(!log.matches(Some(1), Some(1)));
        assert!(!log.matches(Some(2), Some(2)));
    }
}
