use chrono::{DateTime, Duration, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

/// Message ids seen within a sliding window of stream time
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
    by_time: BTreeSet<(DateTime<Utc>, String)>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            by_time: BTreeSet::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains_key(message_id)
    }

    /// Record a sighting; a repeat keeps the first one
    pub fn insert(&mut self, message_id: &str, at: DateTime<Utc>) {
        if let Entry::Vacant(slot) = self.seen.entry(message_id.to_string()) {
            slot.insert(at);
            self.by_time.insert((at, message_id.to_string()));
        }
    }

    /// Forget ids older than `window` before `newest`
    pub fn evict(&mut self, newest: DateTime<Utc>) {
        let cutoff = newest - self.window;
        while let Some((at, _)) = self.by_time.first() {
            if *at >= cutoff {
                break;
            }
            if let Some((_, id)) = self.by_time.pop_first() {
                self.seen.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_remembers_ids_inside_window() {
        let mut dedup = DedupWindow::new(Duration::seconds(300));
        dedup.insert("a", at(0));
        dedup.insert("b", at(100));
        dedup.evict(at(299));

        assert!(dedup.contains("a"));
        assert!(dedup.contains("b"));
        assert!(!dedup.contains("c"));
    }

    #[test]
    fn test_evicts_by_stream_time_not_insertion_order() {
        let mut dedup = DedupWindow::new(Duration::seconds(10));
        dedup.insert("late", at(50));
        dedup.insert("early", at(5));
        dedup.evict(at(30));

        assert!(dedup.contains("late"));
        assert!(!dedup.contains("early"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_reinsert_keeps_first_sighting() {
        let mut dedup = DedupWindow::new(Duration::seconds(10));
        dedup.insert("a", at(0));
        dedup.insert("a", at(8));
        assert_eq!(dedup.seen.get("a"), Some(&at(0)));
        assert_eq!(dedup.by_time.len(), 1);

        dedup.evict(at(11));
        assert!(dedup.is_empty());
        assert!(dedup.by_time.is_empty());
    }

    #[test]
    fn test_earlier_reinsert_does_not_move_sighting() {
        let mut dedup = DedupWindow::new(Duration::seconds(10));
        dedup.insert("a", at(8));
        dedup.insert("a", at(0));
        assert_eq!(dedup.seen.get("a"), Some(&at(8)));
        assert!(dedup.by_time.contains(&(at(8), "a".to_string())));

        dedup.evict(at(17));
        assert!(dedup.contains("a"));
    }
}
