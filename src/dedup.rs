use std::collections::HashSet;

/// Identity keys admitted so far for one target. Grows for the length of a
/// run and is dropped with it.
#[derive(Debug, Default)]
pub struct DedupIndex {
    seen: HashSet<String>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and insert in one step: `false` means the key was new and is
    /// now remembered, `true` means an earlier record already holds it.
    pub fn is_duplicate(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        self.seen.insert(key.to_string());
        false
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

    #[test]
    fn first_occurrence_wins() {
        let mut idx = DedupIndex::new();
        assert!(!idx.is_duplicate("a"));
        assert!(idx.is_duplicate("a"));
        assert!(idx.is_duplicate("a"));
        assert!(!idx.is_duplicate("b"));
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn empty_key_is_a_key() {
        let mut idx = DedupIndex::new();
        assert!(idx.is_empty());
        assert!(!idx.is_duplicate(""));
        assert!(idx.is_duplicate(""));
    }
}
