//! Vocabulary memoizer: bidirectional word ↔ dense integer id map.
//!
//! Ids are assigned in first-seen order starting from a configured minimum,
//! so two runs over the same input produce identical ids. The structure is
//! single-producer during ingestion and read-only afterwards; callers
//! provide any synchronization they need.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Dense non-negative word identifier.
pub type WordId = u32;

/// String ↔ id memoizer.
///
/// `memoize` is idempotent; `unmemoize` is total over every id the memoizer
/// has issued. At test time `try_memoize` looks a word up without inserting,
/// so unknown words never pollute the vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    by_word: AHashMap<String, WordId>,
    words: Vec<String>,
    min_id: WordId,
}

impl Vocab {
    /// New memoizer issuing ids from 0.
    pub fn new() -> Self {
        Self::with_min_id(0)
    }

    /// New memoizer issuing ids from `min_id`.
    pub fn with_min_id(min_id: WordId) -> Self {
        Self {
            by_word: AHashMap::new(),
            words: Vec::new(),
            min_id,
        }
    }

    /// Return the id for `word`, assigning the next id on first sight.
    pub fn memoize(&mut self, word: &str) -> WordId {
        if let Some(&id) = self.by_word.get(word) {
            return id;
        }
        let id = self.min_id + self.words.len() as WordId;
        self.by_word.insert(word.to_owned(), id);
        self.words.push(word.to_owned());
        id
    }

    /// Look a word up without inserting it.
    pub fn try_memoize(&self, word: &str) -> Option<WordId> {
        self.by_word.get(word).copied()
    }

    /// Reverse lookup.
    ///
    /// Panics on an id this memoizer never issued; that is a caller contract
    /// bug, not a runtime condition.
    pub fn unmemoize(&self, id: WordId) -> &str {
        &self.words[(id - self.min_id) as usize]
    }

    /// Number of distinct memoized words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memoize_is_idempotent_and_dense() {
        let mut v = Vocab::new();
        let a = v.memoize("boston");
        let b = v.memoize("austin");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(v.memoize("boston"), a);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn roundtrip_is_byte_for_byte() {
        let mut v = Vocab::new();
        for w in ["Zürich", "naïve", "x", ""] {
            let id = v.memoize(w);
            assert_eq!(v.unmemoize(id), w);
        }
    }

    #[test]
    fn try_memoize_does_not_insert() {
        let mut v = Vocab::new();
        v.memoize("seen");
        assert_eq!(v.try_memoize("seen"), Some(0));
        assert_eq!(v.try_memoize("unseen"), None);
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn min_id_offsets_issued_ids() {
        let mut v = Vocab::with_min_id(1);
        assert_eq!(v.memoize("w"), 1);
        assert_eq!(v.unmemoize(1), "w");
    }

    #[test]
    #[should_panic]
    fn unmemoize_unissued_id_panics() {
        let v = Vocab::new();
        let _ = v.unmemoize(3);
    }
}
