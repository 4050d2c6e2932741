//! Named prepared statements known to one connection.
//!
//! The server keeps a statement until it is closed or the session ends, so
//! the client has to remember which names it already parsed and with what
//! text. Reusing a name with identical text skips the Parse; reusing it with
//! different text is a submission error.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::error::{PgError, PgResult};

/// What a named query needs before it can be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// Already parsed with this exact text.
    Reuse,
    /// Must be parsed. If the map was full, `evicted` names the statement
    /// that has to be closed on the server first.
    Parse { evicted: Option<String> },
}

/// O(1) LRU map of statement name to query text.
///
/// Bounded so a long-lived connection that generates names cannot grow the
/// server's statement memory without limit.
pub struct PreparedStatements {
    names: LruCache<String, String>,
}

impl PreparedStatements {
    /// Create a map holding at most `capacity` names.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            names: LruCache::new(cap),
        }
    }

    /// Decide whether `name` needs a Parse and record it as parsed.
    ///
    /// Nothing is recorded on conflict, so the caller can fail the query
    /// without touching the wire.
    pub fn prepare(&mut self, name: &str, text: &str) -> PgResult<Preparation> {
        if let Some(previous) = self.names.get(name) {
            if previous == text {
                return Ok(Preparation::Reuse);
            }
            return Err(PgError::PreparedStatementConflict {
                name: name.to_string(),
            });
        }

        let evicted = self
            .names
            .push(name.to_string(), text.to_string())
            .map(|(evicted, _)| evicted);
        Ok(Preparation::Parse { evicted })
    }

    /// Text a name was parsed with. Does not touch LRU order.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.names.peek(name).map(String::as_str)
    }

    /// Forget a name, e.g. because its Parse failed.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.names.pop(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.names.cap().get()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

impl Default for PreparedStatements {
    fn default() -> Self {
        Self::new(super::config::DEFAULT_STATEMENT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_same_text() {
        let mut stmts = PreparedStatements::new(4);
        assert_eq!(
            stmts.prepare("ins", "INSERT INTO t VALUES ($1)").unwrap(),
            Preparation::Parse { evicted: None }
        );
        assert_eq!(
            stmts.prepare("ins", "INSERT INTO t VALUES ($1)").unwrap(),
            Preparation::Reuse
        );
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_conflict_leaves_map_untouched() {
        let mut stmts = PreparedStatements::new(4);
        stmts.prepare("q", "SELECT 1").unwrap();

        let err = stmts.prepare("q", "SELECT 2").unwrap_err();
        assert!(matches!(err, PgError::PreparedStatementConflict { ref name } if name == "q"));
        assert_eq!(stmts.get("q"), Some("SELECT 1"));
    }

    #[test]
    fn test_eviction_reports_lru_name() {
        let mut stmts = PreparedStatements::new(2);
        stmts.prepare("a", "SELECT 'a'").unwrap();
        stmts.prepare("b", "SELECT 'b'").unwrap();

        // Touch "a" so "b" becomes least recently used.
        assert_eq!(stmts.prepare("a", "SELECT 'a'").unwrap(), Preparation::Reuse);

        assert_eq!(
            stmts.prepare("c", "SELECT 'c'").unwrap(),
            Preparation::Parse {
                evicted: Some("b".to_string())
            }
        );
        assert!(stmts.contains("a"));
        assert!(!stmts.contains("b"));
        assert_eq!(stmts.capacity(), 2);
    }

    #[test]
    fn test_remove_allows_new_text() {
        let mut stmts = PreparedStatements::new(2);
        stmts.prepare("q", "SELECT bad syntax").unwrap();
        stmts.remove("q");
        assert_eq!(
            stmts.prepare("q", "SELECT 1").unwrap(),
            Preparation::Parse { evicted: None }
        );
    }

    #[test]
    fn test_zero_capacity_clamps_to_one() {
        let stmts = PreparedStatements::new(0);
        assert_eq!(stmts.capacity(), 1);
        assert!(stmts.is_empty());
    }
}
