//! Target stores
//!
//! One capability trait per target family, each implemented by an in-process
//! adapter and by a network adapter. Network adapters ping the server once
//! and pick a dialect for the rest of their life instead of branching on
//! every call.

pub mod cache;
pub mod document;
pub mod graph;
pub mod search;

pub use cache::{CacheStore, MemoryCache, RedisCache};
pub use document::{DocumentStore, IndexSpec, MemoryDocuments, PgDocuments};
pub use graph::{EdgeRef, GraphStore, MemoryGraph, Neo4jGraph};
pub use search::{ElasticSearch, FieldSpec, IndexDefinition, MemorySearch, SearchHit, SearchStore};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The four target families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Graph,
    Document,
    Search,
    Cache,
}

impl TargetKind {
    pub const ALL: [TargetKind; 4] = [
        TargetKind::Graph,
        TargetKind::Document,
        TargetKind::Search,
        TargetKind::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Graph => "graph",
            TargetKind::Document => "document",
            TargetKind::Search => "search",
            TargetKind::Cache => "cache",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex sha256 over a sequence of canonical lines
#[cfg(test)]
pub(crate) fn fingerprint_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_ref());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Glob match supporting `*` and `?`, as used by key scans
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("student:*", "student:12"));
        assert!(glob_match("student:*:visits", "student:12:visits"));
        assert!(glob_match("group:*:students", "group:1:students"));
        assert!(!glob_match("student:*:visits", "student:12"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        assert_eq!(fingerprint_lines(["a", "b"]), fingerprint_lines(["a", "b"]));
        assert_ne!(fingerprint_lines(["a", "b"]), fingerprint_lines(["b", "a"]));
    }
}
