//! Cache key derivation.
//!
//! Both digests are deterministic functions of their inputs so that
//! identical requests collide on the same entry across sessions and
//! processes. Reproducibility is the contract here, not secrecy.

use sha2::{Digest, Sha256};

/// Digest of a set of table definitions, independent of enumeration order.
/// A changed table structure produces a new fingerprint, which silently
/// invalidates every cache entry built against the old one.
pub fn schema_fingerprint(table_ddls: &[String]) -> String {
    // Sort DDLs for consistent hashing
    let mut sorted: Vec<&str> = table_ddls.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();

    let schema_text = sorted.join("\n");

    let mut hasher = Sha256::new();
    hasher.update(schema_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key for a (tenant, question, schema fingerprint) triple.
///
/// The question is case-folded and trimmed before hashing, so
/// "Show sales" and "show sales " map to the same entry. That is
/// intentional: it is what makes the cache hit rate worth having.
pub fn cache_key(tenant: &str, question: &str, fingerprint: &str) -> String {
    let normalized = question.to_lowercase();
    let normalized = normalized.trim();

    let composite = format!("{}:{}:{}", tenant, normalized, fingerprint);

    let mut hasher = Sha256::new();
    hasher.update(composite.as_bytes());
    format!("{:x}", hasher.finalize())
}
