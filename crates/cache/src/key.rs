//! Content-addressed cache keys.

use sha1::{Digest, Sha1};

/// Key over (normalized source, compiler config, sorted dependency set).
/// Two processes with identical inputs compute identical keys and share one
/// cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(source: &str, config_fingerprint: &str, dependencies: &[String]) -> Self {
        let mut sorted: Vec<&String> = dependencies.iter().collect();
        sorted.sort();

        let mut hasher = Sha1::new();
        hasher.update(normalize_source(source).as_bytes());
        hasher.update(b"\0config:");
        hasher.update(config_fingerprint.as_bytes());
        for dep in sorted {
            hasher.update(b"\0dep:");
            hasher.update(dep.as_bytes());
        }
        CacheKey(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already-computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        CacheKey(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in generated package names and log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whitespace-insensitive normalization so editor churn does not defeat the
/// cache: CRLF to LF, trailing whitespace stripped per line, leading and
/// trailing blank lines dropped.
pub fn normalize_source(source: &str) -> String {
    let cleaned = source.replace("\r\n", "\n");
    let joined = cleaned
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_ignores_trailing_whitespace() {
        let a = "fn add() {}   \n\n";
        let b = "fn add() {}\n";
        assert_eq!(normalize_source(a), normalize_source(b));
    }

    #[test]
    fn test_key_stable_under_dependency_order() {
        let deps_a = vec!["serde = \"1\"".to_string(), "rand = \"0.8\"".to_string()];
        let deps_b = vec!["rand = \"0.8\"".to_string(), "serde = \"1\"".to_string()];
        let a = CacheKey::compute("fn f() {}", "release", &deps_a);
        let b = CacheKey::compute("fn f() {}", "release", &deps_b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_changes_with_config() {
        let a = CacheKey::compute("fn f() {}", "release", &[]);
        let b = CacheKey::compute("fn f() {}", "debug", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_changes_with_source() {
        let a = CacheKey::compute("fn f() {}", "release", &[]);
        let b = CacheKey::compute("fn g() {}", "release", &[]);
        assert_ne!(a, b);
    }
}
