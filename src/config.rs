//! Compiler configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Knobs for one compilation pipeline. The artifact-affecting subset feeds
/// the cache key through [`CompilerConfig::fingerprint`], so flipping one of
/// those knobs never reuses a stale artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Cache root override; defaults to the per-user cache directory.
    pub cache_root: Option<PathBuf>,
    /// Where bridge projects are materialized; defaults to `projects/` next
    /// to the cache entries.
    pub project_root: Option<PathBuf>,
    /// Optimized builds (`cargo build --release`). On by default: bridge
    /// crates are built rarely and called often.
    pub release: bool,
    /// Edition stamped into generated bridge manifests.
    pub edition: String,
    /// Promote unresolved dependency divergence from a warning to an error.
    pub strict_deps: bool,
    /// Pass `--offline` to the toolchain.
    pub offline: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            project_root: None,
            release: true,
            edition: "2021".to_string(),
            strict_deps: false,
            offline: false,
        }
    }
}

impl CompilerConfig {
    /// Stable digest input covering every knob that changes the produced
    /// artifact. Paths and policy flags (strict mode) stay out.
    pub fn fingerprint(&self) -> String {
        format!("release={};edition={}", self.release, self.edition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_artifact_knobs() {
        let base = CompilerConfig::default();
        let mut debug = CompilerConfig::default();
        debug.release = false;
        assert_ne!(base.fingerprint(), debug.fingerprint());

        let mut strict = CompilerConfig::default();
        strict.strict_deps = true;
        assert_eq!(base.fingerprint(), strict.fingerprint());
    }
}
