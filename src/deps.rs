//! Embedded dependency declarations.
//!
//! Two textual conventions are recognized inside the marked source:
//!
//! an inline single-line list
//! ```text
//! // deps: rand = "0.8", serde = { version = "1.0", features = ["derive"] }
//! ```
//!
//! and a fenced manifest block
//! ```text
//! //! ```manifest
//! //! [dependencies]
//! //! rand = "0.8"
//! //! ```
//! ```
//!
//! Merging deduplicates by name: the more specific version constraint wins,
//! feature flags union, and unresolved divergence is a warning that strict
//! mode promotes to an error.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use ferrule_common::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencySource {
    /// Semver constraint string; `"*"` when the declaration gave none.
    Version(String),
    Path(PathBuf),
    Git { url: String, rev: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub source: DependencySource,
    pub features: Vec<String>,
    pub default_features: bool,
}

impl DependencySpec {
    pub fn version(name: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: DependencySource::Version(constraint.into()),
            features: Vec::new(),
            default_features: true,
        }
    }

    /// Render the manifest value for this spec (`"0.8"` or an inline table).
    pub fn manifest_entry(&self) -> String {
        let mut items = Vec::new();
        match &self.source {
            DependencySource::Version(version) => {
                if self.features.is_empty() && self.default_features {
                    return format!("\"{version}\"");
                }
                items.push(format!("version = \"{version}\""));
            }
            DependencySource::Path(path) => {
                items.push(format!("path = \"{}\"", path.display()));
            }
            DependencySource::Git { url, rev } => {
                items.push(format!("git = \"{url}\""));
                if let Some(rev) = rev {
                    items.push(format!("rev = \"{rev}\""));
                }
            }
        }
        if !self.features.is_empty() {
            let features = self
                .features
                .iter()
                .map(|f| format!("\"{f}\""))
                .collect::<Vec<_>>()
                .join(", ");
            items.push(format!("features = [{features}]"));
        }
        if !self.default_features {
            items.push("default-features = false".to_string());
        }
        format!("{{ {} }}", items.join(", "))
    }

    fn source_description(&self) -> String {
        match &self.source {
            DependencySource::Version(v) => v.clone(),
            DependencySource::Path(p) => format!("path:{}", p.display()),
            DependencySource::Git { url, .. } => format!("git:{url}"),
        }
    }
}

/// Specs found in a source text plus warnings for malformed declarations.
#[derive(Debug, Default)]
pub struct ParsedDeps {
    pub specs: Vec<DependencySpec>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A divergence the merge could not resolve by specificity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub name: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub specs: Vec<DependencySpec>,
    pub conflicts: Vec<Conflict>,
}

/// Scan `source` for both embedded conventions.
pub fn parse(source: &str) -> ParsedDeps {
    let mut out = ParsedDeps::default();
    parse_inline(source, &mut out);
    parse_fenced(source, &mut out);
    out
}

fn parse_inline(source: &str, out: &mut ParsedDeps) {
    for line in source.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("// deps:") else {
            continue;
        };
        for entry in split_top_level(rest) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match parse_entry(entry) {
                Ok(spec) => out.specs.push(spec),
                Err(message) => out
                    .diagnostics
                    .push(Diagnostic::warning(format!("ignoring dependency `{entry}`: {message}"))),
            }
        }
    }
}

fn parse_fenced(source: &str, out: &mut ParsedDeps) {
    let mut in_block = false;
    let mut in_dependencies = false;
    for line in source.lines() {
        let trimmed = line.trim_start();
        let Some(doc) = trimmed.strip_prefix("//!") else {
            // Leaving doc comments ends any open block.
            in_block = false;
            in_dependencies = false;
            continue;
        };
        let doc = doc.trim();
        if !in_block {
            if doc == "```manifest" {
                in_block = true;
                in_dependencies = false;
            }
            continue;
        }
        if doc == "```" {
            in_block = false;
            continue;
        }
        if doc.starts_with('[') {
            in_dependencies = doc == "[dependencies]";
            continue;
        }
        if !in_dependencies || doc.is_empty() {
            continue;
        }
        match parse_entry(doc) {
            Ok(spec) => out.specs.push(spec),
            Err(message) => out
                .diagnostics
                .push(Diagnostic::warning(format!("ignoring dependency `{doc}`: {message}"))),
        }
    }
}

/// One `name = value` entry, where the value is either a quoted constraint or
/// an inline table with version/path/git/features/default-features keys.
fn parse_entry(entry: &str) -> Result<DependencySpec, String> {
    let (name, value) = entry
        .split_once('=')
        .ok_or_else(|| "expected `name = value`".to_string())?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(format!("invalid dependency name `{name}`"));
    }
    let value = value.trim();

    if let Some(version) = unquote(value) {
        return Ok(DependencySpec::version(name, version));
    }

    let table = value
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .ok_or_else(|| "expected a quoted version or `{ ... }` table".to_string())?;

    let mut version = None;
    let mut path = None;
    let mut git = None;
    let mut rev = None;
    let mut features = Vec::new();
    let mut default_features = true;

    for field in split_top_level(table) {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (key, raw) = field
            .split_once('=')
            .ok_or_else(|| format!("expected `key = value` in `{field}`"))?;
        let key = key.trim();
        let raw = raw.trim();
        match key {
            "version" => version = Some(unquote(raw).ok_or("version must be quoted")?),
            "path" => path = Some(unquote(raw).ok_or("path must be quoted")?),
            "git" => git = Some(unquote(raw).ok_or("git url must be quoted")?),
            "rev" => rev = Some(unquote(raw).ok_or("rev must be quoted")?),
            "features" => {
                let inner = raw
                    .strip_prefix('[')
                    .and_then(|v| v.strip_suffix(']'))
                    .ok_or("features must be a `[...]` list")?;
                for feature in inner.split(',') {
                    let feature = feature.trim();
                    if feature.is_empty() {
                        continue;
                    }
                    features.push(
                        unquote(feature)
                            .ok_or_else(|| format!("feature `{feature}` must be quoted"))?,
                    );
                }
            }
            "default-features" | "default_features" => {
                default_features = raw
                    .parse::<bool>()
                    .map_err(|_| "default-features must be true or false".to_string())?;
            }
            other => return Err(format!("unknown dependency key `{other}`")),
        }
    }

    let source = if let Some(path) = path {
        DependencySource::Path(PathBuf::from(path))
    } else if let Some(url) = git {
        DependencySource::Git { url, rev }
    } else {
        DependencySource::Version(version.unwrap_or_else(|| "*".to_string()))
    };

    Ok(DependencySpec {
        name: name.to_string(),
        source,
        features,
        default_features,
    })
}

fn unquote(value: &str) -> Option<String> {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .map(|v| v.to_string())
}

/// Split on commas that sit outside quotes, braces, and brackets.
fn split_top_level(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut current = String::new();
    for ch in input.chars() {
        match ch {
            '"' => {
                in_string = !in_string;
                current.push(ch);
            }
            '{' | '[' if !in_string => {
                depth += 1;
                current.push(ch);
            }
            '}' | ']' if !in_string => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if !in_string && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Merge two spec lists, deduplicating by name. After merging at most one
/// spec exists per name.
pub fn merge(left: Vec<DependencySpec>, right: Vec<DependencySpec>) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut merged: Vec<DependencySpec> = Vec::new();

    for spec in left.into_iter().chain(right) {
        match merged.iter_mut().find(|existing| existing.name == spec.name) {
            None => merged.push(spec),
            Some(existing) => {
                if let Some(conflict) = merge_pair(existing, spec) {
                    warn!(
                        name = %conflict.name,
                        left = %conflict.left,
                        right = %conflict.right,
                        "unresolved dependency divergence, keeping the first declaration"
                    );
                    outcome.conflicts.push(conflict);
                }
            }
        }
    }

    outcome.specs = merged;
    outcome
}

/// Fold `incoming` into `existing`. Returns an unresolved conflict when the
/// two constraints diverge without a clear winner.
fn merge_pair(existing: &mut DependencySpec, incoming: DependencySpec) -> Option<Conflict> {
    for feature in &incoming.features {
        if !existing.features.contains(feature) {
            existing.features.push(feature.clone());
        }
    }
    existing.features.sort();
    existing.default_features = existing.default_features && incoming.default_features;

    let conflict = match (&existing.source, &incoming.source) {
        (a, b) if a == b => None,
        (DependencySource::Version(a), DependencySource::Version(b)) => {
            match specificity(a).cmp(&specificity(b)) {
                std::cmp::Ordering::Less => {
                    existing.source = incoming.source.clone();
                    None
                }
                std::cmp::Ordering::Greater => None,
                std::cmp::Ordering::Equal => Some(Conflict {
                    name: existing.name.clone(),
                    left: a.clone(),
                    right: b.clone(),
                }),
            }
        }
        // A concrete location beats a registry constraint.
        (DependencySource::Version(_), _) => {
            existing.source = incoming.source.clone();
            None
        }
        (_, DependencySource::Version(_)) => None,
        (a, _) => Some(Conflict {
            name: existing.name.clone(),
            left: match a {
                DependencySource::Path(p) => format!("path:{}", p.display()),
                DependencySource::Git { url, .. } => format!("git:{url}"),
                DependencySource::Version(v) => v.clone(),
            },
            right: incoming.source_description(),
        }),
    };
    conflict
}

/// How precise a version constraint is: `*` not at all, then by the number
/// of numeric components (`1` < `1.2` < `1.2.3`).
fn specificity(constraint: &str) -> usize {
    let trimmed = constraint.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return 0;
    }
    1 + trimmed.matches('.').count()
}
