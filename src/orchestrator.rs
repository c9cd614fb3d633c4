//! Bridge-project materialization and external builds.
//!
//! A bridge crate is written out as a manifest plus `src/lib.rs` at a fixed
//! layout, then handed to a [`Toolchain`]. The default toolchain shells out
//! to `cargo build --release` and captures its output; tests substitute
//! [`MockToolchain`] so no real compiler runs. Builds are routed through the
//! compilation cache by the pipeline, so unchanged inputs never reach this
//! module twice.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{BuildFailure, Error, Result, SourceLocation};

/// A materialized bridge project on disk.
#[derive(Debug, Clone)]
pub struct ProjectHandle {
    pub name: String,
    pub root: PathBuf,
    pub manifest_path: PathBuf,
}

/// External build interface. The subprocess invocation blocks the calling
/// thread until the toolchain exits; there is no cancellation and no
/// internal timeout.
pub trait Toolchain: Send + Sync {
    /// Build the project and return the artifact path.
    fn build(&self, project: &ProjectHandle) -> std::result::Result<PathBuf, BuildFailure>;
}

#[derive(Debug, Default)]
pub struct Orchestrator {
    projects_root: PathBuf,
}

impl Orchestrator {
    pub fn new(projects_root: PathBuf) -> Self {
        Self { projects_root }
    }

    /// Write the manifest and source tree for a bridge crate. Projects are
    /// keyed by name, so re-materializing an unchanged unit is idempotent.
    pub fn materialize(&self, name: &str, manifest: &str, source: &str) -> Result<ProjectHandle> {
        let root = self.projects_root.join(name);
        let src_dir = root.join("src");
        fs::create_dir_all(&src_dir).map_err(|e| Error::io(&src_dir, e))?;

        let manifest_path = root.join("Cargo.toml");
        fs::write(&manifest_path, manifest).map_err(|e| Error::io(&manifest_path, e))?;
        let lib_path = src_dir.join("lib.rs");
        fs::write(&lib_path, source).map_err(|e| Error::io(&lib_path, e))?;

        debug!(project = %name, root = %root.display(), "materialized bridge project");
        Ok(ProjectHandle {
            name: name.to_string(),
            root,
            manifest_path,
        })
    }
}

/// The real thing: `cargo build` as a blocking subprocess.
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    pub release: bool,
    pub offline: bool,
}

impl Default for CargoToolchain {
    fn default() -> Self {
        Self {
            release: true,
            offline: false,
        }
    }
}

impl Toolchain for CargoToolchain {
    fn build(&self, project: &ProjectHandle) -> std::result::Result<PathBuf, BuildFailure> {
        let mut args: Vec<String> = vec!["build".into()];
        if self.release {
            args.push("--release".into());
        }
        if self.offline {
            args.push("--offline".into());
        }
        args.push("--manifest-path".into());
        args.push(project.manifest_path.display().to_string());

        debug!(project = %project.name, "invoking cargo build");
        let output = duct::cmd("cargo", &args)
            .dir(&project.root)
            .env("CARGO_TARGET_DIR", project.root.join("target"))
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|err| BuildFailure {
                status: None,
                stdout: String::new(),
                stderr: format!("failed to spawn cargo: {err}"),
                locations: Vec::new(),
                suggestions: vec!["is a Rust toolchain installed and on PATH?".to_string()],
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(build_failure(output.status.code(), stdout, stderr));
        }

        let profile = if self.release { "release" } else { "debug" };
        let artifact = project
            .root
            .join("target")
            .join(profile)
            .join(libloading::library_filename(&project.name));
        if artifact.exists() {
            Ok(artifact)
        } else {
            Err(BuildFailure {
                status: output.status.code(),
                stdout,
                stderr: format!("expected artifact `{}` was not produced", artifact.display()),
                locations: Vec::new(),
                suggestions: Vec::new(),
            })
        }
    }
}

/// Assemble a [`BuildFailure`] from raw toolchain output: pull out the
/// `--> file:line:col` references and attach heuristic fix hints.
pub fn build_failure(status: Option<i32>, stdout: String, stderr: String) -> BuildFailure {
    let locations = extract_locations(&stderr);
    let suggestions = suggest_fixes(&stderr);
    BuildFailure {
        status,
        stdout,
        stderr,
        locations,
        suggestions,
    }
}

fn extract_locations(stderr: &str) -> Vec<SourceLocation> {
    let mut out = Vec::new();
    for line in stderr.lines() {
        let Some(rest) = line.trim_start().strip_prefix("--> ") else {
            continue;
        };
        let mut pieces = rest.rsplitn(3, ':');
        let column = pieces.next().and_then(|c| c.trim().parse::<u32>().ok());
        let line_no = pieces.next().and_then(|l| l.parse::<u32>().ok());
        let file = pieces.next();
        if let (Some(file), Some(line), Some(column)) = (file, line_no, column) {
            out.push(SourceLocation {
                file: file.to_string(),
                line,
                column,
            });
        }
    }
    out
}

/// A few well-known failure shapes get a pointed hint; everything else keeps
/// just the raw output.
fn suggest_fixes(stderr: &str) -> Vec<String> {
    let mut out = Vec::new();
    if stderr.contains("use of undeclared crate or module")
        || stderr.contains("can't find crate")
        || stderr.contains("unresolved import")
    {
        out.push(
            "a crate may be missing from the embedded dependencies; declare it with \
             `// deps: name = \"version\"`"
                .to_string(),
        );
    }
    if stderr.contains("the trait bound") {
        out.push(
            "a declared constraint is not satisfied by the substituted type; check the \
             concrete types this generic was called with"
                .to_string(),
        );
    }
    if stderr.contains("failed to get") && stderr.contains("offline") {
        out.push("dependency not in the local registry cache; retry without offline mode".to_string());
    }
    out
}

/// Test toolchain: fabricates a deterministic artifact and counts builds, so
/// cache idempotence and monomorphization determinism are observable without
/// a real compiler. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct MockToolchain {
    builds: Arc<AtomicUsize>,
    fail_with: Option<String>,
}

impl MockToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A toolchain that always fails with `stderr`, for exercising the
    /// failure path.
    pub fn failing(stderr: impl Into<String>) -> Self {
        Self {
            builds: Arc::new(AtomicUsize::new(0)),
            fail_with: Some(stderr.into()),
        }
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Toolchain for MockToolchain {
    fn build(&self, project: &ProjectHandle) -> std::result::Result<PathBuf, BuildFailure> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(stderr) = &self.fail_with {
            return Err(build_failure(Some(101), String::new(), stderr.clone()));
        }
        let dir = project.root.join("target").join("release");
        fs::create_dir_all(&dir).map_err(|e| BuildFailure {
            status: None,
            stdout: String::new(),
            stderr: format!("mock toolchain io error: {e}"),
            locations: Vec::new(),
            suggestions: Vec::new(),
        })?;
        let artifact = dir.join(libloading::library_filename(&project.name));
        let payload = format!("mock artifact for {}", project.name);
        fs::write(&artifact, payload).map_err(|e| BuildFailure {
            status: None,
            stdout: String::new(),
            stderr: format!("mock toolchain io error: {e}"),
            locations: Vec::new(),
            suggestions: Vec::new(),
        })?;
        Ok(artifact)
    }
}

/// Default projects root next to the cache entries.
pub fn default_projects_root(cache_root: &Path) -> PathBuf {
    cache_root.join("projects")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_writes_fixed_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(tmp.path().to_path_buf());
        let handle = orchestrator
            .materialize("ferrule_unit_abc", "[package]\nname = \"x\"\n", "fn f() {}\n")
            .unwrap();
        assert!(handle.manifest_path.exists());
        assert!(handle.root.join("src").join("lib.rs").exists());
        assert_eq!(handle.name, "ferrule_unit_abc");
    }

    #[test]
    fn test_mock_toolchain_counts_builds() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(tmp.path().to_path_buf());
        let handle = orchestrator
            .materialize("ferrule_unit_mock", "[package]\n", "")
            .unwrap();
        let toolchain = MockToolchain::new();
        let first = toolchain.build(&handle).unwrap();
        let second = toolchain.build(&handle).unwrap();
        assert_eq!(first, second);
        assert_eq!(toolchain.build_count(), 2);
        assert!(first.exists());
    }

    #[test]
    fn test_build_failure_extracts_locations_and_hints() {
        let stderr = r#"error[E0433]: use of undeclared crate or module `rand`
 --> src/lib.rs:3:13
  |
3 |     let x = rand::random::<f64>();
  |             ^^^^ use of undeclared crate or module `rand`
"#;
        let failure = build_failure(Some(101), String::new(), stderr.to_string());
        assert_eq!(
            failure.locations,
            vec![SourceLocation {
                file: "src/lib.rs".into(),
                line: 3,
                column: 13,
            }]
        );
        assert!(!failure.suggestions.is_empty());
        assert!(failure.suggestions[0].contains("// deps:"));
        let rendered = failure.to_string();
        assert!(rendered.contains("src/lib.rs:3:13"));
        assert!(rendered.contains("hint:"));
    }

    #[test]
    fn test_trait_bound_failure_names_substitution() {
        let stderr = "error[E0277]: the trait bound `bool: Add` is not satisfied";
        let failure = build_failure(Some(101), String::new(), stderr.to_string());
        assert!(failure
            .suggestions
            .iter()
            .any(|s| s.contains("substituted type")));
    }
}
