//! The compiler's error taxonomy.
//!
//! Extraction and bridging problems are reported per declaration and never
//! block their neighbours; build and runtime failures carry full diagnostic
//! context to the caller; cache integrity problems never surface here at all
//! (the store treats them as silent misses and rebuilds).

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use ferrule_cache::{CacheError, GetOrBuildError};
use ferrule_ffi::{BridgeError, ExtractError, StubError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A type reachable from a public signature has no FFI-safe
    /// representation. Raised before any compile attempt.
    #[error(transparent)]
    UnsupportedType(#[from] BridgeError),

    /// The marked source does not parse at all.
    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error(transparent)]
    Stub(#[from] StubError),

    /// Unresolved dependency divergence under strict mode. Outside strict
    /// mode the same divergence is a logged warning.
    #[error("conflicting dependency specifications for `{name}`: `{left}` vs `{right}`")]
    DependencyConflict {
        name: String,
        left: String,
        right: String,
    },

    /// The foreign toolchain exited non-zero.
    #[error(transparent)]
    Build(#[from] BuildFailure),

    #[error("cannot specialize `{name}`: {reason}")]
    Monomorphization { name: String, reason: String },

    /// Any non-drop operation on a released handle.
    #[error("use after drop of `{class}` handle")]
    UseAfterDrop { class: String },

    /// `clone` on a unique handle; only shared kinds are cloneable.
    #[error("`{class}` handle is uniquely owned and cannot be cloned")]
    UncloneableHandle { class: String },

    #[error("module has no binding named `{0}`")]
    SymbolNotFound(String),

    #[error("`{symbol}` expects {expected} argument(s), got {actual}")]
    ArityMismatch {
        symbol: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument `{param}` of `{symbol}`: expected {expected}, got {actual}")]
    TypeMismatch {
        symbol: String,
        param: String,
        expected: String,
        actual: String,
    },

    /// The foreign side reported a failure through the dispatcher.
    #[error("foreign call failed: {0}")]
    Foreign(String),

    /// The dispatcher returned something the host could not interpret.
    #[error("malformed dispatcher response: {0}")]
    Protocol(String),

    #[error("failed to load artifact {}: {source}", path.display())]
    ArtifactLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<GetOrBuildError<Error>> for Error {
    fn from(err: GetOrBuildError<Error>) -> Self {
        match err {
            GetOrBuildError::Build(inner) => inner,
            GetOrBuildError::Cache(cache) => Error::Cache(cache),
        }
    }
}

/// A `file:line:column` reference extracted from toolchain output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Non-zero toolchain exit, with the raw output, the source references
/// pulled out of it, and heuristic fix suggestions.
#[derive(Debug)]
pub struct BuildFailure {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub locations: Vec<SourceLocation>,
    pub suggestions: Vec<String>,
}

impl std::error::Error for BuildFailure {}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "foreign toolchain failed")?;
        if let Some(code) = self.status {
            write!(f, " (exit code {code})")?;
        }
        if !self.locations.is_empty() {
            write!(f, " at ")?;
            for (i, loc) in self.locations.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{loc}")?;
            }
        }
        for suggestion in &self.suggestions {
            write!(f, "\n  hint: {suggestion}")?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}
