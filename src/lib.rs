//! ferrule: a binding compiler that lets a dynamically-typed host runtime
//! call Rust without hand-written glue.
//!
//! Declarations marked `#[bind]` in embedded Rust source are extracted,
//! type-bridged, compiled into a `cdylib` bridge crate through a
//! content-addressed build cache, and exposed back to the host as a
//! [`HostModule`] of strongly-typed wrappers. Generic declarations are
//! specialized per concrete argument tuple on first call; foreign-owned
//! return values are tracked as [`HostHandle`]s with exactly-once release.
//!
//! ```no_run
//! use ferrule::{CompilerConfig, CompilerContext, HostValue};
//!
//! let ctx = CompilerContext::new(CompilerConfig::default())?;
//! let module = ctx.compile_and_bind(
//!     r#"
//!     #[bind]
//!     fn add(a: i32, b: i32) -> i32 { a + b }
//!     "#,
//! )?;
//! let sum = module.call("add", &[HostValue::Int32(10), HostValue::Int32(20)])?;
//! assert_eq!(sum.as_int(), Some(30));
//! # Ok::<(), ferrule::Error>(())
//! ```

pub mod compile;
pub mod config;
pub mod context;
pub mod deps;
pub mod error;
pub mod handles;
pub mod module;
pub mod mono;
pub mod orchestrator;

pub use compile::CompiledUnit;
pub use config::CompilerConfig;
pub use context::{AltCodegenRegistry, CompilerContext, StubFlavor};
pub use deps::{DependencySource, DependencySpec};
pub use error::{BuildFailure, Error, Result, SourceLocation};
pub use handles::{HandleRegistry, HostHandle};
pub use module::{BindingKind, BoundFunction, HostFallible, HostMaybe, HostModule, HostValue};
pub use orchestrator::{CargoToolchain, MockToolchain, Orchestrator, ProjectHandle, Toolchain};

pub use ferrule_cache::{CacheKey, CacheStore};
pub use ferrule_common::{Diagnostic, Severity};
pub use ferrule_ffi::types::{
    FunctionSignature, HostType, OwnershipKind, Primitive, ReceiverKind, StructDescriptor,
    TypeDescriptor,
};
pub use ferrule_ffi::{to_foreign, to_host};
