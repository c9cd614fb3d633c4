//! The compiler context: every registry the pipeline touches, behind
//! explicit locks, with no process-global state.
//!
//! One coarse lock guards the generic-instance registry and the
//! loaded-artifact table together; the experimental alternate-codegen
//! registry sits behind its own lock so it never contends with the primary
//! path. Independent contexts are fully isolated, which is what makes the
//! test suite possible.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use ferrule_cache::{CacheEntry, CacheStore};
use ferrule_ffi::types::TypeDescriptor;

use crate::compile::{self, CompiledUnit};
use crate::config::CompilerConfig;
use crate::error::{Error, Result};
use crate::handles::HandleRegistry;
use crate::module::{invoke, HostModule, HostValue, LoadedArtifact};
use crate::mono::{self, MonoInstance, MonoRegistry};
use crate::orchestrator::{default_projects_root, CargoToolchain, Orchestrator, Toolchain};

/// An alternate stub-generation flavor. The portable flavor emits typed
/// wrappers only (no dispatcher), for hosts that call through a plain C ABI.
#[derive(Debug, Clone)]
pub struct StubFlavor {
    pub name: String,
    pub dispatcher: bool,
}

/// Experimental registry of alternate code generators.
#[derive(Debug)]
pub struct AltCodegenRegistry {
    flavors: HashMap<String, StubFlavor>,
}

impl Default for AltCodegenRegistry {
    fn default() -> Self {
        let mut flavors = HashMap::new();
        flavors.insert(
            "portable".to_string(),
            StubFlavor {
                name: "portable".to_string(),
                dispatcher: false,
            },
        );
        Self { flavors }
    }
}

impl AltCodegenRegistry {
    pub fn register(&mut self, flavor: StubFlavor) {
        self.flavors.insert(flavor.name.clone(), flavor);
    }

    pub fn get(&self, name: &str) -> Option<StubFlavor> {
        self.flavors.get(name).cloned()
    }
}

pub(crate) struct SharedState {
    pub mono: MonoRegistry,
    /// Loaded artifacts keyed by cache key; libraries stay mapped for the
    /// context lifetime.
    pub artifacts: HashMap<String, Arc<LoadedArtifact>>,
}

pub(crate) struct ContextInner {
    pub config: CompilerConfig,
    pub cache: CacheStore,
    pub orchestrator: Orchestrator,
    pub toolchain: Box<dyn Toolchain>,
    pub state: Mutex<SharedState>,
    pub alt_codegen: Mutex<AltCodegenRegistry>,
    pub handles: HandleRegistry,
}

impl ContextInner {
    pub(crate) fn is_registered_generic(&self, name: &str) -> bool {
        self.state.lock().mono.is_generic(name)
    }

    /// Memoized artifact loading: one `Library` per cache key per context.
    pub(crate) fn load_artifact(&self, entry: &CacheEntry) -> Result<Arc<LoadedArtifact>> {
        let key = entry.key.as_str().to_string();
        if let Some(artifact) = self.state.lock().artifacts.get(&key) {
            return Ok(Arc::clone(artifact));
        }
        let artifact = LoadedArtifact::load(&entry.artifact_path, entry.symbols.clone())?;
        self.state
            .lock()
            .artifacts
            .insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }
}

/// Call-site-driven specialization: infer the concrete type tuple, reuse the
/// memoized instance when one exists, otherwise compile the specialization as
/// its own cached unit. The registry lock is not held across the build.
pub(crate) fn call_generic(
    inner: &Arc<ContextInner>,
    module: &HostModule,
    name: &str,
    args: &[HostValue],
) -> Result<HostValue> {
    let mut arg_types = Vec::with_capacity(args.len());
    for arg in args {
        arg_types.push(arg.foreign_descriptor().ok_or_else(|| Error::TypeMismatch {
            symbol: name.to_string(),
            param: "argument".to_string(),
            expected: "a bindable concrete type".to_string(),
            actual: arg.type_name().to_string(),
        })?);
    }

    let entry = inner
        .state
        .lock()
        .mono
        .entry(name)
        .cloned()
        .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;

    let bindings = mono::infer_bindings(&entry, &arg_types)?;
    let tags = mono::type_tags(&bindings);
    let key = (name.to_string(), tags.clone());

    if let Some((instance, artifact)) = {
        let state = inner.state.lock();
        state.mono.instance(&key).map(|instance| {
            (
                instance.clone(),
                state.artifacts.get(&instance.cache_key).cloned(),
            )
        })
    } {
        if let Some(artifact) = artifact {
            debug!(name, tags = ?tags, "reusing monomorphized instance");
            return invoke(&artifact, &inner.handles, &instance.signature, args);
        }
    }

    debug!(name, tags = ?tags, "compiling new monomorphized instance");
    let specialized = mono::specialize_source(&entry, &bindings)?;
    let unit_source = format!("{}\n{}", module.source, specialized);
    let unit = compile::compile_unit(inner, &unit_source, None)?;
    let artifact = inner.load_artifact(&unit.entry)?;
    let signature = mono::specialize_signature(&entry, &bindings);
    let cache_key = unit.entry.key.as_str().to_string();

    {
        let mut state = inner.state.lock();
        state.mono.insert_instance(
            key,
            MonoInstance {
                symbol: signature.symbol(),
                signature: signature.clone(),
                cache_key,
            },
        );
    }

    invoke(&artifact, &inner.handles, &signature, args)
}

/// Owner of one independent compilation pipeline: cache, toolchain,
/// registries, and handle accounting.
pub struct CompilerContext {
    inner: Arc<ContextInner>,
}

impl CompilerContext {
    /// A context backed by the real cargo toolchain.
    pub fn new(config: CompilerConfig) -> Result<Self> {
        let toolchain = CargoToolchain {
            release: config.release,
            offline: config.offline,
        };
        Self::with_toolchain(config, Box::new(toolchain))
    }

    /// A context with a substituted toolchain; tests use [`MockToolchain`]
    /// here so no real compiler runs.
    ///
    /// [`MockToolchain`]: crate::orchestrator::MockToolchain
    pub fn with_toolchain(config: CompilerConfig, toolchain: Box<dyn Toolchain>) -> Result<Self> {
        let cache = CacheStore::open(config.cache_root.as_deref())?;
        let projects_root = config
            .project_root
            .clone()
            .unwrap_or_else(|| default_projects_root(cache.root()));
        let orchestrator = Orchestrator::new(projects_root);
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                cache,
                orchestrator,
                toolchain,
                state: Mutex::new(SharedState {
                    mono: MonoRegistry::new(),
                    artifacts: HashMap::new(),
                }),
                alt_codegen: Mutex::new(AltCodegenRegistry::default()),
                handles: HandleRegistry::new(),
            }),
        })
    }

    /// Compile marked source through extraction, validation, generation, and
    /// the cache, without loading the artifact.
    pub fn compile(&self, source: &str) -> Result<CompiledUnit> {
        compile::compile_unit(&self.inner, source, None)
    }

    /// Compile with a registered alternate codegen flavor.
    pub fn compile_with_flavor(&self, source: &str, flavor: &str) -> Result<CompiledUnit> {
        let flavor = self
            .inner
            .alt_codegen
            .lock()
            .get(flavor)
            .ok_or_else(|| Error::SymbolNotFound(format!("codegen flavor `{flavor}`")))?;
        compile::compile_unit(&self.inner, source, Some(&flavor))
    }

    /// Register an alternate codegen flavor.
    pub fn register_flavor(&self, flavor: StubFlavor) {
        self.inner.alt_codegen.lock().register(flavor);
    }

    /// The front-end contract: compile `source` and expose a host module.
    pub fn compile_and_bind(&self, source: &str) -> Result<HostModule> {
        compile::bind(&self.inner, source)
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.inner.config
    }

    /// Foreign-owned handles created through this context and not yet
    /// released.
    pub fn live_handles(&self) -> usize {
        self.inner.handles.live_count()
    }

    /// Clone a shared handle through its foreign reference count.
    pub fn clone_handle(&self, handle: &crate::handles::HostHandle) -> Result<crate::handles::HostHandle> {
        handle.clone_handle(&self.inner.handles)
    }

    /// Compiled specializations currently memoized.
    pub fn mono_instance_count(&self) -> usize {
        self.inner.state.lock().mono.instance_count()
    }

    /// Infer the foreign descriptor a host value binds a type parameter to.
    /// Exposed for diagnostics and tests.
    pub fn argument_descriptor(&self, value: &HostValue) -> Option<TypeDescriptor> {
        value.foreign_descriptor()
    }
}
