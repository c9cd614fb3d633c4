//! The compile-and-bind pipeline.
//!
//! source → extraction → {type bridge, dependency resolver} → stub
//! generation → orchestrator through the cache → loaded artifact → host
//! module. Extraction warnings ride along instead of failing the pipeline;
//! unbridgeable types fail before any compile attempt; unchanged inputs
//! short-circuit at the cache and never re-invoke the toolchain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use ferrule_cache::{BuiltArtifact, CacheEntry, CacheKey};
use ferrule_common::{Diagnostic, Span};
use ferrule_ffi::stubgen::{generate, BindingUnit, StubOptions};
use ferrule_ffi::types::{
    FunctionSignature, Param, ReceiverKind, SignatureCaps, StructDescriptor, TypeDescriptor,
};
use ferrule_ffi::{check_signature, check_struct, extract};

use crate::context::{ContextInner, StubFlavor};
use crate::deps::{self, DependencySpec};
use crate::error::{Error, Result};
use crate::module::{BindingKind, BoundFunction, HostModule};

/// Everything a compiled (but not yet loaded) unit carries.
#[derive(Debug)]
pub struct CompiledUnit {
    pub entry: CacheEntry,
    pub functions: Vec<FunctionSignature>,
    pub structs: Vec<StructDescriptor>,
    pub generic_sources: Vec<(String, String)>,
    pub deps: Vec<DependencySpec>,
    pub diagnostics: Vec<Diagnostic>,
    pub symbols: Vec<String>,
}

pub(crate) fn compile_unit(
    inner: &ContextInner,
    source: &str,
    flavor: Option<&StubFlavor>,
) -> Result<CompiledUnit> {
    let extraction = extract(source)?;
    for diagnostic in &extraction.diagnostics {
        warn!("{}", diagnostic.render());
    }

    let parsed = deps::parse(source);
    for diagnostic in &parsed.diagnostics {
        warn!("{}", diagnostic.render());
    }
    let merged = deps::merge(parsed.specs, Vec::new());
    if inner.config.strict_deps {
        if let Some(conflict) = merged.conflicts.first() {
            return Err(Error::DependencyConflict {
                name: conflict.name.clone(),
                left: conflict.left.clone(),
                right: conflict.right.clone(),
            });
        }
    }

    // Reject unbridgeable declarations before anything is materialized.
    let known: HashSet<String> = extraction.structs.iter().map(|s| s.name.clone()).collect();
    for sig in &extraction.functions {
        check_signature(sig, &known)?;
    }
    for strukt in &extraction.structs {
        check_struct(strukt, &known)?;
    }

    let dep_entries: Vec<(String, String)> = merged
        .specs
        .iter()
        .map(|spec| (spec.name.clone(), spec.manifest_entry()))
        .collect();
    let dep_lines: Vec<String> = dep_entries
        .iter()
        .map(|(name, entry)| format!("{name} = {entry}"))
        .collect();

    let mut fingerprint = inner.config.fingerprint();
    if let Some(flavor) = flavor {
        fingerprint.push_str(";codegen=");
        fingerprint.push_str(&flavor.name);
    }
    let key = CacheKey::compute(source, &fingerprint, &dep_lines);
    let package = format!("ferrule_unit_{}", key.short());

    let concrete: Vec<FunctionSignature> = extraction
        .functions
        .iter()
        .filter(|f| !f.is_generic())
        .cloned()
        .collect();
    let unit = BindingUnit {
        source,
        functions: &concrete,
        structs: &extraction.structs,
    };
    let mut opts = StubOptions::new(package.clone());
    opts.edition = inner.config.edition.clone();
    opts.dependencies = dep_entries;
    if let Some(flavor) = flavor {
        opts.dispatcher = flavor.dispatcher;
    }
    let stub = generate(&unit, &opts)?;

    let entry = inner
        .cache
        .get_or_build(&key, || -> Result<BuiltArtifact> {
            debug!(package = %package, "materializing and building bridge unit");
            let handle = inner
                .orchestrator
                .materialize(&package, &stub.manifest, &stub.source)?;
            let path = inner.toolchain.build(&handle).map_err(Error::Build)?;
            Ok(BuiltArtifact {
                path,
                symbols: stub.symbols.clone(),
            })
        })
        .map_err(Error::from)?;

    let mut diagnostics = extraction.diagnostics;
    diagnostics.extend(parsed.diagnostics);

    Ok(CompiledUnit {
        entry,
        functions: extraction.functions,
        structs: extraction.structs,
        generic_sources: extraction.generic_sources,
        deps: merged.specs,
        diagnostics,
        symbols: stub.symbols,
    })
}

/// Compile, load, register generics, and expose the host module.
pub(crate) fn bind(inner: &Arc<ContextInner>, source: &str) -> Result<HostModule> {
    let unit = compile_unit(inner, source, None)?;
    let artifact = inner.load_artifact(&unit.entry)?;

    {
        let mut state = inner.state.lock();
        for (name, generic_source) in &unit.generic_sources {
            if let Some(sig) = unit
                .functions
                .iter()
                .find(|f| f.owner.is_none() && &f.name == name)
            {
                state.mono.register(sig.clone(), generic_source.clone());
            }
        }
    }

    let mut bindings = HashMap::new();
    for sig in unit.functions.iter().filter(|f| !f.is_generic()) {
        let kind = if sig.is_constructor() {
            BindingKind::Constructor
        } else if sig.owner.is_some() {
            BindingKind::Method
        } else {
            BindingKind::Function
        };
        bindings.insert(
            sig.export_name(),
            BoundFunction {
                signature: sig.clone(),
                kind,
            },
        );
    }
    for strukt in &unit.structs {
        for (getter, setter) in accessor_signatures(strukt) {
            bindings.insert(
                getter.export_name(),
                BoundFunction {
                    signature: getter,
                    kind: BindingKind::Accessor,
                },
            );
            bindings.insert(
                setter.export_name(),
                BoundFunction {
                    signature: setter,
                    kind: BindingKind::Accessor,
                },
            );
        }
    }

    Ok(HostModule {
        ctx: Arc::clone(inner),
        artifact,
        bindings,
        structs: unit.structs,
        source: source.to_string(),
        diagnostics: unit.diagnostics,
    })
}

/// Synthesized accessor signatures, wired to the `{Struct}_get_{field}` /
/// `{Struct}_set_{field}` dispatcher arms.
fn accessor_signatures(
    strukt: &StructDescriptor,
) -> Vec<(FunctionSignature, FunctionSignature)> {
    strukt
        .fields
        .iter()
        .map(|field| {
            let getter = FunctionSignature {
                name: format!("get_{}", field.name),
                owner: Some(strukt.name.clone()),
                receiver: ReceiverKind::ByRef,
                params: Vec::new(),
                ret: field.ty.clone(),
                generics: Vec::new(),
                caps: SignatureCaps::empty(),
                span: Span::dummy(),
            };
            let setter = FunctionSignature {
                name: format!("set_{}", field.name),
                owner: Some(strukt.name.clone()),
                receiver: ReceiverKind::ByMutRef,
                params: vec![Param {
                    name: "value".to_string(),
                    ty: field.ty.clone(),
                    ffi_safe: field.ffi_safe,
                    borrowed: false,
                }],
                ret: TypeDescriptor::UNIT,
                generics: Vec::new(),
                caps: SignatureCaps::empty(),
                span: Span::dummy(),
            };
            (getter, setter)
        })
        .collect()
}
