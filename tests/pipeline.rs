//! Pipeline tests against a mock toolchain: no real compiler runs here.

use anyhow::Result;
use tempfile::TempDir;

use ferrule::{
    CompilerConfig, CompilerContext, Error, MockToolchain, TypeDescriptor,
};

fn context(tmp: &TempDir) -> (CompilerContext, MockToolchain) {
    let mut config = CompilerConfig::default();
    config.cache_root = Some(tmp.path().join("cache"));
    config.project_root = Some(tmp.path().join("projects"));
    let toolchain = MockToolchain::new();
    let ctx = CompilerContext::with_toolchain(config, Box::new(toolchain.clone()))
        .expect("context construction");
    (ctx, toolchain)
}

const ADD_SOURCE: &str = r#"
#[bind]
fn add(a: i32, b: i32) -> i32 { a + b }
"#;

#[test]
fn test_compile_simple_unit() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);

    let unit = ctx.compile(ADD_SOURCE)?;
    assert_eq!(toolchain.build_count(), 1);
    assert!(unit.symbols.iter().any(|s| s == "add"));
    assert_eq!(unit.functions.len(), 1);
    assert!(unit.diagnostics.is_empty());
    assert!(unit.entry.artifact_path.exists());
    Ok(())
}

#[test]
fn test_cache_idempotence_zero_rebuilds() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);

    let first = ctx.compile(ADD_SOURCE)?;
    let second = ctx.compile(ADD_SOURCE)?;
    assert_eq!(toolchain.build_count(), 1, "second compile must hit the cache");
    assert_eq!(first.entry.artifact_path, second.entry.artifact_path);
    assert_eq!(first.entry.checksum, second.entry.checksum);

    // Whitespace churn does not defeat the content-addressed key.
    let reformatted = "\n#[bind]\nfn add(a: i32, b: i32) -> i32 { a + b }   \n";
    ctx.compile(reformatted)?;
    assert_eq!(toolchain.build_count(), 1);
    Ok(())
}

#[test]
fn test_cache_shared_across_contexts() -> Result<()> {
    let tmp = TempDir::new()?;
    let (first_ctx, first_toolchain) = context(&tmp);
    first_ctx.compile(ADD_SOURCE)?;
    assert_eq!(first_toolchain.build_count(), 1);

    // A second context over the same cache root never rebuilds.
    let (second_ctx, second_toolchain) = context(&tmp);
    second_ctx.compile(ADD_SOURCE)?;
    assert_eq!(second_toolchain.build_count(), 0);
    Ok(())
}

#[test]
fn test_config_change_invalidates_cache() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);
    ctx.compile(ADD_SOURCE)?;

    let mut config = CompilerConfig::default();
    config.cache_root = Some(tmp.path().join("cache"));
    config.project_root = Some(tmp.path().join("projects"));
    config.release = false;
    let debug_ctx = CompilerContext::with_toolchain(config, Box::new(toolchain.clone()))?;
    debug_ctx.compile(ADD_SOURCE)?;
    assert_eq!(toolchain.build_count(), 2);
    Ok(())
}

#[test]
fn test_unsupported_type_rejected_before_any_build() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);

    let err = ctx
        .compile("#[bind]\nfn take(p: Mystery) -> i32 { 0 }")
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedType(_)));
    assert!(err.to_string().contains("Mystery"));
    assert_eq!(toolchain.build_count(), 0, "rejection happens pre-compile");
    Ok(())
}

#[test]
fn test_struct_field_failure_is_field_level() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);

    let err = ctx
        .compile(
            r#"
            #[bind]
            pub struct Holder {
                pub inner: Mystery,
            }
            "#,
        )
        .unwrap_err();
    assert!(err.to_string().contains("Holder.inner"));
    assert_eq!(toolchain.build_count(), 0);
    Ok(())
}

#[test]
fn test_diagnostics_do_not_block_other_declarations() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, _) = context(&tmp);

    let unit = ctx.compile(
        r#"
        #[bind(bogus = 1)]
        fn broken(a: i32) -> i32 { a }

        #[bind]
        fn fine(a: i32) -> i32 { a }
        "#,
    )?;
    assert_eq!(unit.diagnostics.len(), 1);
    assert!(unit.symbols.iter().any(|s| s == "fine"));
    assert!(!unit.symbols.iter().any(|s| s == "broken"));
    Ok(())
}

#[test]
fn test_dependency_merge_and_strict_mode() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, _) = context(&tmp);

    let divergent = r#"
// deps: rand = "0.8"
// deps: rand = "0.7"
#[bind]
fn noop() -> i32 { 0 }
"#;

    // Outside strict mode the divergence resolves with a warning.
    let unit = ctx.compile(divergent)?;
    assert_eq!(unit.deps.len(), 1);

    let mut config = CompilerConfig::default();
    config.cache_root = Some(tmp.path().join("cache2"));
    config.project_root = Some(tmp.path().join("projects2"));
    config.strict_deps = true;
    let strict_ctx = CompilerContext::with_toolchain(config, Box::new(MockToolchain::new()))?;
    let err = strict_ctx.compile(divergent).unwrap_err();
    assert!(matches!(err, Error::DependencyConflict { .. }));
    Ok(())
}

#[test]
fn test_build_failure_carries_locations_and_hints() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = CompilerConfig::default();
    config.cache_root = Some(tmp.path().join("cache"));
    config.project_root = Some(tmp.path().join("projects"));
    let stderr = "error[E0433]: use of undeclared crate or module `rand`\n --> src/lib.rs:3:13\n";
    let ctx = CompilerContext::with_toolchain(config, Box::new(MockToolchain::failing(stderr)))?;

    let err = ctx.compile(ADD_SOURCE).unwrap_err();
    let Error::Build(failure) = err else {
        panic!("expected a build failure, got {err}");
    };
    assert_eq!(failure.locations.len(), 1);
    assert_eq!(failure.locations[0].file, "src/lib.rs");
    assert_eq!(failure.locations[0].line, 3);
    assert!(failure.suggestions.iter().any(|s| s.contains("// deps:")));
    Ok(())
}

#[test]
fn test_portable_flavor_is_a_distinct_cached_unit() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);

    let primary = ctx.compile(ADD_SOURCE)?;
    let portable = ctx.compile_with_flavor(ADD_SOURCE, "portable")?;
    assert_eq!(toolchain.build_count(), 2);
    assert_ne!(primary.entry.key.as_str(), portable.entry.key.as_str());
    assert!(primary.symbols.iter().any(|s| s == "ferrule_call_json"));
    assert!(!portable.symbols.iter().any(|s| s == "ferrule_call_json"));

    // Re-compiling either flavor stays cached.
    ctx.compile_with_flavor(ADD_SOURCE, "portable")?;
    assert_eq!(toolchain.build_count(), 2);
    Ok(())
}

#[test]
fn test_specialization_units_share_cache_by_type_tuple() -> Result<()> {
    use ferrule::mono::{infer_bindings, specialize_source, GenericEntry};
    use ferrule_ffi::extract::extract;

    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);

    let source = "#[bind]\nfn identity<T>(x: T) -> T { x }";
    let extraction = extract(source)?;
    let entry = GenericEntry {
        signature: extraction.function("identity").unwrap().clone(),
        source: extraction.generic_sources[0].1.clone(),
    };

    let int_bindings = infer_bindings(&entry, &[TypeDescriptor::Primitive(ferrule::Primitive::I32)])?;
    let unit_a = format!("{source}\n{}", specialize_source(&entry, &int_bindings)?);
    let unit_b = format!("{source}\n{}", specialize_source(&entry, &int_bindings)?);
    assert_eq!(unit_a, unit_b, "specialization is deterministic");

    ctx.compile(&unit_a)?;
    ctx.compile(&unit_b)?;
    assert_eq!(
        toolchain.build_count(),
        1,
        "the same concrete tuple compiles exactly once"
    );

    let float_bindings =
        infer_bindings(&entry, &[TypeDescriptor::Primitive(ferrule::Primitive::F64)])?;
    let unit_c = format!("{source}\n{}", specialize_source(&entry, &float_bindings)?);
    let compiled = ctx.compile(&unit_c)?;
    assert_eq!(toolchain.build_count(), 2);
    assert!(compiled.symbols.iter().any(|s| s == "identity_f64"));
    Ok(())
}

#[test]
fn test_materialized_project_has_fixed_layout_and_no_markers() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, _) = context(&tmp);
    ctx.compile(ADD_SOURCE)?;

    let projects = std::fs::read_dir(tmp.path().join("projects"))?
        .flatten()
        .collect::<Vec<_>>();
    assert_eq!(projects.len(), 1);
    let root = projects[0].path();
    assert!(root.join("Cargo.toml").exists());
    let lib = std::fs::read_to_string(root.join("src").join("lib.rs"))?;
    assert!(!lib.contains("#[bind]"));
    assert!(lib.contains("extern \"C\" fn add"));

    let manifest = std::fs::read_to_string(root.join("Cargo.toml"))?;
    assert!(manifest.contains("crate-type = [\"cdylib\"]"));
    Ok(())
}

#[test]
fn test_cache_cleanup_and_clear() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ctx, toolchain) = context(&tmp);
    ctx.compile(ADD_SOURCE)?;

    // Nothing is stale yet.
    let removed = ctx.cache().cleanup(std::time::Duration::from_secs(3600))?;
    assert_eq!(removed, 0);
    ctx.compile(ADD_SOURCE)?;
    assert_eq!(toolchain.build_count(), 1);

    ctx.cache().clear()?;
    ctx.compile(ADD_SOURCE)?;
    assert_eq!(toolchain.build_count(), 2, "clear forces a rebuild");
    Ok(())
}
