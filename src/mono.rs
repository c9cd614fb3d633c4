//! Generic specialization (monomorphization).
//!
//! Marked generic functions are registered here at bind time and specialized
//! lazily, once per concrete type tuple. Substitution is structural over the
//! parsed declaration, never raw string replacement, so an identifier that
//! merely contains a parameter name is never touched. Constraint sets are
//! retained for diagnostics only; a violated constraint surfaces as a
//! foreign compile error naming the substitution.

use std::collections::HashMap;

use quote::format_ident;
use syn::visit_mut::{self, VisitMut};
use syn::Item;

use ferrule_ffi::types::{FunctionSignature, SignatureCaps, TypeDescriptor};
use ferrule_ffi::MARKER;

use crate::error::{Error, Result};

/// A registered generic declaration: its signature plus the marker-free
/// source text it is re-specialized from.
#[derive(Debug, Clone)]
pub struct GenericEntry {
    pub signature: FunctionSignature,
    pub source: String,
}

/// One compiled specialization, memoized for the process lifetime.
#[derive(Debug, Clone)]
pub struct MonoInstance {
    pub symbol: String,
    pub signature: FunctionSignature,
    /// Cache key of the specialized compilation unit.
    pub cache_key: String,
}

/// Key: generic function name plus the ordered concrete type tags.
pub type InstanceKey = (String, Vec<String>);

#[derive(Debug, Default)]
pub struct MonoRegistry {
    generics: HashMap<String, GenericEntry>,
    instances: HashMap<InstanceKey, MonoInstance>,
}

impl MonoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signature: FunctionSignature, source: String) {
        self.generics
            .insert(signature.name.clone(), GenericEntry { signature, source });
    }

    pub fn is_generic(&self, name: &str) -> bool {
        self.generics.contains_key(name)
    }

    pub fn entry(&self, name: &str) -> Option<&GenericEntry> {
        self.generics.get(name)
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<&MonoInstance> {
        self.instances.get(key)
    }

    pub fn insert_instance(&mut self, key: InstanceKey, instance: MonoInstance) {
        self.instances.insert(key, instance);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

/// Bind each declared type parameter, positionally in declaration order: the
/// first argument annotated with the bare parameter wins. A parameter that
/// appears only in the return type (or nowhere) cannot be inferred and is an
/// error rather than a guess.
pub fn infer_bindings(
    entry: &GenericEntry,
    arg_types: &[TypeDescriptor],
) -> Result<Vec<(String, TypeDescriptor)>> {
    let sig = &entry.signature;
    let mut bindings = Vec::with_capacity(sig.generics.len());
    for decl in &sig.generics {
        let position = sig.params.iter().position(
            |p| matches!(&p.ty, TypeDescriptor::GenericParam(name) if name == &decl.name),
        );
        let Some(position) = position else {
            return Err(Error::Monomorphization {
                name: sig.name.clone(),
                reason: format!(
                    "type parameter `{}` appears only in the return type and cannot be \
                     inferred from arguments",
                    decl.name
                ),
            });
        };
        let Some(concrete) = arg_types.get(position) else {
            return Err(Error::Monomorphization {
                name: sig.name.clone(),
                reason: format!(
                    "call provides no argument at position {position} for type parameter `{}`",
                    decl.name
                ),
            });
        };
        if concrete.mono_tag().is_none() {
            return Err(Error::Monomorphization {
                name: sig.name.clone(),
                reason: format!(
                    "type parameter `{}` cannot be bound to `{}`",
                    decl.name,
                    concrete.rust_name()
                ),
            });
        }
        bindings.push((decl.name.clone(), concrete.clone()));
    }
    Ok(bindings)
}

/// Ordered tags for the instance key and the specialized symbol name.
pub fn type_tags(bindings: &[(String, TypeDescriptor)]) -> Vec<String> {
    bindings
        .iter()
        .map(|(_, ty)| ty.mono_tag().unwrap_or_else(|| "opaque".to_string()))
        .collect()
}

/// Deterministic specialization name: `identity` bound to `i32` becomes
/// `identity_i32`.
pub fn specialized_name(name: &str, tags: &[String]) -> String {
    format!("{}_{}", name, tags.join("_"))
}

/// Produce the specialized declaration: the parsed function with every
/// occurrence of each type parameter substituted, the generic parameter list
/// stripped, and the function renamed. The result carries a binding marker so
/// it flows through the regular extraction/generation pipeline as its own
/// compilation unit.
pub fn specialize_source(
    entry: &GenericEntry,
    bindings: &[(String, TypeDescriptor)],
) -> Result<String> {
    let file: syn::File = syn::parse_str(&entry.source).map_err(|err| Error::Monomorphization {
        name: entry.signature.name.clone(),
        reason: format!("registered source does not parse: {err}"),
    })?;
    let mut func = file
        .items
        .into_iter()
        .find_map(|item| match item {
            Item::Fn(func) if func.sig.ident == entry.signature.name => Some(func),
            _ => None,
        })
        .ok_or_else(|| Error::Monomorphization {
            name: entry.signature.name.clone(),
            reason: "registered source does not contain the declaration".to_string(),
        })?;

    let mut substitutions = HashMap::new();
    for (param, concrete) in bindings {
        let ty: syn::Type =
            syn::parse_str(&concrete.rust_name()).map_err(|err| Error::Monomorphization {
                name: entry.signature.name.clone(),
                reason: format!("`{}` is not a substitutable type: {err}", concrete.rust_name()),
            })?;
        substitutions.insert(param.clone(), ty);
    }

    let tags = type_tags(bindings);
    func.sig.ident = format_ident!("{}", specialized_name(&entry.signature.name, &tags));
    func.sig.generics = syn::Generics::default();
    let marker = format_ident!("{}", MARKER);
    func.attrs.push(syn::parse_quote!(#[#marker]));

    let mut substituter = Substituter {
        substitutions: &substitutions,
    };
    substituter.visit_item_fn_mut(&mut func);

    let rendered = syn::File {
        shebang: None,
        attrs: Vec::new(),
        items: vec![Item::Fn(func)],
    };
    Ok(prettyplease::unparse(&rendered))
}

/// The specialized signature the host module binds: same shape with concrete
/// descriptors, no generic list, new name.
pub fn specialize_signature(
    entry: &GenericEntry,
    bindings: &[(String, TypeDescriptor)],
) -> FunctionSignature {
    let map: HashMap<&str, &TypeDescriptor> = bindings
        .iter()
        .map(|(name, ty)| (name.as_str(), ty))
        .collect();
    let tags = type_tags(bindings);
    let mut sig = entry.signature.clone();
    sig.name = specialized_name(&entry.signature.name, &tags);
    sig.generics = Vec::new();
    sig.caps.remove(SignatureCaps::GENERIC);
    for param in &mut sig.params {
        param.ty = substitute_descriptor(&param.ty, &map);
    }
    sig.ret = substitute_descriptor(&sig.ret, &map);
    sig
}

fn substitute_descriptor(
    ty: &TypeDescriptor,
    map: &HashMap<&str, &TypeDescriptor>,
) -> TypeDescriptor {
    match ty {
        TypeDescriptor::GenericParam(name) => map
            .get(name.as_str())
            .map(|t| (*t).clone())
            .unwrap_or_else(|| ty.clone()),
        TypeDescriptor::Pointer { mutable, inner } => TypeDescriptor::Pointer {
            mutable: *mutable,
            inner: Box::new(substitute_descriptor(inner, map)),
        },
        TypeDescriptor::Slice(inner) => {
            TypeDescriptor::Slice(Box::new(substitute_descriptor(inner, map)))
        }
        TypeDescriptor::Option(inner) => {
            TypeDescriptor::Option(Box::new(substitute_descriptor(inner, map)))
        }
        TypeDescriptor::OwnedHandle { kind, inner } => TypeDescriptor::OwnedHandle {
            kind: *kind,
            inner: Box::new(substitute_descriptor(inner, map)),
        },
        TypeDescriptor::Result { ok, err } => TypeDescriptor::Result {
            ok: Box::new(substitute_descriptor(ok, map)),
            err: Box::new(substitute_descriptor(err, map)),
        },
        other => other.clone(),
    }
}

/// Structural substitution: replaces bare type-parameter paths in type
/// position and leading path segments in expression position (`T::default`).
struct Substituter<'a> {
    substitutions: &'a HashMap<String, syn::Type>,
}

impl Substituter<'_> {
    fn replacement_for(&self, path: &syn::Path) -> Option<&syn::Type> {
        if path.segments.len() != 1 {
            return None;
        }
        let segment = &path.segments[0];
        if !matches!(segment.arguments, syn::PathArguments::None) {
            return None;
        }
        self.substitutions.get(&segment.ident.to_string())
    }
}

impl VisitMut for Substituter<'_> {
    fn visit_type_mut(&mut self, ty: &mut syn::Type) {
        if let syn::Type::Path(type_path) = ty {
            if type_path.qself.is_none() {
                if let Some(replacement) = self.replacement_for(&type_path.path) {
                    *ty = replacement.clone();
                    return;
                }
            }
        }
        visit_mut::visit_type_mut(self, ty);
    }

    fn visit_path_mut(&mut self, path: &mut syn::Path) {
        // `T::default()` in the body: rewrite the leading segment when the
        // replacement is itself a plain path type.
        if path.segments.len() > 1 {
            let leading = path.segments[0].ident.to_string();
            if let Some(syn::Type::Path(replacement)) = self.substitutions.get(&leading) {
                if let Some(last) = replacement.path.segments.last() {
                    path.segments[0] = last.clone();
                }
            }
        }
        visit_mut::visit_path_mut(self, path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrule_ffi::extract::extract;
    use ferrule_ffi::types::Primitive;

    fn entry(source: &str, name: &str) -> GenericEntry {
        let extraction = extract(source).unwrap();
        let signature = extraction.function(name).unwrap().clone();
        let (_, generic_source) = extraction
            .generic_sources
            .iter()
            .find(|(n, _)| n == name)
            .unwrap()
            .clone();
        GenericEntry {
            signature,
            source: generic_source,
        }
    }

    #[test]
    fn test_infer_positional_bindings() {
        let entry = entry("#[bind]\nfn identity<T>(x: T) -> T { x }", "identity");
        let bindings =
            infer_bindings(&entry, &[TypeDescriptor::Primitive(Primitive::I32)]).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].0, "T");
        assert_eq!(bindings[0].1, TypeDescriptor::Primitive(Primitive::I32));
    }

    #[test]
    fn test_first_binding_wins_for_repeated_parameter() {
        let entry = entry("#[bind]\nfn pick<T>(a: T, b: T) -> T { a }", "pick");
        let bindings = infer_bindings(
            &entry,
            &[
                TypeDescriptor::Primitive(Primitive::I64),
                TypeDescriptor::Primitive(Primitive::F64),
            ],
        )
        .unwrap();
        assert_eq!(bindings[0].1, TypeDescriptor::Primitive(Primitive::I64));
    }

    #[test]
    fn test_return_only_parameter_is_an_error() {
        let entry = entry(
            "#[bind]\nfn conjure<T>(seed: i64) -> T { todo!() }",
            "conjure",
        );
        let err = infer_bindings(&entry, &[TypeDescriptor::Primitive(Primitive::I64)]).unwrap_err();
        assert!(matches!(err, Error::Monomorphization { .. }));
        assert!(err.to_string().contains("return type"));
    }

    #[test]
    fn test_specialized_source_substitutes_structurally() {
        let entry = entry("#[bind]\nfn identity<T>(x: T) -> T { x }", "identity");
        let bindings = vec![("T".to_string(), TypeDescriptor::Primitive(Primitive::I32))];
        let source = specialize_source(&entry, &bindings).unwrap();
        assert!(source.contains("fn identity_i32(x: i32) -> i32"));
        assert!(source.contains("#[bind]"));
        assert!(!source.contains("<T>"));
    }

    #[test]
    fn test_substitution_ignores_identifiers_containing_parameter_name() {
        // A textual substitution of `T` would mangle `Total` and `t`.
        let entry = entry(
            "#[bind]\nfn tally<T>(x: T) -> T {\n    let t = x;\n    struct Total;\n    let _marker = Total;\n    t\n}",
            "tally",
        );
        let bindings = vec![("T".to_string(), TypeDescriptor::Primitive(Primitive::F64))];
        let source = specialize_source(&entry, &bindings).unwrap();
        assert!(source.contains("fn tally_f64(x: f64) -> f64"));
        assert!(source.contains("struct Total;"));
        assert!(source.contains("let t = x;"));
    }

    #[test]
    fn test_body_path_substitution() {
        let entry = entry(
            "#[bind]\nfn fresh<T>(_witness: T) -> T { T::default() }",
            "fresh",
        );
        let bindings = vec![("T".to_string(), TypeDescriptor::Primitive(Primitive::I64))];
        let source = specialize_source(&entry, &bindings).unwrap();
        assert!(source.contains("i64::default()"));
    }

    #[test]
    fn test_specialized_signature_and_naming_determinism() {
        let entry = entry("#[bind]\nfn identity<T>(x: T) -> T { x }", "identity");
        let bindings = vec![("T".to_string(), TypeDescriptor::Primitive(Primitive::F64))];
        let a = specialize_signature(&entry, &bindings);
        let b = specialize_signature(&entry, &bindings);
        assert_eq!(a.name, "identity_f64");
        assert_eq!(a.name, b.name);
        assert!(!a.is_generic());
        assert_eq!(a.params[0].ty, TypeDescriptor::Primitive(Primitive::F64));
        assert_eq!(a.ret, TypeDescriptor::Primitive(Primitive::F64));
    }

    #[test]
    fn test_registry_instance_reuse() {
        let mut registry = MonoRegistry::new();
        let e = entry("#[bind]\nfn identity<T>(x: T) -> T { x }", "identity");
        registry.register(e.signature.clone(), e.source.clone());
        assert!(registry.is_generic("identity"));
        assert!(!registry.is_generic("add"));

        let key = ("identity".to_string(), vec!["i32".to_string()]);
        assert!(registry.instance(&key).is_none());
        registry.insert_instance(
            key.clone(),
            MonoInstance {
                symbol: "identity_i32".into(),
                signature: specialize_signature(
                    &e,
                    &[("T".to_string(), TypeDescriptor::Primitive(Primitive::I32))],
                ),
                cache_key: "abc".into(),
            },
        );
        assert!(registry.instance(&key).is_some());
        assert_eq!(registry.instance_count(), 1);
    }
}
