//! Signature extraction from binding-marked Rust source.
//!
//! Scans a parsed source file for `#[bind]` markers on three declaration
//! shapes: free functions, structs with named fields, and impl blocks whose
//! marked methods are grouped under their receiver struct. A malformed marker
//! or unsupported shape produces one per-declaration [`Diagnostic`] and the
//! rest of the file keeps extracting. No semantic checking happens here; the
//! type bridge validates descriptors at generation time.

use proc_macro2::Span as MacroSpan;
use quote::ToTokens;
use tracing::debug;
use syn::spanned::Spanned;
use syn::{
    Attribute, FnArg, GenericArgument, GenericParam, Generics, Item, ItemFn, ItemImpl, ItemStruct,
    PathArguments, ReturnType, Type,
};
use thiserror::Error;

use ferrule_common::{Diagnostic, LineCol, Span};

use crate::types::{
    Field, FunctionSignature, GenericParamDecl, OwnershipKind, Param, Primitive, ReceiverKind,
    SignatureCaps, StructDescriptor, TypeDescriptor,
};

/// The attribute name that marks a declaration as exposed to the host.
pub const MARKER: &str = "bind";

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The source does not parse as Rust at all; nothing can be extracted.
    #[error("marked source does not parse: {0}")]
    Unparseable(#[from] syn::Error),
}

/// Result of scanning one source text.
#[derive(Debug, Default)]
pub struct Extraction {
    pub functions: Vec<FunctionSignature>,
    pub structs: Vec<StructDescriptor>,
    /// Original source of each generic marked function, re-rendered without
    /// the marker, keyed by function name. Feeds the monomorphizer registry.
    pub generic_sources: Vec<(String, String)>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Extraction {
    pub fn function(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.iter().find(|f| f.name == name && f.owner.is_none())
    }

    pub fn strukt(&self, name: &str) -> Option<&StructDescriptor> {
        self.structs.iter().find(|s| s.name == name)
    }
}

/// Extract all marked declarations from `source`.
pub fn extract(source: &str) -> Result<Extraction, ExtractError> {
    let file = syn::parse_file(source)?;
    let mut out = Extraction::default();

    for item in &file.items {
        match item {
            Item::Fn(func) => visit_fn(func, &mut out),
            Item::Struct(strukt) => visit_struct(strukt, &mut out),
            Item::Impl(imp) => visit_impl(imp, &mut out),
            _ => {}
        }
    }

    debug!(
        functions = out.functions.len(),
        structs = out.structs.len(),
        warnings = out.diagnostics.len(),
        "extraction complete"
    );
    Ok(out)
}

fn visit_fn(func: &ItemFn, out: &mut Extraction) {
    let Some(marker) = find_marker(&func.attrs) else {
        return;
    };
    let name = func.sig.ident.to_string();
    if let Err(message) = check_marker_args(marker) {
        out.diagnostics
            .push(malformed(&name, message, marker.span()));
        return;
    }

    match signature_from_fn(&func.sig, None) {
        Ok(sig) => {
            if sig.is_generic() {
                out.generic_sources.push((name, render_unmarked_fn(func)));
            }
            out.functions.push(sig);
        }
        Err(message) => out
            .diagnostics
            .push(malformed(&name, message, func.sig.span())),
    }
}

fn visit_struct(strukt: &ItemStruct, out: &mut Extraction) {
    let Some(marker) = find_marker(&strukt.attrs) else {
        return;
    };
    let name = strukt.ident.to_string();
    if let Err(message) = check_marker_args(marker) {
        out.diagnostics
            .push(malformed(&name, message, marker.span()));
        return;
    }
    if !strukt.generics.params.is_empty() {
        out.diagnostics.push(malformed(
            &name,
            "generic structs cannot be bound".to_string(),
            strukt.generics.span(),
        ));
        return;
    }

    let syn::Fields::Named(named) = &strukt.fields else {
        out.diagnostics.push(malformed(
            &name,
            "only structs with named fields can be bound".to_string(),
            strukt.fields.span(),
        ));
        return;
    };

    let mut fields = Vec::with_capacity(named.named.len());
    for field in &named.named {
        let field_name = field
            .ident
            .as_ref()
            .expect("named field has an identifier")
            .to_string();
        match descriptor_from_type(&field.ty, &[]) {
            Ok(ty) => {
                let ffi_safe = has_ffi_repr(&ty);
                fields.push(Field {
                    name: field_name,
                    ty,
                    ffi_safe,
                });
            }
            Err(message) => {
                out.diagnostics.push(malformed(
                    &format!("{name}.{field_name}"),
                    message,
                    field.ty.span(),
                ));
                return;
            }
        }
    }

    out.structs.push(StructDescriptor {
        name,
        fields,
        capabilities: derive_capabilities(&strukt.attrs),
        span: span_of(strukt.span()),
    });
}

fn visit_impl(imp: &ItemImpl, out: &mut Extraction) {
    if find_marker(&imp.attrs).is_none() {
        return;
    }
    if let Some((_, trait_path, _)) = &imp.trait_ {
        out.diagnostics.push(malformed(
            &trait_path.to_token_stream().to_string(),
            "trait impls cannot be bound".to_string(),
            imp.span(),
        ));
        return;
    }

    let owner = match self_ty_name(&imp.self_ty) {
        Some(owner) => owner,
        None => {
            out.diagnostics.push(malformed(
                "impl",
                "bound impl blocks require a simple type path".to_string(),
                imp.self_ty.span(),
            ));
            return;
        }
    };

    for item in &imp.items {
        let syn::ImplItem::Fn(method) = item else {
            continue;
        };
        let Some(marker) = find_marker(&method.attrs) else {
            continue;
        };
        let name = format!("{}.{}", owner, method.sig.ident);
        if let Err(message) = check_marker_args(marker) {
            out.diagnostics
                .push(malformed(&name, message, marker.span()));
            continue;
        }
        match signature_from_fn(&method.sig, Some(owner.clone())) {
            Ok(sig) => out.functions.push(sig),
            Err(message) => out
                .diagnostics
                .push(malformed(&name, message, method.sig.span())),
        }
    }
}

fn signature_from_fn(sig: &syn::Signature, owner: Option<String>) -> Result<FunctionSignature, String> {
    if sig.unsafety.is_some() {
        return Err("unsafe functions cannot be bound directly".to_string());
    }
    if sig.asyncness.is_some() {
        return Err("async functions cannot be bound".to_string());
    }

    let generics = generic_params(&sig.generics)?;
    let generic_names: Vec<String> = generics.iter().map(|g| g.name.clone()).collect();

    let mut receiver = if owner.is_some() {
        ReceiverKind::Static
    } else {
        ReceiverKind::None
    };
    let mut params = Vec::new();

    for input in &sig.inputs {
        match input {
            FnArg::Receiver(recv) => {
                receiver = if recv.reference.is_none() {
                    ReceiverKind::ByValue
                } else if recv.mutability.is_some() {
                    ReceiverKind::ByMutRef
                } else {
                    ReceiverKind::ByRef
                };
            }
            FnArg::Typed(pat_type) => {
                let name = match pat_type.pat.as_ref() {
                    syn::Pat::Ident(ident) => ident.ident.to_string(),
                    _ => format!("arg{}", params.len()),
                };
                let borrowed = matches!(pat_type.ty.as_ref(), Type::Reference(_));
                let ty = descriptor_from_type(&pat_type.ty, &generic_names)?;
                let ffi_safe = has_ffi_repr(&ty);
                params.push(Param {
                    name,
                    ty,
                    ffi_safe,
                    borrowed,
                });
            }
        }
    }

    let mut ret = match &sig.output {
        ReturnType::Default => TypeDescriptor::UNIT,
        ReturnType::Type(_, ty) => descriptor_from_type(ty, &generic_names)?,
    };

    let mut caps = SignatureCaps::empty();
    if let Some(owner) = &owner {
        // Constructors are static methods returning `Self` (or the struct by
        // value); the host receives a uniquely owned handle.
        let returns_self = matches!(
            &ret,
            TypeDescriptor::OpaqueStruct(name) if name == "Self" || name == owner
        );
        if returns_self {
            ret = TypeDescriptor::OwnedHandle {
                kind: OwnershipKind::Unique,
                inner: Box::new(TypeDescriptor::OpaqueStruct(owner.clone())),
            };
            caps |= SignatureCaps::SELF_RETURN;
            if receiver == ReceiverKind::Static {
                caps |= SignatureCaps::CONSTRUCTOR;
            }
        }
    } else {
        let struct_ret = match &ret {
            TypeDescriptor::OpaqueStruct(name) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = struct_ret {
            if name == "Self" {
                return Err("`Self` return outside an impl block".to_string());
            }
            // Free functions returning a struct by value hand ownership
            // across; the host sees a uniquely owned handle.
            ret = TypeDescriptor::OwnedHandle {
                kind: OwnershipKind::Unique,
                inner: Box::new(TypeDescriptor::OpaqueStruct(name)),
            };
            caps |= SignatureCaps::SELF_RETURN;
        }
    }

    if matches!(ret, TypeDescriptor::Result { .. }) {
        caps |= SignatureCaps::FALLIBLE;
    }
    if matches!(ret, TypeDescriptor::Option(_)) {
        caps |= SignatureCaps::OPTIONAL;
    }
    if matches!(ret, TypeDescriptor::OwnedHandle { .. }) {
        caps |= SignatureCaps::RETURNS_HANDLE;
    }
    if params.iter().any(|p| matches!(p.ty, TypeDescriptor::OwnedString))
        || matches!(ret, TypeDescriptor::OwnedString)
    {
        caps |= SignatureCaps::USES_STRINGS;
    }
    if params.iter().any(|p| matches!(p.ty, TypeDescriptor::Slice(_))) {
        caps |= SignatureCaps::USES_SLICES;
    }
    if !generics.is_empty() {
        caps |= SignatureCaps::GENERIC;
    }

    Ok(FunctionSignature {
        name: sig.ident.to_string(),
        owner,
        receiver,
        params,
        ret,
        generics,
        caps,
        span: span_of(sig.span()),
    })
}

/// Build a [`TypeDescriptor`] from surface syntax. Purely structural; the
/// bridge decides later whether the result has an FFI-safe representation.
pub fn descriptor_from_type(ty: &Type, generic_names: &[String]) -> Result<TypeDescriptor, String> {
    match ty {
        Type::Path(path) => {
            let segment = path
                .path
                .segments
                .last()
                .ok_or_else(|| "empty type path".to_string())?;
            let ident = segment.ident.to_string();

            if let Some(prim) = Primitive::parse(&ident) {
                return Ok(TypeDescriptor::Primitive(prim));
            }
            if generic_names.iter().any(|g| g == &ident) {
                return Ok(TypeDescriptor::GenericParam(ident));
            }

            match ident.as_str() {
                "String" => Ok(TypeDescriptor::OwnedString),
                "Box" | "Rc" | "Arc" => {
                    let kind = match ident.as_str() {
                        "Box" => OwnershipKind::Unique,
                        "Rc" => OwnershipKind::SharedSingleThread,
                        _ => OwnershipKind::SharedAtomic,
                    };
                    let inner = single_type_argument(segment, generic_names)?;
                    Ok(TypeDescriptor::OwnedHandle {
                        kind,
                        inner: Box::new(inner),
                    })
                }
                "Option" => {
                    let inner = single_type_argument(segment, generic_names)?;
                    Ok(TypeDescriptor::Option(Box::new(inner)))
                }
                "Result" => {
                    let mut args = type_arguments(segment, generic_names)?;
                    if args.len() != 2 {
                        return Err("Result requires both ok and err type arguments".to_string());
                    }
                    let err = args.pop().expect("two arguments");
                    let ok = args.pop().expect("two arguments");
                    Ok(TypeDescriptor::Result {
                        ok: Box::new(ok),
                        err: Box::new(err),
                    })
                }
                _ => {
                    if !matches!(segment.arguments, PathArguments::None) {
                        return Err(format!("unsupported generic type `{ident}`"));
                    }
                    Ok(TypeDescriptor::OpaqueStruct(ident))
                }
            }
        }
        Type::Reference(reference) => {
            let inner = reference.elem.as_ref();
            match inner {
                // &str crosses as an owned string copy, never a bare pointer.
                Type::Path(p) if p.path.is_ident("str") => Ok(TypeDescriptor::OwnedString),
                Type::Slice(slice) => {
                    let elem = descriptor_from_type(&slice.elem, generic_names)?;
                    Ok(TypeDescriptor::Slice(Box::new(elem)))
                }
                other => {
                    let elem = descriptor_from_type(other, generic_names)?;
                    Ok(TypeDescriptor::Pointer {
                        mutable: reference.mutability.is_some(),
                        inner: Box::new(elem),
                    })
                }
            }
        }
        Type::Ptr(ptr) => {
            let elem = descriptor_from_type(&ptr.elem, generic_names)?;
            Ok(TypeDescriptor::Pointer {
                mutable: ptr.mutability.is_some(),
                inner: Box::new(elem),
            })
        }
        Type::Tuple(tuple) if tuple.elems.is_empty() => Ok(TypeDescriptor::UNIT),
        other => Err(format!(
            "unsupported type shape `{}`",
            other.to_token_stream()
        )),
    }
}

/// Structural FFI-safety: does the descriptor have a defined fixed-layout
/// crossing? Struct existence and generic substitution are checked later by
/// the bridge.
pub fn has_ffi_repr(ty: &TypeDescriptor) -> bool {
    match ty {
        TypeDescriptor::Primitive(_)
        | TypeDescriptor::OwnedString
        | TypeDescriptor::OpaqueStruct(_) => true,
        TypeDescriptor::Pointer { inner, .. }
        | TypeDescriptor::Slice(inner)
        | TypeDescriptor::Option(inner)
        | TypeDescriptor::OwnedHandle { inner, .. } => has_ffi_repr(inner),
        TypeDescriptor::Result { ok, err } => has_ffi_repr(ok) && has_ffi_repr(err),
        TypeDescriptor::GenericParam(_) => false,
    }
}

fn type_arguments(
    segment: &syn::PathSegment,
    generic_names: &[String],
) -> Result<Vec<TypeDescriptor>, String> {
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return Err(format!("`{}` requires type arguments", segment.ident));
    };
    args.args
        .iter()
        .filter_map(|arg| match arg {
            GenericArgument::Type(ty) => Some(descriptor_from_type(ty, generic_names)),
            GenericArgument::Lifetime(_) => None,
            other => Some(Err(format!(
                "unsupported generic argument `{}`",
                other.to_token_stream()
            ))),
        })
        .collect()
}

fn single_type_argument(
    segment: &syn::PathSegment,
    generic_names: &[String],
) -> Result<TypeDescriptor, String> {
    let mut args = type_arguments(segment, generic_names)?;
    if args.len() != 1 {
        return Err(format!(
            "`{}` requires exactly one type argument",
            segment.ident
        ));
    }
    Ok(args.pop().expect("one argument"))
}

fn generic_params(generics: &Generics) -> Result<Vec<GenericParamDecl>, String> {
    let mut out = Vec::new();
    for param in &generics.params {
        match param {
            GenericParam::Type(ty_param) => {
                let constraints = ty_param
                    .bounds
                    .iter()
                    .map(|b| b.to_token_stream().to_string())
                    .collect();
                out.push(GenericParamDecl {
                    name: ty_param.ident.to_string(),
                    constraints,
                });
            }
            GenericParam::Lifetime(_) => {}
            GenericParam::Const(c) => {
                return Err(format!("const generic `{}` cannot be bound", c.ident));
            }
        }
    }
    // where-clause bounds are folded into the constraint set; they are kept
    // for diagnostics only, never verified statically.
    if let Some(where_clause) = &generics.where_clause {
        for predicate in &where_clause.predicates {
            if let syn::WherePredicate::Type(pred) = predicate {
                let target = pred.bounded_ty.to_token_stream().to_string();
                if let Some(decl) = out.iter_mut().find(|d| d.name == target) {
                    decl.constraints
                        .extend(pred.bounds.iter().map(|b| b.to_token_stream().to_string()));
                }
            }
        }
    }
    Ok(out)
}

fn find_marker(attrs: &[Attribute]) -> Option<&Attribute> {
    attrs.iter().find(|attr| attr.path().is_ident(MARKER))
}

/// The marker takes no arguments today; anything else is malformed and the
/// declaration is skipped with a warning.
fn check_marker_args(attr: &Attribute) -> Result<(), String> {
    match &attr.meta {
        syn::Meta::Path(_) => Ok(()),
        other => Err(format!(
            "malformed binding marker `{}`",
            other.to_token_stream()
        )),
    }
}

fn derive_capabilities(attrs: &[Attribute]) -> Vec<String> {
    let mut caps = Vec::new();
    for attr in attrs {
        if !attr.path().is_ident("derive") {
            continue;
        }
        let _ = attr.parse_nested_meta(|meta| {
            if let Some(ident) = meta.path.get_ident() {
                caps.push(ident.to_string());
            }
            Ok(())
        });
    }
    caps
}

fn self_ty_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}

/// Re-render a marked function without its marker attribute, preserving the
/// declaration for later specialization.
fn render_unmarked_fn(func: &ItemFn) -> String {
    let mut cleaned = func.clone();
    cleaned.attrs.retain(|attr| !attr.path().is_ident(MARKER));
    let file = syn::File {
        shebang: None,
        attrs: Vec::new(),
        items: vec![Item::Fn(cleaned)],
    };
    prettyplease::unparse(&file)
}

fn malformed(declaration: &str, message: String, span: MacroSpan) -> Diagnostic {
    Diagnostic::warning(message)
        .with_declaration(declaration)
        .at(line_col(span))
}

fn line_col(span: MacroSpan) -> LineCol {
    let start = span.start();
    LineCol::new(start.line, start.column + 1)
}

fn span_of(span: MacroSpan) -> Span {
    let range = span.byte_range();
    Span::new(range.start, range.end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extracts_free_function() {
        let extraction = extract(
            r#"
            #[bind]
            fn add(a: i32, b: i32) -> i32 { a + b }
            "#,
        )
        .unwrap();
        assert!(extraction.diagnostics.is_empty());
        let sig = extraction.function("add").unwrap();
        assert_eq!(sig.receiver, ReceiverKind::None);
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.params[0].ty, TypeDescriptor::Primitive(Primitive::I32));
        assert_eq!(sig.ret, TypeDescriptor::Primitive(Primitive::I32));
        assert_eq!(sig.symbol(), "add");
    }

    #[test]
    fn test_unmarked_functions_are_ignored() {
        let extraction = extract("fn helper() -> i32 { 7 }").unwrap();
        assert!(extraction.functions.is_empty());
        assert!(extraction.diagnostics.is_empty());
    }

    #[test]
    fn test_struct_and_impl_extraction() {
        let extraction = extract(
            r#"
            #[bind]
            #[derive(Clone, Debug)]
            pub struct Point {
                pub x: f64,
                pub y: f64,
            }

            #[bind]
            impl Point {
                #[bind]
                pub fn new(x: f64, y: f64) -> Self {
                    Point { x, y }
                }

                #[bind]
                pub fn magnitude(&self) -> f64 {
                    (self.x * self.x + self.y * self.y).sqrt()
                }

                #[bind]
                pub fn translate(&mut self, dx: f64, dy: f64) {
                    self.x += dx;
                    self.y += dy;
                }
            }
            "#,
        )
        .unwrap();

        let point = extraction.strukt("Point").unwrap();
        assert_eq!(point.fields.len(), 2);
        assert!(point.has_capability("Clone"));

        let ctor = extraction
            .functions
            .iter()
            .find(|f| f.name == "new")
            .unwrap();
        assert!(ctor.is_constructor());
        assert_eq!(ctor.receiver, ReceiverKind::Static);
        assert_eq!(
            ctor.ret,
            TypeDescriptor::OwnedHandle {
                kind: OwnershipKind::Unique,
                inner: Box::new(TypeDescriptor::OpaqueStruct("Point".into())),
            }
        );
        assert_eq!(ctor.symbol(), "Point_new");

        let magnitude = extraction
            .functions
            .iter()
            .find(|f| f.name == "magnitude")
            .unwrap();
        assert_eq!(magnitude.receiver, ReceiverKind::ByRef);

        let translate = extraction
            .functions
            .iter()
            .find(|f| f.name == "translate")
            .unwrap();
        assert_eq!(translate.receiver, ReceiverKind::ByMutRef);
        assert!(translate.ret.is_unit());
    }

    #[test]
    fn test_malformed_marker_does_not_block_others() {
        let extraction = extract(
            r#"
            #[bind(nonsense = 3)]
            fn broken(a: i32) -> i32 { a }

            #[bind]
            fn fine(a: i32) -> i32 { a }
            "#,
        )
        .unwrap();
        assert_eq!(extraction.diagnostics.len(), 1);
        assert!(extraction.diagnostics[0].message.contains("malformed"));
        assert_eq!(extraction.diagnostics[0].declaration.as_deref(), Some("broken"));
        assert!(extraction.function("fine").is_some());
        assert!(extraction.function("broken").is_none());
    }

    #[test]
    fn test_unsafe_fn_rejected_per_declaration() {
        let extraction = extract(
            r#"
            #[bind]
            unsafe fn danger() {}

            #[bind]
            fn safe() -> bool { true }
            "#,
        )
        .unwrap();
        assert_eq!(extraction.diagnostics.len(), 1);
        assert!(extraction.diagnostics[0].message.contains("unsafe"));
        assert!(extraction.function("safe").is_some());
    }

    #[test]
    fn test_tuple_struct_rejected() {
        let extraction = extract(
            r#"
            #[bind]
            struct Pair(i32, i32);
            "#,
        )
        .unwrap();
        assert!(extraction.structs.is_empty());
        assert_eq!(extraction.diagnostics.len(), 1);
    }

    #[test]
    fn test_generic_function_registers_source() {
        let extraction = extract(
            r#"
            #[bind]
            fn identity<T>(x: T) -> T { x }
            "#,
        )
        .unwrap();
        let sig = extraction.function("identity").unwrap();
        assert!(sig.is_generic());
        assert!(sig.caps.contains(SignatureCaps::GENERIC));
        assert_eq!(sig.params[0].ty, TypeDescriptor::GenericParam("T".into()));
        assert_eq!(extraction.generic_sources.len(), 1);
        let (name, source) = &extraction.generic_sources[0];
        assert_eq!(name, "identity");
        assert!(source.contains("fn identity<T>"));
        assert!(!source.contains("#[bind]"));
    }

    #[test]
    fn test_constraints_retained_for_diagnostics() {
        let extraction = extract(
            r#"
            #[bind]
            fn sum<T: std::ops::Add<Output = T>>(a: T, b: T) -> T { a + b }
            "#,
        )
        .unwrap();
        let sig = extraction.function("sum").unwrap();
        assert_eq!(sig.generics.len(), 1);
        assert!(!sig.generics[0].constraints.is_empty());
    }

    #[test]
    fn test_string_and_result_types() {
        let extraction = extract(
            r#"
            #[bind]
            fn greet(name: &str) -> String { format!("hi {name}") }

            #[bind]
            fn checked_div(a: f64, b: f64) -> Result<f64, String> {
                if b == 0.0 { Err("division by zero".into()) } else { Ok(a / b) }
            }

            #[bind]
            fn maybe_sqrt(x: f64) -> Option<f64> {
                if x >= 0.0 { Some(x.sqrt()) } else { None }
            }
            "#,
        )
        .unwrap();
        assert!(extraction.diagnostics.is_empty());

        let greet = extraction.function("greet").unwrap();
        assert_eq!(greet.params[0].ty, TypeDescriptor::OwnedString);
        assert_eq!(greet.ret, TypeDescriptor::OwnedString);
        assert!(greet.caps.contains(SignatureCaps::USES_STRINGS));

        let div = extraction.function("checked_div").unwrap();
        assert!(div.caps.contains(SignatureCaps::FALLIBLE));

        let sqrt = extraction.function("maybe_sqrt").unwrap();
        assert!(sqrt.caps.contains(SignatureCaps::OPTIONAL));
    }

    #[test]
    fn test_handle_return_types() {
        let extraction = extract(
            r#"
            #[bind]
            fn shared_counter(start: i64) -> std::sync::Arc<i64> {
                std::sync::Arc::new(start)
            }
            "#,
        )
        .unwrap();
        let sig = extraction.function("shared_counter").unwrap();
        assert_eq!(
            sig.ret,
            TypeDescriptor::OwnedHandle {
                kind: OwnershipKind::SharedAtomic,
                inner: Box::new(TypeDescriptor::Primitive(Primitive::I64)),
            }
        );
        assert!(sig.caps.contains(SignatureCaps::RETURNS_HANDLE));
    }

    #[test]
    fn test_slice_parameter() {
        let extraction = extract(
            r#"
            #[bind]
            fn mean(values: &[f64]) -> f64 {
                values.iter().sum::<f64>() / values.len() as f64
            }
            "#,
        )
        .unwrap();
        let sig = extraction.function("mean").unwrap();
        assert_eq!(
            sig.params[0].ty,
            TypeDescriptor::Slice(Box::new(TypeDescriptor::Primitive(Primitive::F64)))
        );
        assert!(sig.caps.contains(SignatureCaps::USES_SLICES));
    }
}
