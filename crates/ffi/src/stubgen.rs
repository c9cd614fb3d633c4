//! Emits the bridge crate (`Cargo.toml` and `lib.rs`) for one binding unit.
//!
//! The generated library contains the user's source with markers stripped,
//! typed `extern "C"` wrappers under the fixed naming conventions
//! (`{Struct}_{method}`, `{Struct}_get_{field}`, `{Struct}_new`,
//! `{Struct}_free`, ...), reference-count helpers for shared handles, and a
//! uniform JSON dispatcher `ferrule_call_json` the in-process host module
//! routes every dynamic call through. Panics never unwind across the
//! boundary; they are caught and reported as JSON errors.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use syn::Item;
use thiserror::Error;

use crate::extract::MARKER;
use crate::types::{
    FunctionSignature, OwnershipKind, Param, Primitive, ReceiverKind, SignatureCaps,
    StructDescriptor, TypeDescriptor,
};

/// Symbol looked up by the host to invoke bindings with dynamic values.
pub const DISPATCH_SYMBOL: &str = "ferrule_call_json";
/// Symbol returning the JSON symbol manifest of the artifact.
pub const EXPORTS_SYMBOL: &str = "ferrule_exports";
/// Frees strings returned by the dispatcher.
pub const STR_FREE_SYMBOL: &str = "ferrule_str_free";

#[derive(Debug, Error)]
pub enum StubError {
    #[error("marked source does not parse: {0}")]
    Unparseable(#[from] syn::Error),
}

/// Everything the generator needs for one compilation unit.
pub struct BindingUnit<'a> {
    /// Raw user source, markers intact.
    pub source: &'a str,
    /// Validated non-generic signatures (functions, methods, constructors).
    pub functions: &'a [FunctionSignature],
    pub structs: &'a [StructDescriptor],
}

#[derive(Debug, Clone)]
pub struct StubOptions {
    pub package_name: String,
    pub edition: String,
    /// Pre-rendered `[dependencies]` entries: `(name, manifest value)`.
    pub dependencies: Vec<(String, String)>,
    /// The experimental portable generator turns this off: typed wrappers
    /// only, no dispatcher and no serde_json dependency.
    pub dispatcher: bool,
}

impl StubOptions {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            edition: "2021".to_string(),
            dependencies: Vec::new(),
            dispatcher: true,
        }
    }
}

/// The generated bridge crate plus its exported symbol list.
#[derive(Debug, Clone)]
pub struct GeneratedStub {
    pub manifest: String,
    pub source: String,
    pub symbols: Vec<String>,
}

pub fn generate(unit: &BindingUnit<'_>, opts: &StubOptions) -> Result<GeneratedStub, StubError> {
    let mut source = String::new();
    source.push_str("// Generated by ferrule. Do not edit.\n");
    source.push_str("#![allow(non_snake_case, dead_code, unused_imports, clippy::missing_safety_doc, improper_ctypes_definitions)]\n\n");
    if opts.dispatcher {
        source.push_str("use serde_json::{json, Value};\n");
        source.push_str("use std::ffi::{CStr, CString};\n");
        source.push_str("use std::os::raw::c_char;\n");
        source.push_str("use std::panic::{catch_unwind, AssertUnwindSafe};\n");
    }
    source.push_str("use std::ffi::c_void;\n\n");

    source.push_str(&rewrite_user_source(unit)?);
    source.push('\n');

    let mut symbols = Vec::new();
    render_str_support(&mut source, &mut symbols);

    for sig in unit.functions {
        render_typed_wrapper(sig, &mut source, &mut symbols);
    }
    for strukt in unit.structs {
        render_struct_support(strukt, unit, &mut source, &mut symbols);
    }
    render_handle_helpers(unit, &mut source, &mut symbols);

    if opts.dispatcher {
        render_dispatcher(unit, &mut source, &mut symbols);
        render_exports(&symbols, &mut source);
        symbols.push(EXPORTS_SYMBOL.to_string());
    }

    Ok(GeneratedStub {
        manifest: render_manifest(opts),
        source,
        symbols,
    })
}

fn render_manifest(opts: &StubOptions) -> String {
    let mut manifest = format!(
        "[package]\nname = \"{name}\"\nversion = \"0.1.0\"\nedition = \"{edition}\"\n\n[lib]\ncrate-type = [\"cdylib\"]\n\n[dependencies]\n",
        name = opts.package_name,
        edition = opts.edition,
    );
    for (name, entry) in &opts.dependencies {
        let _ = writeln!(manifest, "{name} = {entry}");
    }
    if opts.dispatcher {
        manifest.push_str("serde_json = \"1.0\"\n");
    }
    manifest
}

/// Strip markers and retarget the user's declarations for the bridge crate:
/// scalar-only free functions become `#[no_mangle] pub extern "C"` in place
/// (the original declaration is the wrapper); everything else keeps its body
/// under a `{name}_inner` alias that the generated wrappers call.
fn rewrite_user_source(unit: &BindingUnit<'_>) -> Result<String, StubError> {
    let mut file = syn::parse_file(unit.source)?;
    // File-level inner attributes (the fenced manifest block parses as doc
    // attributes) cannot sit mid-file in the generated library.
    file.attrs.clear();
    for item in &mut file.items {
        match item {
            Item::Fn(func) => {
                let marked = strip_marker(&mut func.attrs);
                if !marked {
                    continue;
                }
                let name = func.sig.ident.to_string();
                let Some(sig) = unit.functions.iter().find(|s| s.owner.is_none() && s.name == name)
                else {
                    // Generic declarations stay behind as plain Rust; their
                    // specializations are compiled as separate units.
                    continue;
                };
                if is_direct_export(sig) {
                    func.attrs.insert(0, syn::parse_quote!(#[no_mangle]));
                    func.vis = syn::Visibility::Public(Default::default());
                    func.sig.abi = Some(syn::parse_quote!(extern "C"));
                } else {
                    func.sig.ident = quote::format_ident!("{}_inner", func.sig.ident);
                }
            }
            Item::Struct(strukt) => {
                if strip_marker(&mut strukt.attrs) {
                    strukt.vis = syn::Visibility::Public(Default::default());
                    if let Some(desc) = unit.structs.iter().find(|s| s.name == strukt.ident.to_string()) {
                        if desc
                            .fields
                            .iter()
                            .all(|f| matches!(f.ty, TypeDescriptor::Primitive(_)))
                        {
                            strukt.attrs.insert(0, syn::parse_quote!(#[repr(C)]));
                        }
                    }
                }
            }
            Item::Impl(imp) => {
                strip_marker(&mut imp.attrs);
                for inner in &mut imp.items {
                    if let syn::ImplItem::Fn(method) = inner {
                        strip_marker(&mut method.attrs);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(prettyplease::unparse(&file))
}

fn strip_marker(attrs: &mut Vec<syn::Attribute>) -> bool {
    let before = attrs.len();
    attrs.retain(|attr| !attr.path().is_ident(MARKER));
    attrs.len() != before
}

/// A free function exportable in place: scalar params, scalar return, no
/// receiver, no generics.
fn is_direct_export(sig: &FunctionSignature) -> bool {
    sig.owner.is_none()
        && !sig.is_generic()
        && sig.params.iter().all(|p| is_scalar(&p.ty))
        && (sig.ret.is_unit() || is_scalar(&sig.ret))
}

fn is_scalar(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Primitive(p) if *p != Primitive::Unit && *p != Primitive::Char)
}

// ---------------------------------------------------------------------------
// String support
// ---------------------------------------------------------------------------

fn render_str_support(out: &mut String, symbols: &mut Vec<String>) {
    out.push_str(
        "/// Length-and-pointer pair for owned strings crossing the boundary.\n\
         #[repr(C)]\n\
         pub struct FfiStr {\n    pub ptr: *mut u8,\n    pub len: usize,\n}\n\n\
         impl FfiStr {\n    fn from_string(s: String) -> FfiStr {\n        let boxed = s.into_bytes().into_boxed_slice();\n        let len = boxed.len();\n        let ptr = Box::into_raw(boxed) as *mut u8;\n        FfiStr { ptr, len }\n    }\n\n    unsafe fn to_string(&self) -> String {\n        if self.ptr.is_null() || self.len == 0 {\n            return String::new();\n        }\n        let bytes = std::slice::from_raw_parts(self.ptr, self.len);\n        String::from_utf8_lossy(bytes).into_owned()\n    }\n}\n\n",
    );
    let _ = write!(
        out,
        "#[no_mangle]\npub unsafe extern \"C\" fn {STR_FREE_SYMBOL}(s: FfiStr) {{\n    if !s.ptr.is_null() && s.len > 0 {{\n        let _ = Box::from_raw(std::slice::from_raw_parts_mut(s.ptr, s.len) as *mut [u8]);\n    }}\n}}\n\n"
    );
    symbols.push(STR_FREE_SYMBOL.to_string());
}

// ---------------------------------------------------------------------------
// Typed wrappers
// ---------------------------------------------------------------------------

/// C-side type spelling for a wrapper parameter, with the expression that
/// turns the received value into the call argument.
fn typed_param(ty: &TypeDescriptor, arg: &str) -> Option<(String, String)> {
    match ty {
        TypeDescriptor::Primitive(p) if is_scalar(ty) => {
            Some((p.rust_name().to_string(), arg.to_string()))
        }
        TypeDescriptor::Primitive(Primitive::Char) => Some((
            "u32".to_string(),
            format!("char::from_u32({arg}).unwrap_or('\\u{{fffd}}')"),
        )),
        TypeDescriptor::OwnedString => Some((
            "FfiStr".to_string(),
            format!("unsafe {{ {arg}.to_string() }}"),
        )),
        TypeDescriptor::Pointer { mutable, inner } => {
            let target = inner.rust_name();
            if *mutable {
                Some((format!("*mut {target}"), format!("unsafe {{ &mut *{arg} }}")))
            } else {
                Some((format!("*const {target}"), format!("unsafe {{ &*{arg} }}")))
            }
        }
        TypeDescriptor::OwnedHandle { kind, inner } => {
            let target = inner.rust_name();
            let conv = match kind {
                OwnershipKind::Unique => format!("unsafe {{ *Box::from_raw({arg} as *mut {target}) }}"),
                OwnershipKind::SharedSingleThread => {
                    format!("unsafe {{ std::rc::Rc::from_raw({arg} as *const {target}) }}")
                }
                OwnershipKind::SharedAtomic => {
                    format!("unsafe {{ std::sync::Arc::from_raw({arg} as *const {target}) }}")
                }
            };
            Some(("*mut c_void".to_string(), conv))
        }
        _ => None,
    }
}

/// Emit the typed `extern "C"` wrapper for one signature, when its shape has
/// a fixed C representation. Shapes without one (for example `Result` with a
/// string payload) remain reachable through the dispatcher only.
fn render_typed_wrapper(sig: &FunctionSignature, out: &mut String, symbols: &mut Vec<String>) {
    if sig.is_generic() {
        return;
    }
    // Direct exports were rewritten in place; the declaration is its own
    // wrapper.
    if is_direct_export(sig) {
        symbols.push(sig.symbol());
        return;
    }

    let symbol = sig.symbol();
    let mut args = Vec::new();
    let mut call_args = Vec::new();
    let mut sliced = Vec::new();

    match sig.receiver {
        ReceiverKind::ByRef => args.push(format!("ptr: *const {}", sig.owner.as_deref().unwrap_or(""))),
        ReceiverKind::ByMutRef => args.push(format!("ptr: *mut {}", sig.owner.as_deref().unwrap_or(""))),
        ReceiverKind::ByValue => args.push(format!("ptr: *mut {}", sig.owner.as_deref().unwrap_or(""))),
        ReceiverKind::None | ReceiverKind::Static => {}
    }

    for (idx, param) in sig.params.iter().enumerate() {
        let arg = format!("arg{idx}");
        match &param.ty {
            TypeDescriptor::Slice(elem) => {
                let elem_ty = elem.rust_name();
                args.push(format!("{arg}_ptr: *const {elem_ty}"));
                args.push(format!("{arg}_len: usize"));
                sliced.push(format!(
                    "    let {arg} = unsafe {{ std::slice::from_raw_parts({arg}_ptr, {arg}_len) }};\n"
                ));
                call_args.push(arg);
            }
            other => match typed_param(other, &arg) {
                Some((c_ty, conv)) => {
                    args.push(format!("{arg}: {c_ty}"));
                    if param.borrowed && matches!(other, TypeDescriptor::OwnedString) {
                        call_args.push(format!("&({conv})"));
                    } else {
                        call_args.push(conv);
                    }
                }
                None => return,
            },
        }
    }

    let invocation = typed_invocation(sig, &call_args);
    let (ret_ty, body) = match typed_return(sig, &invocation) {
        Some(pair) => pair,
        None => return,
    };

    if let TypeDescriptor::Result { ok, err } = &sig.ret {
        render_result_shell(&symbol, ok, err, out);
    }
    if let TypeDescriptor::Option(inner) = &sig.ret {
        render_option_shell(&symbol, inner, out);
    }

    let _ = write!(out, "#[no_mangle]\npub extern \"C\" fn {symbol}(");
    out.push_str(&args.join(", "));
    out.push(')');
    if !ret_ty.is_empty() {
        let _ = write!(out, " -> {ret_ty}");
    }
    out.push_str(" {\n");
    for line in sliced {
        out.push_str(&line);
    }
    out.push_str(&body);
    out.push_str("}\n\n");
    symbols.push(symbol);
}

fn typed_invocation(sig: &FunctionSignature, call_args: &[String]) -> String {
    let joined = call_args.join(", ");
    // Receiver expressions are parenthesized so the unsafe block never lands
    // at statement position.
    match (&sig.owner, sig.receiver) {
        (Some(owner), ReceiverKind::Static) => {
            format!("{owner}::{}({joined})", sig.name)
        }
        (Some(_), ReceiverKind::ByRef) => {
            format!("(unsafe {{ &*ptr }}).{}({joined})", sig.name)
        }
        (Some(_), ReceiverKind::ByMutRef) => {
            format!("(unsafe {{ &mut *ptr }}).{}({joined})", sig.name)
        }
        (Some(_), ReceiverKind::ByValue) => {
            format!("(unsafe {{ *Box::from_raw(ptr) }}).{}({joined})", sig.name)
        }
        _ => format!("{}({joined})", free_fn_callee(sig)),
    }
}

fn free_fn_callee(sig: &FunctionSignature) -> String {
    if is_direct_export(sig) {
        sig.name.clone()
    } else {
        format!("{}_inner", sig.name)
    }
}

fn typed_return(sig: &FunctionSignature, invocation: &str) -> Option<(String, String)> {
    match &sig.ret {
        TypeDescriptor::Primitive(Primitive::Unit) => {
            Some((String::new(), format!("    {invocation};\n")))
        }
        TypeDescriptor::Primitive(Primitive::Char) => Some((
            "u32".to_string(),
            format!("    {invocation} as u32\n"),
        )),
        TypeDescriptor::Primitive(_) => Some((
            sig.ret.rust_name(),
            format!("    {invocation}\n"),
        )),
        TypeDescriptor::OwnedString => Some((
            "FfiStr".to_string(),
            format!("    FfiStr::from_string({invocation})\n"),
        )),
        TypeDescriptor::OwnedHandle { kind, .. } => {
            let expr = match kind {
                OwnershipKind::Unique => {
                    // `Self` and by-value struct returns produce the value
                    // itself and get boxed on the way out; declared `Box<T>`
                    // returns are already boxed.
                    if sig.caps.contains(SignatureCaps::SELF_RETURN) {
                        format!("Box::into_raw(Box::new({invocation})) as *mut c_void")
                    } else {
                        format!("Box::into_raw({invocation}) as *mut c_void")
                    }
                }
                OwnershipKind::SharedSingleThread => {
                    format!("std::rc::Rc::into_raw({invocation}) as *mut c_void")
                }
                OwnershipKind::SharedAtomic => {
                    format!("std::sync::Arc::into_raw({invocation}) as *mut c_void")
                }
            };
            Some(("*mut c_void".to_string(), format!("    {expr}\n")))
        }
        TypeDescriptor::Result { ok, err } => {
            if !is_scalar(ok) || !is_scalar(err) {
                return None;
            }
            let shell = format!("CResult_{}", sig.symbol());
            Some((
                shell.clone(),
                format!(
                    "    match {invocation} {{\n        Ok(value) => {shell} {{ is_ok: 1, ok_value: value, err_value: unsafe {{ std::mem::zeroed() }} }},\n        Err(err) => {shell} {{ is_ok: 0, ok_value: unsafe {{ std::mem::zeroed() }}, err_value: err }},\n    }}\n"
                ),
            ))
        }
        TypeDescriptor::Option(inner) => {
            if !is_scalar(inner) {
                return None;
            }
            let shell = format!("COption_{}", sig.symbol());
            Some((
                shell.clone(),
                format!(
                    "    match {invocation} {{\n        Some(value) => {shell} {{ is_some: 1, value }},\n        None => {shell} {{ is_some: 0, value: unsafe {{ std::mem::zeroed() }} }},\n    }}\n"
                ),
            ))
        }
        _ => None,
    }
}

fn render_result_shell(symbol: &str, ok: &TypeDescriptor, err: &TypeDescriptor, out: &mut String) {
    if !is_scalar(ok) || !is_scalar(err) {
        return;
    }
    let _ = write!(
        out,
        "#[repr(C)]\npub struct CResult_{symbol} {{\n    pub is_ok: u8,\n    pub ok_value: {},\n    pub err_value: {},\n}}\n\n",
        ok.rust_name(),
        err.rust_name()
    );
}

fn render_option_shell(symbol: &str, inner: &TypeDescriptor, out: &mut String) {
    if !is_scalar(inner) {
        return;
    }
    let _ = write!(
        out,
        "#[repr(C)]\npub struct COption_{symbol} {{\n    pub is_some: u8,\n    pub value: {},\n}}\n\n",
        inner.rust_name()
    );
}

// ---------------------------------------------------------------------------
// Struct support: destructor, clone, field accessors
// ---------------------------------------------------------------------------

fn render_struct_support(
    strukt: &StructDescriptor,
    _unit: &BindingUnit<'_>,
    out: &mut String,
    symbols: &mut Vec<String>,
) {
    let name = &strukt.name;

    let _ = write!(
        out,
        "#[no_mangle]\npub extern \"C\" fn {name}_free(ptr: *mut {name}) {{\n    if !ptr.is_null() {{\n        unsafe {{ drop(Box::from_raw(ptr)); }}\n    }}\n}}\n\n"
    );
    symbols.push(format!("{name}_free"));

    if strukt.has_capability("Clone") {
        let _ = write!(
            out,
            "#[no_mangle]\npub extern \"C\" fn {name}_clone(ptr: *const {name}) -> *mut {name} {{\n    if ptr.is_null() {{\n        return std::ptr::null_mut();\n    }}\n    let cloned = unsafe {{ (*ptr).clone() }};\n    Box::into_raw(Box::new(cloned))\n}}\n\n"
        );
        symbols.push(format!("{name}_clone"));
    }

    for field in &strukt.fields {
        let field_name = &field.name;
        match &field.ty {
            TypeDescriptor::Primitive(p) if *p != Primitive::Unit && *p != Primitive::Char => {
                let ty = p.rust_name();
                let _ = write!(
                    out,
                    "#[no_mangle]\npub extern \"C\" fn {name}_get_{field_name}(ptr: *const {name}) -> {ty} {{\n    unsafe {{ (*ptr).{field_name} }}\n}}\n\n#[no_mangle]\npub extern \"C\" fn {name}_set_{field_name}(ptr: *mut {name}, value: {ty}) {{\n    unsafe {{ (*ptr).{field_name} = value; }}\n}}\n\n"
                );
            }
            TypeDescriptor::OwnedString => {
                let _ = write!(
                    out,
                    "#[no_mangle]\npub extern \"C\" fn {name}_get_{field_name}(ptr: *const {name}) -> FfiStr {{\n    FfiStr::from_string(unsafe {{ (*ptr).{field_name}.clone() }})\n}}\n\n#[no_mangle]\npub extern \"C\" fn {name}_set_{field_name}(ptr: *mut {name}, value: FfiStr) {{\n    unsafe {{ (*ptr).{field_name} = value.to_string(); }}\n}}\n\n"
                );
            }
            _ => continue,
        }
        symbols.push(format!("{name}_get_{field_name}"));
        symbols.push(format!("{name}_set_{field_name}"));
    }
}

// ---------------------------------------------------------------------------
// Shared-handle helpers
// ---------------------------------------------------------------------------

/// Emit clone/drop helpers for every `(kind, payload)` pair that appears in a
/// handle-returning signature. Shared kinds must go through the foreign
/// reference count; unique payloads only need a destructor.
fn render_handle_helpers(unit: &BindingUnit<'_>, out: &mut String, symbols: &mut Vec<String>) {
    let mut seen: BTreeSet<(String, &'static str)> = BTreeSet::new();
    for sig in unit.functions {
        let TypeDescriptor::OwnedHandle { kind, inner } = &sig.ret else {
            continue;
        };
        let target = inner.rust_name();
        let prefix = handle_symbol_prefix(inner);
        if !seen.insert((prefix.clone(), kind.symbol_infix())) {
            continue;
        }
        match kind {
            OwnershipKind::Unique => {
                // `{Struct}_free` already covers bound structs; primitives
                // boxed across the boundary get their own destructor.
                if matches!(inner.as_ref(), TypeDescriptor::Primitive(_)) {
                    let _ = write!(
                        out,
                        "#[no_mangle]\npub unsafe extern \"C\" fn {prefix}_box_free(ptr: *mut c_void) {{\n    if !ptr.is_null() {{\n        let _ = Box::from_raw(ptr as *mut {target});\n    }}\n}}\n\n"
                    );
                    symbols.push(format!("{prefix}_box_free"));
                }
            }
            OwnershipKind::SharedSingleThread => {
                let _ = write!(
                    out,
                    "#[no_mangle]\npub unsafe extern \"C\" fn {prefix}_rc_clone(ptr: *mut c_void) -> *mut c_void {{\n    if ptr.is_null() {{\n        return std::ptr::null_mut();\n    }}\n    let rc = std::rc::Rc::from_raw(ptr as *const {target});\n    let cloned = std::rc::Rc::clone(&rc);\n    std::mem::forget(rc);\n    std::rc::Rc::into_raw(cloned) as *mut c_void\n}}\n\n#[no_mangle]\npub unsafe extern \"C\" fn {prefix}_rc_drop(ptr: *mut c_void) {{\n    if !ptr.is_null() {{\n        let _ = std::rc::Rc::from_raw(ptr as *const {target});\n    }}\n}}\n\n"
                );
                symbols.push(format!("{prefix}_rc_clone"));
                symbols.push(format!("{prefix}_rc_drop"));
            }
            OwnershipKind::SharedAtomic => {
                let _ = write!(
                    out,
                    "#[no_mangle]\npub unsafe extern \"C\" fn {prefix}_arc_clone(ptr: *mut c_void) -> *mut c_void {{\n    if ptr.is_null() {{\n        return std::ptr::null_mut();\n    }}\n    let arc = std::sync::Arc::from_raw(ptr as *const {target});\n    let cloned = std::sync::Arc::clone(&arc);\n    std::mem::forget(arc);\n    std::sync::Arc::into_raw(cloned) as *mut c_void\n}}\n\n#[no_mangle]\npub unsafe extern \"C\" fn {prefix}_arc_drop(ptr: *mut c_void) {{\n    if !ptr.is_null() {{\n        let _ = std::sync::Arc::from_raw(ptr as *const {target});\n    }}\n}}\n\n"
                );
                symbols.push(format!("{prefix}_arc_clone"));
                symbols.push(format!("{prefix}_arc_drop"));
            }
        }
    }
}

/// Symbol prefix for handle helpers: the struct name, or `prim_{tag}` for
/// boxed primitives.
pub fn handle_symbol_prefix(inner: &TypeDescriptor) -> String {
    match inner {
        TypeDescriptor::OpaqueStruct(name) => name.clone(),
        TypeDescriptor::Primitive(p) => format!("prim_{}", p.tag()),
        other => format!("prim_{}", other.rust_name()),
    }
}

/// The destructor symbol the host calls to release a handle of this shape.
pub fn handle_drop_symbol(kind: OwnershipKind, inner: &TypeDescriptor) -> String {
    let prefix = handle_symbol_prefix(inner);
    match (kind, inner) {
        (OwnershipKind::Unique, TypeDescriptor::OpaqueStruct(_)) => format!("{prefix}_free"),
        (OwnershipKind::Unique, _) => format!("{prefix}_box_free"),
        (OwnershipKind::SharedSingleThread, _) => format!("{prefix}_rc_drop"),
        (OwnershipKind::SharedAtomic, _) => format!("{prefix}_arc_drop"),
    }
}

/// The clone symbol for shared handles; unique handles have none.
pub fn handle_clone_symbol(kind: OwnershipKind, inner: &TypeDescriptor) -> Option<String> {
    let prefix = handle_symbol_prefix(inner);
    match kind {
        OwnershipKind::Unique => None,
        OwnershipKind::SharedSingleThread => Some(format!("{prefix}_rc_clone")),
        OwnershipKind::SharedAtomic => Some(format!("{prefix}_arc_clone")),
    }
}

// ---------------------------------------------------------------------------
// JSON dispatcher
// ---------------------------------------------------------------------------

fn render_dispatcher(unit: &BindingUnit<'_>, out: &mut String, symbols: &mut Vec<String>) {
    let _ = write!(
        out,
        "#[no_mangle]\npub extern \"C\" fn {DISPATCH_SYMBOL}(func: *const c_char, args_json: *const c_char) -> *mut c_char {{\n"
    );
    out.push_str(
        "    let func_name = unsafe {\n        if func.is_null() {\n            return std::ptr::null_mut();\n        }\n        match CStr::from_ptr(func).to_str() {\n            Ok(value) => value.to_owned(),\n            Err(_) => return std::ptr::null_mut(),\n        }\n    };\n",
    );
    out.push_str(
        "    let args_string = unsafe {\n        if args_json.is_null() {\n            String::from(\"[]\")\n        } else {\n            match CStr::from_ptr(args_json).to_str() {\n                Ok(value) => value.to_owned(),\n                Err(_) => return std::ptr::null_mut(),\n            }\n        }\n    };\n",
    );
    out.push_str(
        "    let invocation = move || -> Result<Value, String> {\n        let args_value: Value = serde_json::from_str(&args_string).map_err(|e| e.to_string())?;\n        let args = args_value.as_array().ok_or_else(|| \"expected a JSON array of arguments\".to_string())?;\n        match func_name.as_str() {\n",
    );

    for sig in unit.functions {
        if sig.is_generic() {
            continue;
        }
        render_dispatch_arm(sig, out);
    }
    for strukt in unit.structs {
        render_accessor_arms(strukt, out);
    }

    out.push_str(
        "            other => Err(format!(\"unknown function `{other}`\")),\n        }\n    };\n",
    );
    out.push_str(
        "    let response = match catch_unwind(AssertUnwindSafe(invocation)) {\n        Ok(Ok(value)) => json!({ \"ok\": true, \"value\": value }),\n        Ok(Err(message)) => json!({ \"ok\": false, \"error\": message }),\n        Err(_) => json!({ \"ok\": false, \"error\": \"panic in foreign function\" }),\n    };\n    match CString::new(response.to_string()) {\n        Ok(cstr) => cstr.into_raw(),\n        Err(_) => std::ptr::null_mut(),\n    }\n}\n\n",
    );
    let _ = write!(
        out,
        "#[no_mangle]\npub extern \"C\" fn ferrule_json_free(ptr: *mut c_char) {{\n    if !ptr.is_null() {{\n        unsafe {{\n            let _ = CString::from_raw(ptr);\n        }}\n    }}\n}}\n\n"
    );
    symbols.push(DISPATCH_SYMBOL.to_string());
    symbols.push("ferrule_json_free".to_string());
}

fn render_dispatch_arm(sig: &FunctionSignature, out: &mut String) {
    let key = sig.symbol();
    let _ = write!(out, "            \"{key}\" => {{\n");

    let mut offset = 0usize;
    let recv_expr = match (sig.owner.as_deref(), sig.receiver) {
        (Some(owner), ReceiverKind::ByRef) => {
            offset = 1;
            render_json_int(out, 0, &key);
            Some(format!("unsafe {{ &*(arg0 as *const {owner}) }}"))
        }
        (Some(owner), ReceiverKind::ByMutRef) => {
            offset = 1;
            render_json_int(out, 0, &key);
            Some(format!("unsafe {{ &mut *(arg0 as *mut {owner}) }}"))
        }
        (Some(owner), ReceiverKind::ByValue) => {
            offset = 1;
            render_json_int(out, 0, &key);
            Some(format!("unsafe {{ *Box::from_raw(arg0 as *mut {owner}) }}"))
        }
        _ => None,
    };

    let mut call_args = Vec::new();
    for (i, param) in sig.params.iter().enumerate() {
        let idx = i + offset;
        call_args.push(render_json_param(out, idx, param, &key));
    }

    let joined = call_args.join(", ");
    let invocation = match (&sig.owner, recv_expr) {
        (Some(owner), None) => format!("{owner}::{}({joined})", sig.name),
        (Some(_), Some(recv)) => format!("{recv}.{}({joined})", sig.name),
        (None, _) => format!("{}({joined})", free_fn_callee(sig)),
    };

    let _ = writeln!(out, "                let result = {invocation};");
    render_json_result(out, sig);
    out.push_str("            }\n");
}

fn render_json_int(out: &mut String, idx: usize, key: &str) {
    let _ = write!(
        out,
        "                let arg{idx} = args.get({idx}).and_then(Value::as_i64).ok_or_else(|| format!(\"argument {idx} of `{key}` must be an integer\"))?;\n"
    );
}

/// Parse one dispatcher argument from the JSON array; returns the expression
/// used at the call site.
fn render_json_param(out: &mut String, idx: usize, param: &Param, key: &str) -> String {
    match &param.ty {
        TypeDescriptor::Primitive(p) if p.is_integer() => {
            render_json_int(out, idx, key);
            format!("arg{idx} as {}", p.rust_name())
        }
        TypeDescriptor::Primitive(p) if p.is_float() => {
            let _ = write!(
                out,
                "                let arg{idx} = args.get({idx}).and_then(Value::as_f64).ok_or_else(|| format!(\"argument {idx} of `{key}` must be a number\"))?;\n"
            );
            format!("arg{idx} as {}", p.rust_name())
        }
        TypeDescriptor::Primitive(Primitive::Bool) => {
            let _ = write!(
                out,
                "                let arg{idx} = args.get({idx}).and_then(Value::as_bool).ok_or_else(|| format!(\"argument {idx} of `{key}` must be a boolean\"))?;\n"
            );
            format!("arg{idx}")
        }
        TypeDescriptor::Primitive(Primitive::Char) => {
            let _ = write!(
                out,
                "                let arg{idx} = args.get({idx}).and_then(Value::as_str).and_then(|s| s.chars().next()).ok_or_else(|| format!(\"argument {idx} of `{key}` must be a one-character string\"))?;\n"
            );
            format!("arg{idx}")
        }
        TypeDescriptor::OwnedString => {
            let _ = write!(
                out,
                "                let arg{idx} = args.get({idx}).and_then(Value::as_str).ok_or_else(|| format!(\"argument {idx} of `{key}` must be a string\"))?.to_owned();\n"
            );
            if param.borrowed {
                format!("&arg{idx}")
            } else {
                format!("arg{idx}")
            }
        }
        TypeDescriptor::Slice(elem) => {
            let elem_ty = elem.rust_name();
            let parse_elem = match elem.as_ref() {
                TypeDescriptor::Primitive(p) if p.is_float() => {
                    format!("v.as_f64().map(|x| x as {elem_ty})")
                }
                TypeDescriptor::Primitive(Primitive::Bool) => "v.as_bool()".to_string(),
                _ => format!("v.as_i64().map(|x| x as {elem_ty})"),
            };
            let _ = write!(
                out,
                "                let arg{idx}: Vec<{elem_ty}> = args.get({idx}).and_then(Value::as_array).ok_or_else(|| format!(\"argument {idx} of `{key}` must be an array\"))?.iter().map(|v| {parse_elem}.ok_or_else(|| format!(\"argument {idx} of `{key}` has a mistyped element\"))).collect::<Result<_, _>>()?;\n"
            );
            format!("&arg{idx}")
        }
        TypeDescriptor::Pointer { mutable, inner } => {
            render_json_int(out, idx, key);
            let target = inner.rust_name();
            if *mutable {
                format!("unsafe {{ &mut *(arg{idx} as *mut {target}) }}")
            } else {
                format!("unsafe {{ &*(arg{idx} as *const {target}) }}")
            }
        }
        TypeDescriptor::OwnedHandle { kind, inner } => {
            render_json_int(out, idx, key);
            let target = inner.rust_name();
            match kind {
                OwnershipKind::Unique => {
                    format!("unsafe {{ *Box::from_raw(arg{idx} as *mut {target}) }}")
                }
                OwnershipKind::SharedSingleThread => {
                    format!("unsafe {{ std::rc::Rc::from_raw(arg{idx} as *const {target}) }}")
                }
                OwnershipKind::SharedAtomic => {
                    format!("unsafe {{ std::sync::Arc::from_raw(arg{idx} as *const {target}) }}")
                }
            }
        }
        // A by-value struct argument: the host hands ownership over, exactly
        // like a unique handle.
        TypeDescriptor::OpaqueStruct(name) => {
            render_json_int(out, idx, key);
            format!("unsafe {{ *Box::from_raw(arg{idx} as *mut {name}) }}")
        }
        TypeDescriptor::Option(inner) => {
            let inner_ty = inner.rust_name();
            let parse = match inner.as_ref() {
                TypeDescriptor::Primitive(p) if p.is_float() => {
                    format!("v.as_f64().map(|x| x as {inner_ty})")
                }
                TypeDescriptor::Primitive(Primitive::Bool) => "v.as_bool()".to_string(),
                TypeDescriptor::Primitive(Primitive::Char) => {
                    "v.as_str().and_then(|s| s.chars().next())".to_string()
                }
                TypeDescriptor::OwnedString => "v.as_str().map(|s| s.to_owned())".to_string(),
                _ => format!("v.as_i64().map(|x| x as {inner_ty})"),
            };
            let _ = write!(
                out,
                "                let arg{idx}: Option<{inner_ty}> = match args.get({idx}) {{\n                    None | Some(Value::Null) => None,\n                    Some(v) => Some({parse}.ok_or_else(|| format!(\"argument {idx} of `{key}` has the wrong type\"))?),\n                }};\n"
            );
            format!("arg{idx}")
        }
        // Remaining shapes were rejected by the bridge before generation.
        other => {
            let _ = write!(
                out,
                "                return Err(format!(\"argument {idx} of `{key}` has unbridgeable type `{}`\"));\n",
                other.rust_name()
            );
            String::new()
        }
    }
}

fn render_json_result(out: &mut String, sig: &FunctionSignature) {
    match &sig.ret {
        TypeDescriptor::Primitive(Primitive::Unit) => {
            out.push_str("                let _ = result;\n                Ok(json!(null))\n");
        }
        TypeDescriptor::Primitive(Primitive::Char) => {
            out.push_str("                Ok(json!(result.to_string()))\n");
        }
        TypeDescriptor::Primitive(_) | TypeDescriptor::OwnedString => {
            out.push_str("                Ok(json!(result))\n");
        }
        TypeDescriptor::Result { ok, err } => {
            out.push_str("                match result {\n");
            out.push_str(&format!(
                "                    Ok(value) => Ok(json!({{ \"is_ok\": true, \"value\": {} }})),\n",
                json_payload("value", ok)
            ));
            out.push_str(&format!(
                "                    Err(error) => Ok(json!({{ \"is_ok\": false, \"error\": {} }})),\n",
                json_payload("error", err)
            ));
            out.push_str("                }\n");
        }
        TypeDescriptor::Option(inner) => {
            out.push_str("                match result {\n");
            out.push_str(&format!(
                "                    Some(value) => Ok(json!({{ \"is_some\": true, \"value\": {} }})),\n",
                json_payload("value", inner)
            ));
            out.push_str(
                "                    None => Ok(json!({ \"is_some\": false })),\n                }\n",
            );
        }
        TypeDescriptor::OwnedHandle { kind, .. } => {
            let expr = match kind {
                OwnershipKind::Unique => {
                    if sig.caps.contains(SignatureCaps::SELF_RETURN) {
                        "Box::into_raw(Box::new(result)) as i64"
                    } else {
                        "Box::into_raw(result) as i64"
                    }
                }
                OwnershipKind::SharedSingleThread => {
                    "std::rc::Rc::into_raw(result) as *mut c_void as i64"
                }
                OwnershipKind::SharedAtomic => {
                    "std::sync::Arc::into_raw(result) as *mut c_void as i64"
                }
            };
            let _ = writeln!(out, "                Ok(json!({expr}))");
        }
        other => {
            let _ = write!(
                out,
                "                let _ = result;\n                Err(\"return type `{}` cannot cross the dispatcher\".to_string())\n",
                other.rust_name()
            );
        }
    }
}

/// Payload serialization inside Result/Option wrappers.
fn json_payload(ident: &str, ty: &TypeDescriptor) -> String {
    match ty {
        TypeDescriptor::Primitive(Primitive::Unit) => "json!(null)".to_string(),
        TypeDescriptor::Primitive(Primitive::Char) => format!("json!({ident}.to_string())"),
        TypeDescriptor::Primitive(_) | TypeDescriptor::OwnedString => format!("json!({ident})"),
        // Wrapped handle payloads are always declared `Box`/`Rc`/`Arc`, so
        // the value is already in its wrapper.
        TypeDescriptor::OwnedHandle { kind, .. } => match kind {
            OwnershipKind::Unique => format!("json!(Box::into_raw({ident}) as i64)"),
            OwnershipKind::SharedSingleThread => {
                format!("json!(std::rc::Rc::into_raw({ident}) as *mut c_void as i64)")
            }
            OwnershipKind::SharedAtomic => {
                format!("json!(std::sync::Arc::into_raw({ident}) as *mut c_void as i64)")
            }
        },
        _ => format!("json!(format!(\"{{:?}}\", {ident}))"),
    }
}

/// Struct accessors go through the dispatcher too, so the host can read and
/// write fields with dynamic values.
fn render_accessor_arms(strukt: &StructDescriptor, out: &mut String) {
    let name = &strukt.name;
    for field in &strukt.fields {
        let field_name = &field.name;
        let get_key = format!("{name}_get_{field_name}");
        let set_key = format!("{name}_set_{field_name}");
        match &field.ty {
            TypeDescriptor::Primitive(p) if *p != Primitive::Unit && *p != Primitive::Char => {
                let _ = write!(out, "            \"{get_key}\" => {{\n");
                render_json_int(out, 0, &get_key);
                let _ = write!(
                    out,
                    "                Ok(json!(unsafe {{ (*(arg0 as *const {name})).{field_name} }}))\n            }}\n"
                );

                let _ = write!(out, "            \"{set_key}\" => {{\n");
                render_json_int(out, 0, &set_key);
                let value_expr = if p.is_float() {
                    format!(
                        "args.get(1).and_then(Value::as_f64).ok_or_else(|| format!(\"argument 1 of `{set_key}` must be a number\"))? as {}",
                        p.rust_name()
                    )
                } else if *p == Primitive::Bool {
                    format!(
                        "args.get(1).and_then(Value::as_bool).ok_or_else(|| format!(\"argument 1 of `{set_key}` must be a boolean\"))?"
                    )
                } else {
                    format!(
                        "args.get(1).and_then(Value::as_i64).ok_or_else(|| format!(\"argument 1 of `{set_key}` must be an integer\"))? as {}",
                        p.rust_name()
                    )
                };
                let _ = write!(
                    out,
                    "                let value = {value_expr};\n                unsafe {{ (*(arg0 as *mut {name})).{field_name} = value; }}\n                Ok(json!(null))\n            }}\n"
                );
            }
            TypeDescriptor::OwnedString => {
                let _ = write!(out, "            \"{get_key}\" => {{\n");
                render_json_int(out, 0, &get_key);
                let _ = write!(
                    out,
                    "                Ok(json!(unsafe {{ (*(arg0 as *const {name})).{field_name}.clone() }}))\n            }}\n"
                );

                let _ = write!(out, "            \"{set_key}\" => {{\n");
                render_json_int(out, 0, &set_key);
                let _ = write!(
                    out,
                    "                let value = args.get(1).and_then(Value::as_str).ok_or_else(|| format!(\"argument 1 of `{set_key}` must be a string\"))?.to_owned();\n                unsafe {{ (*(arg0 as *mut {name})).{field_name} = value; }}\n                Ok(json!(null))\n            }}\n"
                );
            }
            _ => {}
        }
    }
}

fn render_exports(symbols: &[String], out: &mut String) {
    let listing = serde_json_escape(symbols);
    let _ = write!(
        out,
        "#[no_mangle]\npub extern \"C\" fn {EXPORTS_SYMBOL}() -> *mut c_char {{\n    match CString::new(\"{listing}\") {{\n        Ok(cstr) => cstr.into_raw(),\n        Err(_) => std::ptr::null_mut(),\n    }}\n}}\n\n"
    );
}

fn serde_json_escape(symbols: &[String]) -> String {
    let mut listing = String::from("[");
    for (i, symbol) in symbols.iter().enumerate() {
        if i > 0 {
            listing.push(',');
        }
        listing.push_str("\\\"");
        listing.push_str(symbol);
        listing.push_str("\\\"");
    }
    listing.push(']');
    listing
}
