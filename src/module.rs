//! The host-facing module: dynamic values, artifact loading, and call
//! marshaling.
//!
//! Every dynamic invocation goes through the artifact's generated JSON
//! dispatcher; fixed-shape symbols (destructors, reference-count helpers) are
//! resolved directly. Returned foreign-owned values come back as
//! [`HostHandle`]s wired to the lifecycle manager.

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use serde_json::{json, Value};
use tracing::debug;

use ferrule_common::Diagnostic;
use ferrule_ffi::stubgen::{handle_clone_symbol, handle_drop_symbol, DISPATCH_SYMBOL};
use ferrule_ffi::types::{
    FunctionSignature, Primitive, ReceiverKind, StructDescriptor, TypeDescriptor,
};

use crate::context::ContextInner;
use crate::error::{Error, Result};
use crate::handles::{HandleRegistry, HostHandle, SymbolRelease};

// ---------------------------------------------------------------------------
// Host values
// ---------------------------------------------------------------------------

/// A dynamically-typed host value crossing the binding layer.
#[derive(Debug, Clone)]
pub enum HostValue {
    Unit,
    Bool(bool),
    Int32(i32),
    Int(i64),
    Float32(f32),
    Float(f64),
    Str(String),
    List(Vec<HostValue>),
    /// Discriminated ok/err wrapper for foreign `Result` returns.
    Fallible(HostFallible),
    /// Discriminated some/none wrapper for foreign `Option` returns.
    Maybe(HostMaybe),
    Handle(HostHandle),
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Unit => "unit",
            HostValue::Bool(_) => "bool",
            HostValue::Int32(_) => "int32",
            HostValue::Int(_) => "int64",
            HostValue::Float32(_) => "float32",
            HostValue::Float(_) => "float64",
            HostValue::Str(_) => "string",
            HostValue::List(_) => "list",
            HostValue::Fallible(_) => "result",
            HostValue::Maybe(_) => "option",
            HostValue::Handle(_) => "handle",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int32(v) => Some(i64::from(*v)),
            HostValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float32(v) => Some(f64::from(*v)),
            HostValue::Float(v) => Some(*v),
            HostValue::Int32(v) => Some(f64::from(*v)),
            HostValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&HostHandle> {
        match self {
            HostValue::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// The foreign type an argument of this value would bind a type
    /// parameter to. Drives monomorphization inference.
    pub(crate) fn foreign_descriptor(&self) -> Option<TypeDescriptor> {
        match self {
            HostValue::Bool(_) => Some(TypeDescriptor::Primitive(Primitive::Bool)),
            HostValue::Int32(_) => Some(TypeDescriptor::Primitive(Primitive::I32)),
            HostValue::Int(_) => Some(TypeDescriptor::Primitive(Primitive::I64)),
            HostValue::Float32(_) => Some(TypeDescriptor::Primitive(Primitive::F32)),
            HostValue::Float(_) => Some(TypeDescriptor::Primitive(Primitive::F64)),
            HostValue::Str(_) => Some(TypeDescriptor::OwnedString),
            HostValue::Handle(h) => match Primitive::parse(h.class()) {
                Some(prim) => Some(TypeDescriptor::Primitive(prim)),
                None => Some(TypeDescriptor::OpaqueStruct(h.class().to_string())),
            },
            _ => None,
        }
    }
}

/// Ok/err wrapper with `is_ok`/`unwrap`/`unwrap_or` accessors.
#[derive(Debug, Clone)]
pub struct HostFallible {
    is_ok: bool,
    payload: Box<HostValue>,
}

impl HostFallible {
    pub fn ok(value: HostValue) -> Self {
        Self {
            is_ok: true,
            payload: Box::new(value),
        }
    }

    pub fn err(value: HostValue) -> Self {
        Self {
            is_ok: false,
            payload: Box::new(value),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.is_ok
    }

    pub fn unwrap(self) -> Result<HostValue> {
        if self.is_ok {
            Ok(*self.payload)
        } else {
            Err(Error::Foreign(format!(
                "unwrapped an err value: {:?}",
                self.payload
            )))
        }
    }

    pub fn unwrap_or(self, default: HostValue) -> HostValue {
        if self.is_ok {
            *self.payload
        } else {
            default
        }
    }

    pub fn err_value(&self) -> Option<&HostValue> {
        if self.is_ok {
            None
        } else {
            Some(self.payload.as_ref())
        }
    }
}

/// Some/none wrapper with `is_some`/`unwrap`/`unwrap_or` accessors.
#[derive(Debug, Clone)]
pub struct HostMaybe {
    value: Option<Box<HostValue>>,
}

impl HostMaybe {
    pub fn some(value: HostValue) -> Self {
        Self {
            value: Some(Box::new(value)),
        }
    }

    pub fn none() -> Self {
        Self { value: None }
    }

    pub fn is_some(&self) -> bool {
        self.value.is_some()
    }

    pub fn unwrap(self) -> Result<HostValue> {
        self.value
            .map(|v| *v)
            .ok_or_else(|| Error::Foreign("unwrapped a none value".to_string()))
    }

    pub fn unwrap_or(self, default: HostValue) -> HostValue {
        self.value.map(|v| *v).unwrap_or(default)
    }
}

// ---------------------------------------------------------------------------
// Loaded artifacts
// ---------------------------------------------------------------------------

type DispatchFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);
type DropFn = unsafe extern "C" fn(*mut c_void);
type CloneFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// A compiled bridge library mapped into the process. Kept alive by every
/// module and handle that refers into it.
pub struct LoadedArtifact {
    path: PathBuf,
    symbols: Vec<String>,
    library: Library,
}

impl std::fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedArtifact")
            .field("path", &self.path)
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl LoadedArtifact {
    pub fn load(path: &Path, symbols: Vec<String>) -> Result<Arc<Self>> {
        let library = unsafe { Library::new(path) }.map_err(|source| Error::ArtifactLoad {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded bridge artifact");
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            symbols,
            library,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Invoke the generated JSON dispatcher and parse its response envelope.
    pub(crate) fn call_dispatcher(&self, func: &str, args: &Value) -> Result<Value> {
        let dispatch: DispatchFn = unsafe {
            *self
                .library
                .get::<DispatchFn>(DISPATCH_SYMBOL.as_bytes())
                .map_err(|err| Error::Protocol(format!("artifact has no dispatcher: {err}")))?
        };
        let func_c = CString::new(func)
            .map_err(|_| Error::Protocol(format!("function name `{func}` contains NUL")))?;
        let args_c = CString::new(args.to_string())
            .map_err(|_| Error::Protocol("argument JSON contains NUL".to_string()))?;

        let raw = unsafe { dispatch(func_c.as_ptr(), args_c.as_ptr()) };
        if raw.is_null() {
            return Err(Error::Protocol(format!(
                "dispatcher returned null for `{func}`"
            )));
        }
        let rendered = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        if let Ok(free) = unsafe { self.library.get::<FreeFn>(b"ferrule_json_free") } {
            unsafe { free(raw) };
        }
        serde_json::from_str(&rendered)
            .map_err(|err| Error::Protocol(format!("dispatcher response for `{func}`: {err}")))
    }

    pub(crate) unsafe fn drop_fn(&self, symbol: &str) -> std::result::Result<DropFn, libloading::Error> {
        self.library.get::<DropFn>(symbol.as_bytes()).map(|s| *s)
    }

    pub(crate) unsafe fn clone_fn(
        &self,
        symbol: &str,
    ) -> std::result::Result<CloneFn, libloading::Error> {
        self.library.get::<CloneFn>(symbol.as_bytes()).map(|s| *s)
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Marshal `args` per `sig`, invoke through the dispatcher, and unmarshal the
/// response. Consuming parameters (by-value receivers, owned-handle
/// arguments) have their host handles flagged after a successful call.
pub(crate) fn invoke(
    artifact: &Arc<LoadedArtifact>,
    registry: &HandleRegistry,
    sig: &FunctionSignature,
    args: &[HostValue],
) -> Result<HostValue> {
    let symbol = sig.symbol();
    let expected = sig.params.len() + usize::from(sig.has_receiver());
    if args.len() != expected {
        return Err(Error::ArityMismatch {
            symbol,
            expected,
            actual: args.len(),
        });
    }

    let mut json_args = Vec::with_capacity(args.len());
    let mut consumed: Vec<&HostHandle> = Vec::new();
    let mut rest = args;

    if sig.has_receiver() {
        let receiver = &args[0];
        rest = &args[1..];
        let handle = receiver.as_handle().ok_or_else(|| Error::TypeMismatch {
            symbol: symbol.clone(),
            param: "self".to_string(),
            expected: sig.owner.clone().unwrap_or_default(),
            actual: receiver.type_name().to_string(),
        })?;
        if let Some(owner) = &sig.owner {
            if handle.class() != owner {
                return Err(Error::TypeMismatch {
                    symbol: symbol.clone(),
                    param: "self".to_string(),
                    expected: owner.clone(),
                    actual: handle.class().to_string(),
                });
            }
        }
        json_args.push(json!(handle.raw()? as i64));
        if sig.receiver == ReceiverKind::ByValue {
            consumed.push(handle);
        }
    }

    for (param, value) in sig.params.iter().zip(rest) {
        json_args.push(marshal_arg(&symbol, &param.name, param.ty.clone(), value)?);
        // Ownership moves into the callee for owned handles and by-value
        // struct arguments.
        let consumes = matches!(
            param.ty,
            TypeDescriptor::OwnedHandle { .. } | TypeDescriptor::OpaqueStruct(_)
        );
        if let (true, HostValue::Handle(handle)) = (consumes, value) {
            consumed.push(handle);
        }
    }

    let response = artifact.call_dispatcher(&symbol, &Value::Array(json_args))?;
    let ok = response
        .get("ok")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Protocol(format!("missing `ok` field for `{symbol}`")))?;
    if !ok {
        let message = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown foreign failure");
        return Err(Error::Foreign(message.to_string()));
    }

    for handle in consumed {
        handle.mark_consumed();
    }

    let value = response.get("value").cloned().unwrap_or(Value::Null);
    unmarshal(artifact, registry, &sig.ret, value)
}

fn marshal_arg(symbol: &str, param: &str, ty: TypeDescriptor, value: &HostValue) -> Result<Value> {
    let mismatch = || Error::TypeMismatch {
        symbol: symbol.to_string(),
        param: param.to_string(),
        expected: ty.rust_name(),
        actual: value.type_name().to_string(),
    };
    match &ty {
        TypeDescriptor::Primitive(p) if p.is_integer() => {
            value.as_int().map(|v| json!(v)).ok_or_else(mismatch)
        }
        TypeDescriptor::Primitive(p) if p.is_float() => {
            value.as_float().map(|v| json!(v)).ok_or_else(mismatch)
        }
        TypeDescriptor::Primitive(Primitive::Bool) => {
            value.as_bool().map(|v| json!(v)).ok_or_else(mismatch)
        }
        TypeDescriptor::Primitive(Primitive::Char) => match value.as_str() {
            Some(s) if s.chars().count() == 1 => Ok(json!(s)),
            _ => Err(mismatch()),
        },
        TypeDescriptor::Primitive(Primitive::Unit) => Ok(Value::Null),
        TypeDescriptor::OwnedString => {
            value.as_str().map(|v| json!(v)).ok_or_else(mismatch)
        }
        TypeDescriptor::Slice(elem) => match value {
            HostValue::List(items) => {
                let rendered: Result<Vec<Value>> = items
                    .iter()
                    .map(|item| marshal_arg(symbol, param, (**elem).clone(), item))
                    .collect();
                Ok(Value::Array(rendered?))
            }
            _ => Err(mismatch()),
        },
        TypeDescriptor::Option(inner) => match value {
            HostValue::Maybe(maybe) if !maybe.is_some() => Ok(Value::Null),
            HostValue::Maybe(maybe) => {
                let inner_value = maybe.clone().unwrap()?;
                marshal_arg(symbol, param, (**inner).clone(), &inner_value)
            }
            HostValue::Unit => Ok(Value::Null),
            other => marshal_arg(symbol, param, (**inner).clone(), other),
        },
        TypeDescriptor::Pointer { .. }
        | TypeDescriptor::OpaqueStruct(_)
        | TypeDescriptor::OwnedHandle { .. } => match value {
            HostValue::Handle(handle) => Ok(json!(handle.raw()? as i64)),
            _ => Err(mismatch()),
        },
        _ => Err(mismatch()),
    }
}

fn unmarshal(
    artifact: &Arc<LoadedArtifact>,
    registry: &HandleRegistry,
    ty: &TypeDescriptor,
    value: Value,
) -> Result<HostValue> {
    let protocol = |context: &str| Error::Protocol(format!("return value: {context}"));
    match ty {
        TypeDescriptor::Primitive(Primitive::Unit) => Ok(HostValue::Unit),
        TypeDescriptor::Primitive(Primitive::Bool) => value
            .as_bool()
            .map(HostValue::Bool)
            .ok_or_else(|| protocol("expected a boolean")),
        TypeDescriptor::Primitive(Primitive::Char) => value
            .as_str()
            .map(|s| HostValue::Str(s.to_string()))
            .ok_or_else(|| protocol("expected a character")),
        TypeDescriptor::Primitive(p) if p.is_float() => {
            let v = value.as_f64().ok_or_else(|| protocol("expected a number"))?;
            Ok(match p {
                Primitive::F32 => HostValue::Float32(v as f32),
                _ => HostValue::Float(v),
            })
        }
        TypeDescriptor::Primitive(p) => {
            let v = value
                .as_i64()
                .or_else(|| value.as_u64().map(|u| u as i64))
                .ok_or_else(|| protocol("expected an integer"))?;
            Ok(match p {
                Primitive::I8 | Primitive::I16 | Primitive::I32 => HostValue::Int32(v as i32),
                _ => HostValue::Int(v),
            })
        }
        TypeDescriptor::OwnedString => value
            .as_str()
            .map(|s| HostValue::Str(s.to_string()))
            .ok_or_else(|| protocol("expected a string")),
        TypeDescriptor::Result { ok, err } => {
            let is_ok = value
                .get("is_ok")
                .and_then(Value::as_bool)
                .ok_or_else(|| protocol("expected an is_ok wrapper"))?;
            if is_ok {
                let payload = value.get("value").cloned().unwrap_or(Value::Null);
                Ok(HostValue::Fallible(HostFallible::ok(unmarshal(
                    artifact, registry, ok, payload,
                )?)))
            } else {
                let payload = value.get("error").cloned().unwrap_or(Value::Null);
                Ok(HostValue::Fallible(HostFallible::err(unmarshal(
                    artifact, registry, err, payload,
                )?)))
            }
        }
        TypeDescriptor::Option(inner) => {
            let is_some = value
                .get("is_some")
                .and_then(Value::as_bool)
                .ok_or_else(|| protocol("expected an is_some wrapper"))?;
            if is_some {
                let payload = value.get("value").cloned().unwrap_or(Value::Null);
                Ok(HostValue::Maybe(HostMaybe::some(unmarshal(
                    artifact, registry, inner, payload,
                )?)))
            } else {
                Ok(HostValue::Maybe(HostMaybe::none()))
            }
        }
        TypeDescriptor::OwnedHandle { kind, inner } => {
            let raw = value
                .as_i64()
                .ok_or_else(|| protocol("expected a handle pointer"))?;
            let releaser = Arc::new(SymbolRelease {
                class: inner.rust_name(),
                drop_symbol: handle_drop_symbol(*kind, inner),
                clone_symbol: handle_clone_symbol(*kind, inner),
                artifact: Arc::clone(artifact),
            });
            Ok(HostValue::Handle(HostHandle::adopt(
                raw as *mut c_void,
                *kind,
                inner.rust_name(),
                releaser,
                registry,
            )))
        }
        other => Err(protocol(&format!(
            "type `{}` cannot cross the dispatcher",
            other.rust_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Host module
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Function,
    Constructor,
    Method,
    Accessor,
}

#[derive(Debug, Clone)]
pub struct BoundFunction {
    pub signature: FunctionSignature,
    pub kind: BindingKind,
}

/// The mapping `compile_and_bind` hands back: symbol name to
/// callable/constructor/accessor, plus the loaded artifact behind them.
pub struct HostModule {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) artifact: Arc<LoadedArtifact>,
    pub(crate) bindings: HashMap<String, BoundFunction>,
    pub(crate) structs: Vec<StructDescriptor>,
    /// Original marked source; generic specializations re-enter the pipeline
    /// with it.
    pub(crate) source: String,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl std::fmt::Debug for HostModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostModule")
            .field("artifact", &self.artifact.path())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl HostModule {
    /// Export names, host-facing (`add`, `Point.new`, `Point.magnitude`).
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn binding(&self, name: &str) -> Option<&BoundFunction> {
        self.bindings.get(name)
    }

    /// Warnings collected during extraction and dependency parsing.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn artifact_path(&self) -> &Path {
        self.artifact.path()
    }

    /// Invoke a binding with dynamic values. Methods take their receiver
    /// handle as the first argument. Calls to registered generic functions
    /// specialize on the concrete argument types first (cached per tuple).
    pub fn call(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        if let Some(bound) = self.bindings.get(name) {
            return invoke(&self.artifact, &self.ctx.handles, &bound.signature, args);
        }
        if self.ctx.is_registered_generic(name) {
            return crate::context::call_generic(&self.ctx, self, name, args);
        }
        Err(Error::SymbolNotFound(name.to_string()))
    }

    /// Shorthand for `call("{Struct}.new", args)`.
    pub fn construct(&self, struct_name: &str, args: &[HostValue]) -> Result<HostValue> {
        self.call(&format!("{struct_name}.new"), args)
    }

    /// Read a field through the generated accessor.
    pub fn get_field(&self, handle: &HostHandle, field: &str) -> Result<HostValue> {
        let (strukt, field_ty) = self.field_descriptor(handle.class(), field)?;
        let key = format!("{}_get_{}", strukt, field);
        let response = self
            .artifact
            .call_dispatcher(&key, &Value::Array(vec![json!(handle.raw()? as i64)]))?;
        self.accessor_result(&key, response, &field_ty)
    }

    /// Write a field through the generated accessor.
    pub fn set_field(&self, handle: &HostHandle, field: &str, value: &HostValue) -> Result<()> {
        let (strukt, field_ty) = self.field_descriptor(handle.class(), field)?;
        let key = format!("{}_set_{}", strukt, field);
        let rendered = marshal_arg(&key, "value", field_ty, value)?;
        let response = self.artifact.call_dispatcher(
            &key,
            &Value::Array(vec![json!(handle.raw()? as i64), rendered]),
        )?;
        self.accessor_result(&key, response, &TypeDescriptor::UNIT)?;
        Ok(())
    }

    /// Live foreign-owned handles created through this module's context.
    pub fn live_handles(&self) -> usize {
        self.ctx.handles.live_count()
    }

    /// Clone a shared handle through its foreign reference count. Unique
    /// handles refuse; see [`HostHandle::clone_handle`].
    pub fn clone_handle(&self, handle: &HostHandle) -> Result<HostHandle> {
        handle.clone_handle(&self.ctx.handles)
    }

    fn field_descriptor(&self, class: &str, field: &str) -> Result<(String, TypeDescriptor)> {
        let strukt = self
            .structs
            .iter()
            .find(|s| s.name == class)
            .ok_or_else(|| Error::SymbolNotFound(class.to_string()))?;
        let field_desc = strukt
            .fields
            .iter()
            .find(|f| f.name == field)
            .ok_or_else(|| Error::SymbolNotFound(format!("{class}.{field}")))?;
        Ok((strukt.name.clone(), field_desc.ty.clone()))
    }

    fn accessor_result(
        &self,
        key: &str,
        response: Value,
        ty: &TypeDescriptor,
    ) -> Result<HostValue> {
        let ok = response
            .get("ok")
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::Protocol(format!("missing `ok` field for `{key}`")))?;
        if !ok {
            let message = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown foreign failure");
            return Err(Error::Foreign(message.to_string()));
        }
        let value = response.get("value").cloned().unwrap_or(Value::Null);
        unmarshal(&self.artifact, &self.ctx.handles, ty, value)
    }
}
