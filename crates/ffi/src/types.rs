//! Core descriptors shared by the extractor, the type bridge, and the stub
//! generator.
//!
//! A [`TypeDescriptor`] is the foreign (Rust) view of a type; a [`HostType`]
//! is what the embedding runtime sees. Signatures are produced once by
//! extraction and are immutable afterwards.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use ferrule_common::Span;

/// Fixed-layout scalar types that cross the boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Usize,
    Isize,
    F32,
    F64,
    Bool,
    Char,
    Unit,
}

impl Primitive {
    /// The Rust spelling of the primitive.
    pub fn rust_name(&self) -> &'static str {
        match self {
            Primitive::I8 => "i8",
            Primitive::I16 => "i16",
            Primitive::I32 => "i32",
            Primitive::I64 => "i64",
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U32 => "u32",
            Primitive::U64 => "u64",
            Primitive::Usize => "usize",
            Primitive::Isize => "isize",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
            Primitive::Bool => "bool",
            Primitive::Char => "char",
            Primitive::Unit => "()",
        }
    }

    /// Short tag used when naming monomorphized specializations.
    pub fn tag(&self) -> &'static str {
        match self {
            Primitive::Unit => "unit",
            other => other.rust_name(),
        }
    }

    pub fn parse(ident: &str) -> Option<Self> {
        Some(match ident {
            "i8" => Primitive::I8,
            "i16" => Primitive::I16,
            "i32" => Primitive::I32,
            "i64" => Primitive::I64,
            "u8" => Primitive::U8,
            "u16" => Primitive::U16,
            "u32" => Primitive::U32,
            "u64" => Primitive::U64,
            "usize" => Primitive::Usize,
            "isize" => Primitive::Isize,
            "f32" => Primitive::F32,
            "f64" => Primitive::F64,
            "bool" => Primitive::Bool,
            "char" => Primitive::Char,
            _ => return None,
        })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Primitive::I8
                | Primitive::I16
                | Primitive::I32
                | Primitive::I64
                | Primitive::U8
                | Primitive::U16
                | Primitive::U32
                | Primitive::U64
                | Primitive::Usize
                | Primitive::Isize
        )
    }
}

/// How a foreign-owned value is shared once it crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipKind {
    /// `Box<T>`: exactly one owner, released with a single destructor call.
    Unique,
    /// `Rc<T>`: non-atomic reference count, single-thread sharing only.
    SharedSingleThread,
    /// `Arc<T>`: atomic reference count, clone/drop safe across threads.
    SharedAtomic,
}

impl OwnershipKind {
    /// Infix used in generated helper symbols (`Point_rc_clone` and so on).
    pub fn symbol_infix(&self) -> &'static str {
        match self {
            OwnershipKind::Unique => "box",
            OwnershipKind::SharedSingleThread => "rc",
            OwnershipKind::SharedAtomic => "arc",
        }
    }

    /// The Rust wrapper type the kind came from.
    pub fn rust_wrapper(&self) -> &'static str {
        match self {
            OwnershipKind::Unique => "Box",
            OwnershipKind::SharedSingleThread => "Rc",
            OwnershipKind::SharedAtomic => "Arc",
        }
    }
}

/// Foreign-side type shape, as extracted from the marked source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum TypeDescriptor {
    Primitive(Primitive),
    Pointer {
        mutable: bool,
        inner: Box<TypeDescriptor>,
    },
    /// `String` (or a borrowed `&str` argument): crosses as a `{ptr, len}`
    /// pair, never a bare pointer.
    OwnedString,
    /// `&[T]`: borrowed `{ptr, len}` view.
    Slice(Box<TypeDescriptor>),
    Result {
        ok: Box<TypeDescriptor>,
        err: Box<TypeDescriptor>,
    },
    Option(Box<TypeDescriptor>),
    /// `Box<T>` / `Rc<T>` / `Arc<T>`, or a constructor's `Self` return.
    OwnedHandle {
        kind: OwnershipKind,
        inner: Box<TypeDescriptor>,
    },
    /// A binding-marked struct, passed by pointer and opaque to the host.
    OpaqueStruct(String),
    /// An unsubstituted type parameter; only valid inside generic signatures.
    GenericParam(String),
}

impl TypeDescriptor {
    pub const UNIT: TypeDescriptor = TypeDescriptor::Primitive(Primitive::Unit);

    /// Render the descriptor back to Rust source text.
    pub fn rust_name(&self) -> String {
        match self {
            TypeDescriptor::Primitive(p) => p.rust_name().to_string(),
            TypeDescriptor::Pointer { mutable, inner } => {
                let qual = if *mutable { "*mut" } else { "*const" };
                format!("{} {}", qual, inner.rust_name())
            }
            TypeDescriptor::OwnedString => "String".to_string(),
            TypeDescriptor::Slice(elem) => format!("&[{}]", elem.rust_name()),
            TypeDescriptor::Result { ok, err } => {
                format!("Result<{}, {}>", ok.rust_name(), err.rust_name())
            }
            TypeDescriptor::Option(inner) => format!("Option<{}>", inner.rust_name()),
            TypeDescriptor::OwnedHandle { kind, inner } => {
                format!("{}<{}>", kind.rust_wrapper(), inner.rust_name())
            }
            TypeDescriptor::OpaqueStruct(name) => name.clone(),
            TypeDescriptor::GenericParam(name) => name.clone(),
        }
    }

    /// Short tag used in specialized symbol names. Only defined for types a
    /// type parameter can be bound to.
    pub fn mono_tag(&self) -> Option<String> {
        match self {
            TypeDescriptor::Primitive(p) => Some(p.tag().to_string()),
            TypeDescriptor::OwnedString => Some("str".to_string()),
            TypeDescriptor::OpaqueStruct(name) => Some(name.to_ascii_lowercase()),
            _ => None,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(Primitive::Unit))
    }

    /// Whether the descriptor mentions any unsubstituted type parameter.
    pub fn mentions_generic(&self) -> bool {
        match self {
            TypeDescriptor::GenericParam(_) => true,
            TypeDescriptor::Primitive(_)
            | TypeDescriptor::OwnedString
            | TypeDescriptor::OpaqueStruct(_) => false,
            TypeDescriptor::Pointer { inner, .. }
            | TypeDescriptor::Slice(inner)
            | TypeDescriptor::Option(inner)
            | TypeDescriptor::OwnedHandle { inner, .. } => inner.mentions_generic(),
            TypeDescriptor::Result { ok, err } => ok.mentions_generic() || err.mentions_generic(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rust_name())
    }
}

/// Integer widths on the host side. `Size` keeps `usize`/`isize` distinct so
/// the primitive round-trip stays lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
    Size,
}

/// Host-runtime view of a bridged type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum HostType {
    Nothing,
    Boolean,
    Integer { width: IntWidth, signed: bool },
    Float { bits: u8 },
    Character,
    Text,
    List(Box<HostType>),
    /// Discriminated ok/err wrapper with `is_ok`/`unwrap` accessors.
    Fallible { ok: Box<HostType>, err: Box<HostType> },
    /// Discriminated some/none wrapper.
    Maybe(Box<HostType>),
    /// Host proxy backed by an ownership handle.
    HandleObject { kind: OwnershipKind, class: String },
    /// A bound struct viewed through its accessors.
    StructObject(String),
    /// Borrowed pointer passed through untouched.
    RawPointer { mutable: bool },
}

/// How a method takes its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverKind {
    /// Free function, no receiver at all.
    None,
    ByRef,
    ByMutRef,
    ByValue,
    /// Associated function without `self`.
    Static,
}

bitflags! {
    /// Capabilities derived from a signature during extraction; they steer
    /// which wrapper shells and helpers the stub generator emits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignatureCaps: u16 {
        const FALLIBLE = 1 << 0;
        const OPTIONAL = 1 << 1;
        const USES_STRINGS = 1 << 2;
        const USES_SLICES = 1 << 3;
        const RETURNS_HANDLE = 1 << 4;
        const GENERIC = 1 << 5;
        const CONSTRUCTOR = 1 << 6;
        /// The declaration returned `Self` (or the struct by value); the
        /// wrapper boxes the value on the way out.
        const SELF_RETURN = 1 << 7;
    }
}

/// One declared type parameter, constraints kept as raw text for diagnostics
/// only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParamDecl {
    pub name: String,
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeDescriptor,
    /// Set by the type bridge; false blocks binding generation.
    pub ffi_safe: bool,
    /// The declaration took the value by reference (`&str`, `&[T]`); call
    /// sites in generated code borrow accordingly.
    #[serde(default)]
    pub borrowed: bool,
}

/// An extracted function or method signature. Immutable after extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    /// Owning struct for methods; `None` for free functions.
    pub owner: Option<String>,
    pub receiver: ReceiverKind,
    pub params: Vec<Param>,
    pub ret: TypeDescriptor,
    pub generics: Vec<GenericParamDecl>,
    #[serde(skip, default = "SignatureCaps::empty")]
    pub caps: SignatureCaps,
    pub span: Span,
}

impl FunctionSignature {
    /// Exported symbol: `add` for free functions, `Point_distance` for
    /// methods and associated functions.
    pub fn symbol(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}_{}", owner, self.name),
            None => self.name.clone(),
        }
    }

    /// Host-facing name: `add` or `Point.distance`.
    pub fn export_name(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}.{}", owner, self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_generic(&self) -> bool {
        !self.generics.is_empty()
    }

    pub fn is_constructor(&self) -> bool {
        self.caps.contains(SignatureCaps::CONSTRUCTOR)
    }

    pub fn has_receiver(&self) -> bool {
        matches!(
            self.receiver,
            ReceiverKind::ByRef | ReceiverKind::ByMutRef | ReceiverKind::ByValue
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: TypeDescriptor,
    pub ffi_safe: bool,
}

/// A binding-marked struct: named fields plus the derive list, which acts as
/// the struct's capability set (`Clone` unlocks a `{Struct}_clone` helper).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDescriptor {
    pub name: String,
    pub fields: Vec<Field>,
    pub capabilities: Vec<String>,
    pub span: Span,
}

impl StructDescriptor {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_name_rendering() {
        let ty = TypeDescriptor::Result {
            ok: Box::new(TypeDescriptor::Primitive(Primitive::F64)),
            err: Box::new(TypeDescriptor::OwnedString),
        };
        assert_eq!(ty.rust_name(), "Result<f64, String>");

        let handle = TypeDescriptor::OwnedHandle {
            kind: OwnershipKind::SharedAtomic,
            inner: Box::new(TypeDescriptor::OpaqueStruct("Counter".into())),
        };
        assert_eq!(handle.rust_name(), "Arc<Counter>");
    }

    #[test]
    fn test_mono_tags() {
        assert_eq!(
            TypeDescriptor::Primitive(Primitive::I32).mono_tag().unwrap(),
            "i32"
        );
        assert_eq!(TypeDescriptor::OwnedString.mono_tag().unwrap(), "str");
        assert!(TypeDescriptor::Slice(Box::new(TypeDescriptor::Primitive(Primitive::U8)))
            .mono_tag()
            .is_none());
    }

    #[test]
    fn test_symbol_naming() {
        let sig = FunctionSignature {
            name: "distance_to".into(),
            owner: Some("Point".into()),
            receiver: ReceiverKind::ByRef,
            params: Vec::new(),
            ret: TypeDescriptor::Primitive(Primitive::F64),
            generics: Vec::new(),
            caps: SignatureCaps::empty(),
            span: Span::dummy(),
        };
        assert_eq!(sig.symbol(), "Point_distance_to");
        assert_eq!(sig.export_name(), "Point.distance_to");
    }

    #[test]
    fn test_generic_mention() {
        let ty = TypeDescriptor::Option(Box::new(TypeDescriptor::GenericParam("T".into())));
        assert!(ty.mentions_generic());
    }
}
