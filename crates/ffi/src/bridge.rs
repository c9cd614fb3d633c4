//! Bidirectional mapping between foreign and host types.
//!
//! Both directions are total over the supported subset and fail with
//! [`BridgeError::UnsupportedType`] everywhere else. Validation runs over
//! every extracted signature before any compile attempt, so an unbridgeable
//! type is rejected at generation time, never at runtime.

use std::collections::HashSet;

use thiserror::Error;

use crate::types::{
    FunctionSignature, HostType, IntWidth, Primitive, StructDescriptor,
    TypeDescriptor,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("type `{type_name}` has no FFI-safe representation ({context})")]
    UnsupportedType { type_name: String, context: String },
}

impl BridgeError {
    fn unsupported(ty: impl ToString, context: impl Into<String>) -> Self {
        BridgeError::UnsupportedType {
            type_name: ty.to_string(),
            context: context.into(),
        }
    }
}

/// Map a foreign descriptor to the host's view of it.
pub fn to_host(ty: &TypeDescriptor) -> Result<HostType, BridgeError> {
    match ty {
        TypeDescriptor::Primitive(prim) => Ok(primitive_to_host(*prim)),
        TypeDescriptor::Pointer { mutable, .. } => Ok(HostType::RawPointer { mutable: *mutable }),
        TypeDescriptor::OwnedString => Ok(HostType::Text),
        TypeDescriptor::Slice(elem) => Ok(HostType::List(Box::new(to_host(elem)?))),
        TypeDescriptor::Result { ok, err } => Ok(HostType::Fallible {
            ok: Box::new(to_host(ok)?),
            err: Box::new(to_host(err)?),
        }),
        TypeDescriptor::Option(inner) => Ok(HostType::Maybe(Box::new(to_host(inner)?))),
        TypeDescriptor::OwnedHandle { kind, inner } => Ok(HostType::HandleObject {
            kind: *kind,
            class: inner.rust_name(),
        }),
        TypeDescriptor::OpaqueStruct(name) => Ok(HostType::StructObject(name.clone())),
        TypeDescriptor::GenericParam(name) => Err(BridgeError::unsupported(
            name,
            "unsubstituted type parameter",
        )),
    }
}

/// Map a host type back to its foreign descriptor.
pub fn to_foreign(host: &HostType) -> Result<TypeDescriptor, BridgeError> {
    match host {
        HostType::Nothing => Ok(TypeDescriptor::Primitive(Primitive::Unit)),
        HostType::Boolean => Ok(TypeDescriptor::Primitive(Primitive::Bool)),
        HostType::Character => Ok(TypeDescriptor::Primitive(Primitive::Char)),
        HostType::Integer { width, signed } => {
            Ok(TypeDescriptor::Primitive(integer_primitive(*width, *signed)))
        }
        HostType::Float { bits: 32 } => Ok(TypeDescriptor::Primitive(Primitive::F32)),
        HostType::Float { bits: 64 } => Ok(TypeDescriptor::Primitive(Primitive::F64)),
        HostType::Float { bits } => Err(BridgeError::unsupported(
            format!("f{bits}"),
            "unsupported float width",
        )),
        HostType::Text => Ok(TypeDescriptor::OwnedString),
        HostType::List(elem) => Ok(TypeDescriptor::Slice(Box::new(to_foreign(elem)?))),
        HostType::Fallible { ok, err } => Ok(TypeDescriptor::Result {
            ok: Box::new(to_foreign(ok)?),
            err: Box::new(to_foreign(err)?),
        }),
        HostType::Maybe(inner) => Ok(TypeDescriptor::Option(Box::new(to_foreign(inner)?))),
        HostType::HandleObject { kind, class } => {
            let inner = match Primitive::parse(class) {
                Some(prim) => TypeDescriptor::Primitive(prim),
                None => TypeDescriptor::OpaqueStruct(class.clone()),
            };
            Ok(TypeDescriptor::OwnedHandle {
                kind: *kind,
                inner: Box::new(inner),
            })
        }
        HostType::StructObject(name) => Ok(TypeDescriptor::OpaqueStruct(name.clone())),
        // The host keeps no element type for raw pointers; they come back as
        // byte pointers.
        HostType::RawPointer { mutable } => Ok(TypeDescriptor::Pointer {
            mutable: *mutable,
            inner: Box::new(TypeDescriptor::Primitive(Primitive::U8)),
        }),
    }
}

fn primitive_to_host(prim: Primitive) -> HostType {
    match prim {
        Primitive::Unit => HostType::Nothing,
        Primitive::Bool => HostType::Boolean,
        Primitive::Char => HostType::Character,
        Primitive::F32 => HostType::Float { bits: 32 },
        Primitive::F64 => HostType::Float { bits: 64 },
        Primitive::I8 => HostType::Integer { width: IntWidth::W8, signed: true },
        Primitive::I16 => HostType::Integer { width: IntWidth::W16, signed: true },
        Primitive::I32 => HostType::Integer { width: IntWidth::W32, signed: true },
        Primitive::I64 => HostType::Integer { width: IntWidth::W64, signed: true },
        Primitive::Isize => HostType::Integer { width: IntWidth::Size, signed: true },
        Primitive::U8 => HostType::Integer { width: IntWidth::W8, signed: false },
        Primitive::U16 => HostType::Integer { width: IntWidth::W16, signed: false },
        Primitive::U32 => HostType::Integer { width: IntWidth::W32, signed: false },
        Primitive::U64 => HostType::Integer { width: IntWidth::W64, signed: false },
        Primitive::Usize => HostType::Integer { width: IntWidth::Size, signed: false },
    }
}

fn integer_primitive(width: IntWidth, signed: bool) -> Primitive {
    match (width, signed) {
        (IntWidth::W8, true) => Primitive::I8,
        (IntWidth::W16, true) => Primitive::I16,
        (IntWidth::W32, true) => Primitive::I32,
        (IntWidth::W64, true) => Primitive::I64,
        (IntWidth::Size, true) => Primitive::Isize,
        (IntWidth::W8, false) => Primitive::U8,
        (IntWidth::W16, false) => Primitive::U16,
        (IntWidth::W32, false) => Primitive::U32,
        (IntWidth::W64, false) => Primitive::U64,
        (IntWidth::Size, false) => Primitive::Usize,
    }
}

/// Check that every descriptor reachable from `sig` can cross the boundary.
///
/// Generic parameters are exempt on generic signatures (they are substituted
/// before the signature ever reaches the generator); everywhere else they are
/// rejected. Opaque struct references must name a binding-marked struct.
pub fn check_signature(
    sig: &FunctionSignature,
    known_structs: &HashSet<String>,
) -> Result<(), BridgeError> {
    let declared: HashSet<&str> = sig.generics.iter().map(|g| g.name.as_str()).collect();
    for param in &sig.params {
        if matches!(param.ty, TypeDescriptor::Result { .. }) {
            return Err(BridgeError::unsupported(
                param.ty.rust_name(),
                format!(
                    "parameter `{}` of `{}`: results cross the boundary outward only",
                    param.name,
                    sig.export_name()
                ),
            ));
        }
        check_descriptor(&param.ty, &declared, known_structs, sig.owner.as_deref())
            .map_err(|e| contextualize(e, &format!("parameter `{}` of `{}`", param.name, sig.export_name())))?;
    }
    check_descriptor(&sig.ret, &declared, known_structs, sig.owner.as_deref())
        .map_err(|e| contextualize(e, &format!("return type of `{}`", sig.export_name())))?;
    Ok(())
}

/// Validate a struct binding. One unsupported field fails the whole struct
/// with a field-level context rather than producing a silent partial binding.
pub fn check_struct(
    strukt: &StructDescriptor,
    known_structs: &HashSet<String>,
) -> Result<(), BridgeError> {
    let empty = HashSet::new();
    for field in &strukt.fields {
        check_descriptor(&field.ty, &empty, known_structs, None)
            .and_then(|_| to_host(&field.ty).map(|_| ()))
            .map_err(|e| contextualize(e, &format!("field `{}.{}`", strukt.name, field.name)))?;
    }
    Ok(())
}

fn check_descriptor(
    ty: &TypeDescriptor,
    declared_generics: &HashSet<&str>,
    known_structs: &HashSet<String>,
    owner: Option<&str>,
) -> Result<(), BridgeError> {
    match ty {
        TypeDescriptor::Primitive(_) | TypeDescriptor::OwnedString => Ok(()),
        TypeDescriptor::GenericParam(name) => {
            if declared_generics.contains(name.as_str()) {
                Ok(())
            } else {
                Err(BridgeError::unsupported(name, "undeclared type parameter"))
            }
        }
        TypeDescriptor::OpaqueStruct(name) => {
            let resolved = if name == "Self" { owner.unwrap_or(name) } else { name };
            if known_structs.contains(resolved) {
                Ok(())
            } else {
                Err(BridgeError::unsupported(
                    resolved,
                    "not a binding-marked struct",
                ))
            }
        }
        TypeDescriptor::Slice(inner) => match inner.as_ref() {
            TypeDescriptor::Primitive(p) if *p != Primitive::Unit && *p != Primitive::Char => {
                Ok(())
            }
            other => Err(BridgeError::unsupported(
                other.rust_name(),
                "slices cross the boundary with numeric or boolean elements only",
            )),
        },
        TypeDescriptor::Pointer { inner, .. } | TypeDescriptor::Option(inner) => {
            check_descriptor(inner, declared_generics, known_structs, owner)
        }
        TypeDescriptor::OwnedHandle { inner, .. } => match inner.as_ref() {
            TypeDescriptor::Primitive(_) | TypeDescriptor::OpaqueStruct(_) => {
                check_descriptor(inner, declared_generics, known_structs, owner)
            }
            other => Err(BridgeError::unsupported(
                other.rust_name(),
                "ownership handles require a primitive or bound struct payload",
            )),
        },
        TypeDescriptor::Result { ok, err } => {
            check_descriptor(ok, declared_generics, known_structs, owner)?;
            check_descriptor(err, declared_generics, known_structs, owner)
        }
    }
}

fn contextualize(err: BridgeError, context: &str) -> BridgeError {
    match err {
        BridgeError::UnsupportedType { type_name, context: inner } => {
            BridgeError::UnsupportedType {
                type_name,
                context: format!("{context}: {inner}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Param, ReceiverKind, SignatureCaps};
    use ferrule_common::Span;

    const PRIMITIVES: [Primitive; 15] = [
        Primitive::I8,
        Primitive::I16,
        Primitive::I32,
        Primitive::I64,
        Primitive::U8,
        Primitive::U16,
        Primitive::U32,
        Primitive::U64,
        Primitive::Usize,
        Primitive::Isize,
        Primitive::F32,
        Primitive::F64,
        Primitive::Bool,
        Primitive::Char,
        Primitive::Unit,
    ];

    #[test]
    fn test_primitive_round_trip() {
        for prim in PRIMITIVES {
            let foreign = TypeDescriptor::Primitive(prim);
            let host = to_host(&foreign).unwrap();
            assert_eq!(to_foreign(&host).unwrap(), foreign, "round trip of {prim:?}");
        }
    }

    #[test]
    fn test_wrapper_round_trip() {
        let foreign = TypeDescriptor::Result {
            ok: Box::new(TypeDescriptor::OwnedString),
            err: Box::new(TypeDescriptor::Primitive(Primitive::I32)),
        };
        let host = to_host(&foreign).unwrap();
        assert_eq!(to_foreign(&host).unwrap(), foreign);
    }

    #[test]
    fn test_handle_round_trip() {
        let foreign = TypeDescriptor::OwnedHandle {
            kind: OwnershipKind::SharedAtomic,
            inner: Box::new(TypeDescriptor::Primitive(Primitive::I64)),
        };
        let host = to_host(&foreign).unwrap();
        assert!(matches!(
            host,
            HostType::HandleObject { kind: OwnershipKind::SharedAtomic, .. }
        ));
        assert_eq!(to_foreign(&host).unwrap(), foreign);
    }

    #[test]
    fn test_generic_param_is_unsupported() {
        let err = to_host(&TypeDescriptor::GenericParam("T".into())).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedType { .. }));
    }

    fn signature(params: Vec<Param>, ret: TypeDescriptor) -> FunctionSignature {
        FunctionSignature {
            name: "probe".into(),
            owner: None,
            receiver: ReceiverKind::None,
            params,
            ret,
            generics: Vec::new(),
            caps: SignatureCaps::empty(),
            span: Span::dummy(),
        }
    }

    #[test]
    fn test_check_signature_rejects_unknown_struct() {
        let sig = signature(Vec::new(), TypeDescriptor::OpaqueStruct("Mystery".into()));
        let err = check_signature(&sig, &HashSet::new()).unwrap_err();
        let BridgeError::UnsupportedType { type_name, context } = err;
        assert_eq!(type_name, "Mystery");
        assert!(context.contains("return type of `probe`"));
    }

    #[test]
    fn test_check_signature_accepts_known_struct() {
        let mut known = HashSet::new();
        known.insert("Point".to_string());
        let sig = signature(
            vec![Param {
                name: "p".into(),
                ty: TypeDescriptor::Pointer {
                    mutable: false,
                    inner: Box::new(TypeDescriptor::OpaqueStruct("Point".into())),
                },
                ffi_safe: true,
                borrowed: true,
            }],
            TypeDescriptor::Primitive(Primitive::F64),
        );
        check_signature(&sig, &known).unwrap();
    }

    #[test]
    fn test_check_struct_field_failure_names_field() {
        let strukt = StructDescriptor {
            name: "Holder".into(),
            fields: vec![crate::types::Field {
                name: "inner".into(),
                ty: TypeDescriptor::OpaqueStruct("Missing".into()),
                ffi_safe: true,
            }],
            capabilities: Vec::new(),
            span: Span::dummy(),
        };
        let err = check_struct(&strukt, &HashSet::new()).unwrap_err();
        let BridgeError::UnsupportedType { context, .. } = err;
        assert!(context.contains("field `Holder.inner`"));
    }
}
