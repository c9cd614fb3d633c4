//! Signature extraction, type bridging, and bridge-crate generation.
//!
//! This crate turns `#[bind]`-marked Rust source into the pieces the
//! compiler pipeline needs: structured signatures ([`extract`]), a validated
//! mapping between foreign and host types ([`bridge`]), and the generated
//! bridge crate the build orchestrator compiles ([`stubgen`]).

pub mod bridge;
pub mod extract;
pub mod stubgen;
pub mod types;

pub use bridge::{check_signature, check_struct, to_foreign, to_host, BridgeError};
pub use extract::{extract, ExtractError, Extraction, MARKER};
pub use stubgen::{
    generate, handle_clone_symbol, handle_drop_symbol, BindingUnit, GeneratedStub, StubError,
    StubOptions, DISPATCH_SYMBOL, EXPORTS_SYMBOL, STR_FREE_SYMBOL,
};
pub use types::{
    Field, FunctionSignature, GenericParamDecl, HostType, IntWidth, OwnershipKind, Param,
    Primitive, ReceiverKind, SignatureCaps, StructDescriptor, TypeDescriptor,
};
