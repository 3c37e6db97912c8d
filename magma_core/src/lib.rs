//! Shared leaf types for the Magma AOT runtime.
//!
//! This crate carries the pieces that both the compiler driver and the
//! JIT code manager need to agree on:
//! - Variable-length integer codec used by method metadata streams
//! - Exception-handling clause model and its wire codec
//! - Type-reference handles used by generic instantiation unification
#![deny(unsafe_op_in_unsafe_fn)]

pub mod eh;
pub mod typeref;
pub mod varint;

pub use eh::{EhClause, EhClauseKind, EhInfoBlob, EhInfoBuilder};
pub use typeref::TypeRef;
