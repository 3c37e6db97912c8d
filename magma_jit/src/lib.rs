//! JIT code management for the runtime.
//!
//! Compiled code lives in executable heaps placed within PC-relative
//! reach of the runtime helpers, each heap owned by a
//! [`JitCodeManager`] that answers the runtime's per-PC questions:
//!
//! - method lookup via a sorted, OS-registered function table
//! - GC-root and EH-clause enumeration for stack walks
//! - virtual unwind and hardware-fault remapping
//!
//! The [`CodeManagerRegistry`] ties instances together: a full heap is
//! retired from allocation but serves lookups forever. Generic
//! instantiations published by multiple modules are deduplicated by
//! the [`GenericUnificationTable`].

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod header;
pub mod heap;
pub mod manager;
pub mod table;
pub mod unify;

pub use config::{AbortTracking, JitOptions};
pub use error::{CodeManagerError, UnifyError};
pub use header::{CodeHeader, HEADER_SIZE};
pub use heap::ExecutableCodeHeap;
pub use manager::{
    init_registry, registry, CodeAllocation, CodeManagerRegistry, EhEnumState, GcInfoDecoder,
    JitCodeManager, MethodInfo, RegDisplay,
};
pub use table::{FunctionEntry, FunctionTableIndex, LookupResult};
pub use unify::{
    CellArray, CellRange, GenericUnificationDesc, GenericUnificationTable, StaticsRegistrar,
    ThreadStatics, TypeEquivalence, UnifyOutcome,
};
