//! Type-reference handles.
//!
//! Generic-instantiation unification compares type arguments by
//! identity first and by a caller-supplied structural predicate
//! second. A `TypeRef` is the identity half: an opaque address-sized
//! handle to a runtime type description owned by some module.

use std::fmt;

/// Opaque handle to a runtime type description.
///
/// Identity comparison (`==`) means "same type description object".
/// Two distinct handles may still describe equivalent types; that
/// decision belongs to the structural predicate, not to this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(usize);

impl TypeRef {
    /// Sentinel standing for "any instantiation" in canonical method
    /// bodies. It unifies only with itself, never with a concrete type.
    pub const UNIVERSAL_CANONICAL: TypeRef = TypeRef(usize::MAX);

    /// Wrap a raw type-description address.
    #[inline]
    pub fn from_raw(addr: usize) -> Self {
        TypeRef(addr)
    }

    /// Wrap a pointer to a type description.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        TypeRef(ptr as usize)
    }

    /// The raw address value.
    #[inline]
    pub fn as_raw(self) -> usize {
        self.0
    }

    /// Whether this is the universal-canonical sentinel.
    #[inline]
    pub fn is_universal_canonical(self) -> bool {
        self == Self::UNIVERSAL_CANONICAL
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal_canonical() {
            write!(f, "TypeRef(<universal canonical>)")
        } else {
            write!(f, "TypeRef({:#x})", self.0)
        }
    }
}
