//! Deterministic hash-based type identity.
//!
//! [`TypeHash`] is a 64-bit hash computed from a type name. The host
//! keys its class table by it, so a name lookup is a single map lookup and the
//! same name always lands on the same entry regardless of registration order.
//!
//! # Hash Computation
//!
//! Uses XXHash64 mixed with a type-domain constant.
//!
//! # Examples
//!
//! ```
//! use refbridge_core::TypeHash;
//!
//! let actor = TypeHash::from_name("Actor");
//! assert_eq!(actor, TypeHash::from_name("Actor"));
//! assert_ne!(actor, TypeHash::from_name("Pawn"));
//! ```

use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Domain-specific mixing constants for hash computation.
pub mod hash_constants {
    /// Domain marker for type hashes
    pub const TYPE: u64 = 0x2fac10b63a6cc57c;
}

/// A deterministic 64-bit hash identifying a type by name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeHash(pub u64);

impl TypeHash {
    /// Empty/invalid hash constant.
    pub const EMPTY: TypeHash = TypeHash(0);

    /// Create a type hash from a type name.
    #[inline]
    pub fn from_name(name: &str) -> Self {
        TypeHash(hash_constants::TYPE ^ xxh64(name.as_bytes(), 0))
    }

    /// Check if this is the empty hash.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHash({:#018x})", self.0)
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
