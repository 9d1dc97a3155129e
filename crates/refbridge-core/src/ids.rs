//! Typed handles into the host tables.
//!
//! All handles are generational and pack into a `u64`; the packed value `0`
//! is the null handle, which is what zero-initialized host memory holds.

use crate::arena_id;

arena_id!(
    /// Handle to a registered class, struct, or interface.
    ClassId
);

arena_id!(
    /// Handle to a registered host function.
    FunctionId
);

arena_id!(
    /// Handle to a live host object.
    ObjectHandle
);

arena_id!(
    /// Handle to a block of host memory.
    RegionId
);

arena_id!(
    /// Handle to a heap string owned by a string or text slot.
    StrId
);

arena_id!(
    /// Handle to array, set, or map storage.
    ContainerId
);

arena_id!(
    /// Handle to a multicast delegate invocation list.
    MulticastId
);

/// Interned name. `NameId(0)` is the empty name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

impl NameId {
    /// The empty name.
    pub const NONE: NameId = NameId(0);

    /// Check if this is the empty name.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}
