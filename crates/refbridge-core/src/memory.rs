//! Raw host memory.
//!
//! Host memory is a set of byte regions. Everything addressable (object
//! instances, parameter blocks, container storage, boxed script copies) lives
//! in a region and is reached through a [`HostAddr`]. Growing a region never
//! moves an address, since addresses are (region, offset) pairs rather than
//! pointers.
//!
//! Values whose storage is out of line (strings, containers, invocation
//! lists) keep a packed handle in their slot; the side tables for those live
//! here as well.

use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::{
    ContainerId, FloatKind, HostError, IntKind, MulticastId, NameId, ObjectHandle, PropertyType,
    RegionId, StrId,
};

/// An address in host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddr {
    /// Region holding the value.
    pub region: RegionId,
    /// Byte offset inside the region.
    pub offset: u32,
}

impl HostAddr {
    /// Create an address.
    pub const fn new(region: RegionId, offset: u32) -> Self {
        Self { region, offset }
    }

    /// The start of a region.
    pub const fn base(region: RegionId) -> Self {
        Self { region, offset: 0 }
    }

    /// Offset this address by `delta` bytes.
    #[inline]
    pub const fn at(self, delta: u32) -> Self {
        Self {
            region: self.region,
            offset: self.offset + delta,
        }
    }
}

/// A single-cast delegate value: a target object and a function name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DelegateValue {
    /// Object the function is invoked on.
    pub object: ObjectHandle,
    /// Function name resolved on the object's class at call time.
    pub function: NameId,
}

impl DelegateValue {
    /// Size of a delegate slot.
    pub const SIZE: u32 = 16;

    /// Create a bound delegate value.
    pub const fn new(object: ObjectHandle, function: NameId) -> Self {
        Self { object, function }
    }

    /// Whether a target has been set.
    pub fn is_bound(&self) -> bool {
        !self.object.is_null() && !self.function.is_none()
    }
}

/// Layout of container storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLayout {
    /// Full container type.
    pub ty: PropertyType,
    /// Element type, or key type for maps.
    pub element: PropertyType,
    /// Value type for maps.
    pub value: Option<PropertyType>,
    /// Byte distance between entries.
    pub stride: u32,
    /// Offset of the value inside a map entry.
    pub value_offset: u32,
}

#[derive(Debug)]
pub(crate) struct ContainerData {
    pub(crate) region: RegionId,
    pub(crate) len: u32,
    pub(crate) layout: ContainerLayout,
}

/// Interned names. Index 0 is the empty name.
#[derive(Debug)]
pub(crate) struct NameTable {
    ids: FxHashMap<String, NameId>,
    names: Vec<String>,
}

impl NameTable {
    fn new() -> Self {
        Self {
            ids: FxHashMap::default(),
            names: vec![String::new()],
        }
    }

    pub(crate) fn intern(&mut self, name: &str) -> NameId {
        if name.is_empty() {
            return NameId::NONE;
        }
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub(crate) fn find(&self, name: &str) -> Option<NameId> {
        if name.is_empty() {
            return Some(NameId::NONE);
        }
        self.ids.get(name).copied()
    }

    pub(crate) fn resolve(&self, id: NameId) -> &str {
        self.names.get(id.0 as usize).map(String::as_str).unwrap_or("")
    }
}

/// Byte regions plus the side tables for out-of-line values.
#[derive(Debug)]
pub struct Memory {
    regions: Arena<RegionId, Vec<u8>>,
    pub(crate) strings: Arena<StrId, String>,
    pub(crate) containers: Arena<ContainerId, ContainerData>,
    pub(crate) multicasts: Arena<MulticastId, Vec<DelegateValue>>,
    pub(crate) names: NameTable,
}

impl Memory {
    /// Create empty memory.
    pub fn new() -> Self {
        Self {
            regions: Arena::new(),
            strings: Arena::new(),
            containers: Arena::new(),
            multicasts: Arena::new(),
            names: NameTable::new(),
        }
    }

    // === Regions ===

    /// Allocate a zero-filled region.
    pub fn alloc(&mut self, size: u32) -> RegionId {
        self.regions.insert(vec![0; size as usize])
    }

    /// Free a region. Returns false if it was already freed.
    pub fn free(&mut self, region: RegionId) -> bool {
        self.regions.remove(region).is_some()
    }

    /// Whether a region is still allocated.
    pub fn is_live(&self, region: RegionId) -> bool {
        self.regions.contains(region)
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Size of a region in bytes.
    pub fn region_size(&self, region: RegionId) -> Result<u32, HostError> {
        self.regions
            .get(region)
            .map(|r| r.len() as u32)
            .ok_or(HostError::StaleRegion(region))
    }

    /// Grow or shrink a region, zero-filling new bytes.
    pub fn resize(&mut self, region: RegionId, size: u32) -> Result<(), HostError> {
        let bytes = self
            .regions
            .get_mut(region)
            .ok_or(HostError::StaleRegion(region))?;
        bytes.resize(size as usize, 0);
        Ok(())
    }

    /// Borrow `len` bytes at `addr`.
    pub fn bytes(&self, addr: HostAddr, len: u32) -> Result<&[u8], HostError> {
        let bytes = self
            .regions
            .get(addr.region)
            .ok_or(HostError::StaleRegion(addr.region))?;
        let start = addr.offset as usize;
        let end = start + len as usize;
        bytes.get(start..end).ok_or(HostError::OutOfBounds {
            region: addr.region,
            offset: addr.offset,
            len,
            size: bytes.len() as u32,
        })
    }

    /// Mutably borrow `len` bytes at `addr`.
    pub fn bytes_mut(&mut self, addr: HostAddr, len: u32) -> Result<&mut [u8], HostError> {
        let bytes = self
            .regions
            .get_mut(addr.region)
            .ok_or(HostError::StaleRegion(addr.region))?;
        let size = bytes.len() as u32;
        let start = addr.offset as usize;
        let end = start + len as usize;
        bytes.get_mut(start..end).ok_or(HostError::OutOfBounds {
            region: addr.region,
            offset: addr.offset,
            len,
            size,
        })
    }

    /// Zero `len` bytes at `addr`.
    pub fn zero(&mut self, addr: HostAddr, len: u32) -> Result<(), HostError> {
        self.bytes_mut(addr, len)?.fill(0);
        Ok(())
    }

    /// Bitwise copy `len` bytes. The ranges may overlap or share a region.
    pub fn copy(&mut self, src: HostAddr, dst: HostAddr, len: u32) -> Result<(), HostError> {
        if src == dst {
            return Ok(());
        }
        let tmp = self.bytes(src, len)?.to_vec();
        self.bytes_mut(dst, len)?.copy_from_slice(&tmp);
        Ok(())
    }

    // === Scalars ===

    /// Read a little-endian `u64`.
    pub fn read_u64(&self, addr: HostAddr) -> Result<u64, HostError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(addr, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&mut self, addr: HostAddr, value: u64) -> Result<(), HostError> {
        self.bytes_mut(addr, 8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read an integer of the given kind, widened to `i64`.
    ///
    /// Unsigned 64-bit values above `i64::MAX` wrap.
    pub fn read_int(&self, addr: HostAddr, kind: IntKind) -> Result<i64, HostError> {
        let bytes = self.bytes(addr, kind.size())?;
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let raw = u64::from_le_bytes(buf);
        Ok(match kind {
            IntKind::I8 => raw as u8 as i8 as i64,
            IntKind::I16 => raw as u16 as i16 as i64,
            IntKind::I32 => raw as u32 as i32 as i64,
            IntKind::I64 | IntKind::U64 => raw as i64,
            IntKind::U8 | IntKind::U16 | IntKind::U32 => raw as i64,
        })
    }

    /// Write an integer, truncating to the kind's width.
    pub fn write_int(&mut self, addr: HostAddr, kind: IntKind, value: i64) -> Result<(), HostError> {
        let size = kind.size() as usize;
        let le = value.to_le_bytes();
        self.bytes_mut(addr, kind.size())?
            .copy_from_slice(&le[..size]);
        Ok(())
    }

    /// Read a float of the given kind, widened to `f64`.
    pub fn read_float(&self, addr: HostAddr, kind: FloatKind) -> Result<f64, HostError> {
        Ok(match kind {
            FloatKind::F32 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(self.bytes(addr, 4)?);
                f32::from_le_bytes(buf) as f64
            }
            FloatKind::F64 => f64::from_bits(self.read_u64(addr)?),
        })
    }

    /// Write a float, narrowing to the kind's width.
    pub fn write_float(&mut self, addr: HostAddr, kind: FloatKind, value: f64) -> Result<(), HostError> {
        match kind {
            FloatKind::F32 => self
                .bytes_mut(addr, 4)?
                .copy_from_slice(&(value as f32).to_le_bytes()),
            FloatKind::F64 => self.write_u64(addr, value.to_bits())?,
        }
        Ok(())
    }

    /// Read a bool.
    pub fn read_bool(&self, addr: HostAddr) -> Result<bool, HostError> {
        Ok(self.bytes(addr, 1)?[0] != 0)
    }

    /// Write a bool.
    pub fn write_bool(&mut self, addr: HostAddr, value: bool) -> Result<(), HostError> {
        self.bytes_mut(addr, 1)?[0] = value as u8;
        Ok(())
    }

    // === Names ===

    /// Intern a name.
    pub fn intern(&mut self, name: &str) -> NameId {
        self.names.intern(name)
    }

    /// Look up an already interned name.
    pub fn find_name(&self, name: &str) -> Option<NameId> {
        self.names.find(name)
    }

    /// Resolve an interned name. Unknown ids resolve to the empty name.
    pub fn name(&self, id: NameId) -> &str {
        self.names.resolve(id)
    }

    // === Strings ===

    /// Number of live heap strings.
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Number of live containers.
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_start_zeroed() {
        let mut mem = Memory::new();
        let region = mem.alloc(16);
        assert_eq!(mem.bytes(HostAddr::base(region), 16).unwrap(), &[0u8; 16]);
    }

    #[test]
    fn int_widths_sign_extend() {
        let mut mem = Memory::new();
        let addr = HostAddr::base(mem.alloc(8));
        mem.write_int(addr, IntKind::I8, -3).unwrap();
        assert_eq!(mem.read_int(addr, IntKind::I8).unwrap(), -3);
        assert_eq!(mem.read_int(addr, IntKind::U8).unwrap(), 253);

        mem.write_int(addr, IntKind::U32, u32::MAX as i64).unwrap();
        assert_eq!(mem.read_int(addr, IntKind::U32).unwrap(), u32::MAX as i64);
        assert_eq!(mem.read_int(addr, IntKind::I32).unwrap(), -1);
    }

    #[test]
    fn floats_narrow() {
        let mut mem = Memory::new();
        let addr = HostAddr::base(mem.alloc(8));
        mem.write_float(addr, FloatKind::F32, 1.5).unwrap();
        assert_eq!(mem.read_float(addr, FloatKind::F32).unwrap(), 1.5);
        mem.write_float(addr, FloatKind::F64, 0.1).unwrap();
        assert_eq!(mem.read_float(addr, FloatKind::F64).unwrap(), 0.1);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let mut mem = Memory::new();
        let region = mem.alloc(4);
        let err = mem.read_u64(HostAddr::base(region)).unwrap_err();
        assert!(matches!(err, HostError::OutOfBounds { len: 8, size: 4, .. }));
    }

    #[test]
    fn freed_region_is_stale() {
        let mut mem = Memory::new();
        let region = mem.alloc(4);
        assert!(mem.free(region));
        assert!(!mem.free(region));
        assert_eq!(mem.region_size(region), Err(HostError::StaleRegion(region)));
    }

    #[test]
    fn copy_within_region() {
        let mut mem = Memory::new();
        let region = mem.alloc(8);
        mem.write_int(HostAddr::base(region), IntKind::I32, 42).unwrap();
        mem.copy(HostAddr::base(region), HostAddr::new(region, 4), 4).unwrap();
        assert_eq!(mem.read_int(HostAddr::new(region, 4), IntKind::I32).unwrap(), 42);
    }

    #[test]
    fn names_intern_once() {
        let mut mem = Memory::new();
        let a = mem.intern("Fire");
        let b = mem.intern("Fire");
        assert_eq!(a, b);
        assert_eq!(mem.name(a), "Fire");
        assert_eq!(mem.intern(""), NameId::NONE);
        assert_eq!(mem.find_name("Missing"), None);
    }
}
