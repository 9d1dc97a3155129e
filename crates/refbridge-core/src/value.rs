//! Typed value operations over host memory.
//!
//! Every operation here works on a value of a known [`PropertyType`] at a
//! [`HostAddr`]:
//!
//! - **destroy** releases out-of-line storage and leaves zeroed bytes
//! - **copy** deep-copies, so source and destination own separate storage
//! - **move** is a shallow bitwise copy that zeroes the source, handing
//!   ownership of any out-of-line storage to the destination
//!
//! Container storage and multicast invocation lists are also managed here.

use crate::host::align_up;
use crate::memory::{ContainerData, ContainerLayout};
use crate::{
    ClassId, ContainerId, DelegateValue, Host, HostAddr, HostError, MulticastId, NameId,
    ObjectHandle, PropertyType, StrId,
};

impl Host {
    // =========================================================================
    // Layout
    // =========================================================================

    /// Byte size of a value.
    pub fn size_of(&self, ty: &PropertyType) -> Result<u32, HostError> {
        Ok(match ty {
            PropertyType::Int(kind) => kind.size(),
            PropertyType::Enum { underlying, .. } => underlying.size(),
            PropertyType::Float(kind) => kind.size(),
            PropertyType::Bool => 1,
            PropertyType::Struct { class } => self.try_class(*class)?.size,
            PropertyType::Delegate { .. } => DelegateValue::SIZE,
            _ => 8,
        })
    }

    /// Alignment of a value.
    pub fn align_of(&self, ty: &PropertyType) -> Result<u32, HostError> {
        Ok(match ty {
            PropertyType::Struct { class } => self.try_class(*class)?.align,
            PropertyType::Int(_) | PropertyType::Enum { .. } | PropertyType::Float(_) | PropertyType::Bool => {
                self.size_of(ty)?
            }
            _ => 8,
        })
    }

    /// Whether a value owns storage that [`Host::destroy_value`] must release.
    pub fn needs_destroy(&self, ty: &PropertyType) -> bool {
        match ty {
            PropertyType::Struct { class } => self
                .all_properties(*class)
                .iter()
                .any(|p| self.needs_destroy(&p.ty)),
            other => other.owns_storage(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release a value's out-of-line storage and zero its bytes.
    pub fn destroy_value(&mut self, ty: &PropertyType, addr: HostAddr) -> Result<(), HostError> {
        match ty {
            PropertyType::Str | PropertyType::Text => {
                let id = StrId::from_bits(self.memory().read_u64(addr)?);
                self.memory_mut().strings.remove(id);
            }
            PropertyType::Array(_) | PropertyType::Set(_) | PropertyType::Map(_, _) => {
                let id = ContainerId::from_bits(self.memory().read_u64(addr)?);
                self.free_container(id)?;
            }
            PropertyType::MulticastDelegate { .. } => {
                let id = MulticastId::from_bits(self.memory().read_u64(addr)?);
                self.memory_mut().multicasts.remove(id);
            }
            PropertyType::Struct { class } => {
                for prop in self.all_properties(*class) {
                    if self.needs_destroy(&prop.ty) {
                        self.destroy_value(&prop.ty, addr.at(prop.offset))?;
                    }
                }
            }
            _ => {}
        }
        let size = self.size_of(ty)?;
        self.memory_mut().zero(addr, size)
    }

    /// Deep-copy a value from `src` to `dst`, destroying what `dst` held.
    pub fn copy_value(&mut self, ty: &PropertyType, src: HostAddr, dst: HostAddr) -> Result<(), HostError> {
        if src == dst {
            return Ok(());
        }
        match ty {
            PropertyType::Str | PropertyType::Text => {
                let text = self.read_string(src)?;
                self.write_string(dst, &text)
            }
            PropertyType::Array(_) | PropertyType::Set(_) | PropertyType::Map(_, _) => {
                let source = ContainerId::from_bits(self.memory().read_u64(src)?);
                let copy = self.clone_container(source)?;
                self.destroy_value(ty, dst)?;
                self.memory_mut().write_u64(dst, copy.to_bits())
            }
            PropertyType::MulticastDelegate { .. } => {
                let list = self.multicast_list(src)?;
                self.destroy_value(ty, dst)?;
                if list.is_empty() {
                    return Ok(());
                }
                let id = self.memory_mut().multicasts.insert(list);
                self.memory_mut().write_u64(dst, id.to_bits())
            }
            PropertyType::Struct { class } => {
                let props = self.all_properties(*class);
                for prop in props {
                    self.copy_value(&prop.ty, src.at(prop.offset), dst.at(prop.offset))?;
                }
                Ok(())
            }
            _ => {
                let size = self.size_of(ty)?;
                self.memory_mut().copy(src, dst, size)
            }
        }
    }

    /// Move a value from `src` to `dst` with a bitwise copy, zeroing `src`.
    pub fn move_value(&mut self, ty: &PropertyType, src: HostAddr, dst: HostAddr) -> Result<(), HostError> {
        if src == dst {
            return Ok(());
        }
        self.destroy_value(ty, dst)?;
        let size = self.size_of(ty)?;
        self.memory_mut().copy(src, dst, size)?;
        self.memory_mut().zero(src, size)
    }

    // =========================================================================
    // Strings and names
    // =========================================================================

    /// Read a string or text slot. An empty or freed slot reads as "".
    pub fn read_string(&self, addr: HostAddr) -> Result<String, HostError> {
        let id = StrId::from_bits(self.memory().read_u64(addr)?);
        Ok(self.memory().strings.get(id).cloned().unwrap_or_default())
    }

    /// Replace the contents of a string or text slot.
    pub fn write_string(&mut self, addr: HostAddr, text: &str) -> Result<(), HostError> {
        let old = StrId::from_bits(self.memory().read_u64(addr)?);
        self.memory_mut().strings.remove(old);
        let bits = if text.is_empty() {
            0
        } else {
            self.memory_mut().strings.insert(text.to_string()).to_bits()
        };
        self.memory_mut().write_u64(addr, bits)
    }

    /// Read a name slot.
    pub fn read_name(&self, addr: HostAddr) -> Result<NameId, HostError> {
        Ok(NameId(self.memory().read_u64(addr)? as u32))
    }

    /// Write a name slot.
    pub fn write_name(&mut self, addr: HostAddr, name: NameId) -> Result<(), HostError> {
        self.memory_mut().write_u64(addr, name.0 as u64)
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Read an object slot. A destroyed referent reads as null.
    pub fn read_object(&self, addr: HostAddr) -> Result<ObjectHandle, HostError> {
        let handle = ObjectHandle::from_bits(self.memory().read_u64(addr)?);
        Ok(if self.is_valid(handle) {
            handle
        } else {
            ObjectHandle::NULL
        })
    }

    /// Write an object slot.
    pub fn write_object(&mut self, addr: HostAddr, handle: ObjectHandle) -> Result<(), HostError> {
        self.memory_mut().write_u64(addr, handle.to_bits())
    }

    /// Read a class reference slot. An unregistered class reads as null.
    pub fn read_class_ref(&self, addr: HostAddr) -> Result<ClassId, HostError> {
        let class = ClassId::from_bits(self.memory().read_u64(addr)?);
        Ok(if self.is_class_live(class) {
            class
        } else {
            ClassId::NULL
        })
    }

    /// Write a class reference slot.
    pub fn write_class_ref(&mut self, addr: HostAddr, class: ClassId) -> Result<(), HostError> {
        self.memory_mut().write_u64(addr, class.to_bits())
    }

    /// Read a single-cast delegate slot.
    pub fn read_delegate(&self, addr: HostAddr) -> Result<DelegateValue, HostError> {
        Ok(DelegateValue {
            object: ObjectHandle::from_bits(self.memory().read_u64(addr)?),
            function: NameId(self.memory().read_u64(addr.at(8))? as u32),
        })
    }

    /// Write a single-cast delegate slot.
    pub fn write_delegate(&mut self, addr: HostAddr, value: DelegateValue) -> Result<(), HostError> {
        self.memory_mut().write_u64(addr, value.object.to_bits())?;
        self.memory_mut().write_u64(addr.at(8), value.function.0 as u64)
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Compute entry layout for an array, set, or map type.
    pub fn container_layout(&self, ty: &PropertyType) -> Result<ContainerLayout, HostError> {
        match ty {
            PropertyType::Array(inner) | PropertyType::Set(inner) => {
                let size = self.size_of(inner)?;
                let align = self.align_of(inner)?;
                Ok(ContainerLayout {
                    ty: ty.clone(),
                    element: (**inner).clone(),
                    value: None,
                    stride: align_up(size, align).max(1),
                    value_offset: 0,
                })
            }
            PropertyType::Map(key, value) => {
                let key_size = self.size_of(key)?;
                let key_align = self.align_of(key)?;
                let value_size = self.size_of(value)?;
                let value_align = self.align_of(value)?;
                let value_offset = align_up(key_size, value_align);
                Ok(ContainerLayout {
                    ty: ty.clone(),
                    element: (**key).clone(),
                    value: Some((**value).clone()),
                    stride: align_up(value_offset + value_size, key_align.max(value_align)).max(1),
                    value_offset,
                })
            }
            other => Err(HostError::StorageMismatch {
                expected: "container",
                found: other.kind_name().to_string(),
            }),
        }
    }

    /// The container stored at `addr`, or null if the slot is empty.
    pub fn container_at(&self, addr: HostAddr) -> Result<ContainerId, HostError> {
        let id = ContainerId::from_bits(self.memory().read_u64(addr)?);
        Ok(if self.memory().containers.contains(id) {
            id
        } else {
            ContainerId::NULL
        })
    }

    /// The container stored at `addr`, creating empty storage if the slot is empty.
    pub fn container_ensure(&mut self, addr: HostAddr, ty: &PropertyType) -> Result<ContainerId, HostError> {
        let existing = self.container_at(addr)?;
        if !existing.is_null() {
            return Ok(existing);
        }
        let layout = self.container_layout(ty)?;
        let region = self.memory_mut().alloc(0);
        let id = self.memory_mut().containers.insert(ContainerData {
            region,
            len: 0,
            layout,
        });
        self.memory_mut().write_u64(addr, id.to_bits())?;
        Ok(id)
    }

    fn container_data(&self, id: ContainerId) -> Result<&ContainerData, HostError> {
        self.memory().containers.get(id).ok_or(HostError::StorageMismatch {
            expected: "live container",
            found: format!("{id:?}"),
        })
    }

    /// Entry layout of a live container.
    pub fn container_layout_of(&self, id: ContainerId) -> Result<&ContainerLayout, HostError> {
        Ok(&self.container_data(id)?.layout)
    }

    /// Number of entries. An empty slot has none.
    pub fn container_len(&self, id: ContainerId) -> Result<u32, HostError> {
        if id.is_null() {
            return Ok(0);
        }
        Ok(self.container_data(id)?.len)
    }

    /// Address of entry `index` (the key, for maps).
    pub fn container_element_addr(&self, id: ContainerId, index: u32) -> Result<HostAddr, HostError> {
        let data = self.container_data(id)?;
        if index >= data.len {
            return Err(HostError::OutOfBounds {
                region: data.region,
                offset: index * data.layout.stride,
                len: data.layout.stride,
                size: data.len * data.layout.stride,
            });
        }
        Ok(HostAddr::new(data.region, index * data.layout.stride))
    }

    /// Address of the value of map entry `index`.
    pub fn container_value_addr(&self, id: ContainerId, index: u32) -> Result<HostAddr, HostError> {
        let offset = self.container_data(id)?.layout.value_offset;
        Ok(self.container_element_addr(id, index)?.at(offset))
    }

    /// Append a zeroed entry and return its address.
    pub fn container_push(&mut self, id: ContainerId) -> Result<HostAddr, HostError> {
        let (region, len, stride) = {
            let data = self.container_data(id)?;
            (data.region, data.len, data.layout.stride)
        };
        self.memory_mut().resize(region, (len + 1) * stride)?;
        if let Some(data) = self.memory_mut().containers.get_mut(id) {
            data.len = len + 1;
        }
        Ok(HostAddr::new(region, len * stride))
    }

    /// Remove entry `index`, shifting later entries down.
    pub fn container_remove(&mut self, id: ContainerId, index: u32) -> Result<(), HostError> {
        let addr = self.container_element_addr(id, index)?;
        let (region, len, layout) = {
            let data = self.container_data(id)?;
            (data.region, data.len, data.layout.clone())
        };
        self.destroy_entry(&layout, addr)?;
        let stride = layout.stride;
        let tail = (len - index - 1) * stride;
        if tail > 0 {
            self.memory_mut().copy(addr.at(stride), addr, tail)?;
        }
        self.memory_mut().resize(region, (len - 1) * stride)?;
        if let Some(data) = self.memory_mut().containers.get_mut(id) {
            data.len = len - 1;
        }
        Ok(())
    }

    /// Destroy every entry, leaving the container empty.
    pub fn container_clear(&mut self, id: ContainerId) -> Result<(), HostError> {
        if id.is_null() {
            return Ok(());
        }
        let (region, len, layout) = {
            let data = self.container_data(id)?;
            (data.region, data.len, data.layout.clone())
        };
        for index in 0..len {
            self.destroy_entry(&layout, HostAddr::new(region, index * layout.stride))?;
        }
        self.memory_mut().resize(region, 0)?;
        if let Some(data) = self.memory_mut().containers.get_mut(id) {
            data.len = 0;
        }
        Ok(())
    }

    fn destroy_entry(&mut self, layout: &ContainerLayout, addr: HostAddr) -> Result<(), HostError> {
        self.destroy_value(&layout.element, addr)?;
        if let Some(value) = &layout.value {
            self.destroy_value(value, addr.at(layout.value_offset))?;
        }
        Ok(())
    }

    fn free_container(&mut self, id: ContainerId) -> Result<(), HostError> {
        if !self.memory().containers.contains(id) {
            return Ok(());
        }
        self.container_clear(id)?;
        if let Some(data) = self.memory_mut().containers.remove(id) {
            self.memory_mut().free(data.region);
        }
        Ok(())
    }

    fn clone_container(&mut self, source: ContainerId) -> Result<ContainerId, HostError> {
        let Some(data) = self.memory().containers.get(source) else {
            return Ok(ContainerId::NULL);
        };
        let (src_region, len, layout) = (data.region, data.len, data.layout.clone());
        let region = self.memory_mut().alloc(len * layout.stride);
        for index in 0..len {
            let src = HostAddr::new(src_region, index * layout.stride);
            let dst = HostAddr::new(region, index * layout.stride);
            self.copy_value(&layout.element, src, dst)?;
            if let Some(value) = &layout.value {
                self.copy_value(value, src.at(layout.value_offset), dst.at(layout.value_offset))?;
            }
        }
        Ok(self.memory_mut().containers.insert(ContainerData { region, len, layout }))
    }

    // =========================================================================
    // Multicast delegates
    // =========================================================================

    /// Snapshot of a multicast invocation list.
    pub fn multicast_list(&self, addr: HostAddr) -> Result<Vec<DelegateValue>, HostError> {
        let id = MulticastId::from_bits(self.memory().read_u64(addr)?);
        Ok(self.memory().multicasts.get(id).cloned().unwrap_or_default())
    }

    /// Identity of a multicast slot's invocation list, or null if it has none.
    pub fn multicast_id(&self, addr: HostAddr) -> Result<MulticastId, HostError> {
        let id = MulticastId::from_bits(self.memory().read_u64(addr)?);
        Ok(if self.memory().multicasts.contains(id) {
            id
        } else {
            MulticastId::NULL
        })
    }

    /// Add an entry. Returns false if it was already present.
    pub fn multicast_add(&mut self, addr: HostAddr, value: DelegateValue) -> Result<bool, HostError> {
        let id = self.multicast_id(addr)?;
        if id.is_null() {
            let id = self.memory_mut().multicasts.insert(vec![value]);
            self.memory_mut().write_u64(addr, id.to_bits())?;
            return Ok(true);
        }
        let Some(list) = self.memory_mut().multicasts.get_mut(id) else {
            return Ok(false);
        };
        if list.contains(&value) {
            return Ok(false);
        }
        list.push(value);
        Ok(true)
    }

    /// Remove an entry. Returns false if it was not present.
    pub fn multicast_remove(&mut self, addr: HostAddr, value: DelegateValue) -> Result<bool, HostError> {
        let id = self.multicast_id(addr)?;
        let Some(list) = self.memory_mut().multicasts.get_mut(id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|entry| *entry != value);
        Ok(list.len() != before)
    }

    /// Remove every entry, returning what was bound.
    pub fn multicast_clear(&mut self, addr: HostAddr) -> Result<Vec<DelegateValue>, HostError> {
        let id = self.multicast_id(addr)?;
        Ok(self
            .memory_mut()
            .multicasts
            .get_mut(id)
            .map(std::mem::take)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassDef, IntKind};

    fn scratch(host: &mut Host, size: u32) -> HostAddr {
        HostAddr::base(host.memory_mut().alloc(size))
    }

    #[test]
    fn string_copy_is_deep() {
        let mut host = Host::new();
        let a = scratch(&mut host, 8);
        let b = scratch(&mut host, 8);
        host.write_string(a, "left").unwrap();
        host.copy_value(&PropertyType::Str, a, b).unwrap();
        host.write_string(a, "changed").unwrap();
        assert_eq!(host.read_string(b).unwrap(), "left");
        assert_eq!(host.memory().string_count(), 2);

        host.destroy_value(&PropertyType::Str, a).unwrap();
        host.destroy_value(&PropertyType::Str, b).unwrap();
        assert_eq!(host.memory().string_count(), 0);
    }

    #[test]
    fn move_transfers_ownership() {
        let mut host = Host::new();
        let a = scratch(&mut host, 8);
        let b = scratch(&mut host, 8);
        host.write_string(a, "owned").unwrap();
        host.move_value(&PropertyType::Str, a, b).unwrap();
        assert_eq!(host.read_string(a).unwrap(), "");
        assert_eq!(host.read_string(b).unwrap(), "owned");
        assert_eq!(host.memory().string_count(), 1);
    }

    #[test]
    fn array_push_and_remove() {
        let mut host = Host::new();
        let ty = PropertyType::array(PropertyType::Int(IntKind::I32));
        let slot = scratch(&mut host, 8);
        let id = host.container_ensure(slot, &ty).unwrap();
        for value in [10, 20, 30] {
            let addr = host.container_push(id).unwrap();
            host.memory_mut().write_int(addr, IntKind::I32, value).unwrap();
        }
        host.container_remove(id, 1).unwrap();
        assert_eq!(host.container_len(id).unwrap(), 2);
        let second = host.container_element_addr(id, 1).unwrap();
        assert_eq!(host.memory().read_int(second, IntKind::I32).unwrap(), 30);
        assert!(host.container_element_addr(id, 2).is_err());
    }

    #[test]
    fn container_copy_and_destroy() {
        let mut host = Host::new();
        let ty = PropertyType::array(PropertyType::Str);
        let a = scratch(&mut host, 8);
        let b = scratch(&mut host, 8);
        let id = host.container_ensure(a, &ty).unwrap();
        let elem = host.container_push(id).unwrap();
        host.write_string(elem, "x").unwrap();

        host.copy_value(&ty, a, b).unwrap();
        let copy = host.container_at(b).unwrap();
        assert_ne!(copy, id);
        assert_eq!(host.container_len(copy).unwrap(), 1);
        assert_eq!(host.memory().string_count(), 2);

        host.destroy_value(&ty, a).unwrap();
        host.destroy_value(&ty, b).unwrap();
        assert_eq!(host.memory().string_count(), 0);
        assert_eq!(host.memory().container_count(), 0);
    }

    #[test]
    fn map_layout_places_value_after_key() {
        let host = Host::new();
        let layout = host
            .container_layout(&PropertyType::map(PropertyType::Bool, PropertyType::Int(IntKind::I64)))
            .unwrap();
        assert_eq!(layout.value_offset, 8);
        assert_eq!(layout.stride, 16);
    }

    #[test]
    fn struct_copy_recurses_into_fields() {
        let mut host = Host::new();
        let class = host
            .register_class(
                ClassDef::structure("Tagged")
                    .with_property("Id", PropertyType::int32())
                    .with_property("Tag", PropertyType::Str),
            )
            .unwrap();
        let ty = PropertyType::Struct { class };
        assert!(host.needs_destroy(&ty));
        let a = scratch(&mut host, 16);
        let b = scratch(&mut host, 16);
        host.memory_mut().write_int(a, IntKind::I32, 7).unwrap();
        host.write_string(a.at(8), "tag").unwrap();

        host.copy_value(&ty, a, b).unwrap();
        assert_eq!(host.memory().read_int(b, IntKind::I32).unwrap(), 7);
        assert_eq!(host.read_string(b.at(8)).unwrap(), "tag");
        assert_eq!(host.memory().string_count(), 2);
    }

    #[test]
    fn destroyed_object_reads_null() {
        let mut host = Host::new();
        let class = host.register_class(ClassDef::class("Target")).unwrap();
        let obj = host.new_object(class, "t").unwrap();
        let slot = scratch(&mut host, 8);
        host.write_object(slot, obj).unwrap();
        assert_eq!(host.read_object(slot).unwrap(), obj);
        host.destroy_object(obj).unwrap();
        assert!(host.read_object(slot).unwrap().is_null());
    }

    #[test]
    fn multicast_list_operations() {
        let mut host = Host::new();
        let class = host.register_class(ClassDef::class("Listener")).unwrap();
        let obj = host.new_object(class, "l").unwrap();
        let name = host.memory_mut().intern("OnFire");
        let slot = scratch(&mut host, 8);
        let entry = DelegateValue::new(obj, name);

        assert!(host.multicast_add(slot, entry).unwrap());
        assert!(!host.multicast_add(slot, entry).unwrap());
        assert_eq!(host.multicast_list(slot).unwrap(), vec![entry]);
        assert_eq!(host.multicast_clear(slot).unwrap(), vec![entry]);
        assert!(host.multicast_list(slot).unwrap().is_empty());
        assert!(!host.multicast_remove(slot, entry).unwrap());
    }
}
