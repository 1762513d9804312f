use crate::page::SupplementalPageTable;
use crate::pagedir::PageDirHandle;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

/// Identifies one user address space (one process).
pub type AddressSpaceId = u32;

/// Registry resolving an [`AddressSpaceId`] to its supplemental page table.
///
/// Frame entries carry the owning address-space id rather than a reference
/// into the owning process; eviction and release resolve the id here. An
/// address space must stay registered until its table's teardown sweep has
/// finished, because `FrameTable::release` reaches back through this registry
/// to mark released pages invalid.
#[derive(Default)]
pub struct AspaceRegistry {
    table: Mutex<BTreeMap<AddressSpaceId, Arc<SupplementalPageTable>>>,
}

impl AspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register the supplemental page table for `id`.
    ///
    /// Panics if `id` is already registered.
    pub fn register(&self, id: AddressSpaceId, pd: PageDirHandle) -> Arc<SupplementalPageTable> {
        let spt = Arc::new(SupplementalPageTable::new(id, pd));
        let previous = self.table.lock().insert(id, Arc::clone(&spt));
        assert!(previous.is_none(), "address space {} registered twice", id);
        spt
    }

    /// The supplemental page table registered for `id`, if any.
    pub fn get(&self, id: AddressSpaceId) -> Option<Arc<SupplementalPageTable>> {
        self.table.lock().get(&id).map(Arc::clone)
    }

    /// Drop the registration for `id`.
    ///
    /// Call only after the table's teardown sweep has run.
    pub fn unregister(&self, id: AddressSpaceId) -> Option<Arc<SupplementalPageTable>> {
        self.table.lock().remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let registry = AspaceRegistry::new();
        let spt = registry.register(7, PageDirHandle::new(0x1000));
        assert_eq!(spt.owner(), 7);

        let resolved = registry.get(7).expect("registered");
        assert!(Arc::ptr_eq(&spt, &resolved));
        assert!(registry.get(8).is_none());

        registry.unregister(7);
        assert!(registry.get(7).is_none());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_double_register_panics() {
        let registry = AspaceRegistry::new();
        registry.register(3, PageDirHandle::new(0x1000));
        registry.register(3, PageDirHandle::new(0x2000));
    }
}
