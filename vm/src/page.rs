use crate::aspace::AddressSpaceId;
use crate::frame::{FrameNumber, FrameTable};
use crate::pagedir::PageDirHandle;
use crate::swap::{SwapSlot, SwapStore};
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Where a resident page's authoritative copy currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    /// In physical memory, in the frame with this number
    Frame(FrameNumber),
    /// On the swap device, in the slot starting at this sector
    Swap(SwapSlot),
}

/// Per-page residency state.
///
/// `Resident` means "currently has a known, owned location" — the entry is
/// responsible for eventually releasing that frame or slot, and nothing else.
/// `Invalid` is terminal for ownership: some other path already released (or
/// is about to release) the backing resource, and the teardown sweep must not
/// touch it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Resident(PageLocation),
    Invalid,
}

/// One address space's map from virtual page to backing location.
///
/// Lookups and local updates come from the owning process; the frame table
/// also writes through here (under its own lock) when it evicts or releases
/// one of this space's frames. Entries are created lazily the first time a
/// page is marked, and live until explicit removal or teardown.
pub struct SupplementalPageTable {
    owner: AddressSpaceId,
    pd: PageDirHandle,
    pages: Mutex<BTreeMap<usize, PageState>>,
}

impl SupplementalPageTable {
    pub fn new(owner: AddressSpaceId, pd: PageDirHandle) -> Self {
        Self {
            owner,
            pd,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn owner(&self) -> AddressSpaceId {
        self.owner
    }

    pub fn page_dir(&self) -> PageDirHandle {
        self.pd
    }

    /// The recorded state of the page at `upage`, or `None` if the page has
    /// never been touched.
    ///
    /// The fault handler uses this to classify a fault: unknown pages are not
    /// this subsystem's problem, swap-resident pages need a reload, and
    /// frame-resident pages indicate a fault of some other class.
    pub fn lookup(&self, upage: usize) -> Option<PageState> {
        self.pages.lock().get(&upage).copied()
    }

    /// Record that `upage` now lives at `location`.
    ///
    /// Creates the entry if this is the first time the page is mentioned.
    /// Both the frame table's acquire path (location = frame) and its evict
    /// path (location = swap) funnel through here; each call is the single
    /// transition "this page's authoritative location is now `location`".
    pub fn mark_resident(&self, upage: usize, location: PageLocation) {
        log::trace!(
            "aspace {}: page {:#x} now at {:?}",
            self.owner,
            upage,
            location
        );
        self.pages
            .lock()
            .insert(upage, PageState::Resident(location));
    }

    /// Record that `upage` no longer owns any backing resource.
    ///
    /// Must precede any release of the page's frame or slot that bypasses
    /// [`SupplementalPageTable::destroy`], so the teardown sweep cannot
    /// release the same resource a second time. Idempotent.
    pub fn mark_invalid(&self, upage: usize) {
        self.pages.lock().insert(upage, PageState::Invalid);
    }

    /// Discard the entry for `upage` without releasing anything.
    pub fn remove(&self, upage: usize) {
        self.pages.lock().remove(&upage);
    }

    /// Number of entries currently marked resident.
    pub fn resident_count(&self) -> usize {
        self.pages
            .lock()
            .values()
            .filter(|state| matches!(state, PageState::Resident(_)))
            .count()
    }

    /// Teardown sweep: release every backing resource this table still owns,
    /// then discard all entries.
    ///
    /// Entries already marked `Invalid` are skipped. Call exactly once per
    /// address space, after no other thread can touch its mappings, and
    /// before unregistering the address space (releases reach back through
    /// the registry to mark pages invalid).
    pub fn destroy(&self, frames: &FrameTable, swap: &SwapStore) {
        // Drain first so no lock is held while calling back into the frame
        // table; the lock order is frame lock, then SPT lock.
        let drained: Vec<(usize, PageState)> = {
            let mut pages = self.pages.lock();
            core::mem::take(&mut *pages).into_iter().collect()
        };

        for (upage, state) in drained {
            match state {
                PageState::Resident(PageLocation::Frame(frame)) => frames.release(frame),
                PageState::Resident(PageLocation::Swap(slot)) => swap.free(slot),
                PageState::Invalid => {
                    log::trace!(
                        "aspace {}: skipping invalidated page {:#x}",
                        self.owner,
                        upage
                    );
                }
            }
        }

        // Each release above re-marked its page invalid through the
        // registry; drop those husk entries so the table ends empty.
        self.pages.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_lazy_creation_and_lookup() {
        let spt = SupplementalPageTable::new(1, PageDirHandle::new(0));
        assert_eq!(spt.lookup(0x1000), None);

        spt.mark_resident(0x1000, PageLocation::Frame(4));
        assert_eq!(
            spt.lookup(0x1000),
            Some(PageState::Resident(PageLocation::Frame(4)))
        );

        // Eviction overwrites the location in place.
        spt.mark_resident(0x1000, PageLocation::Swap(64));
        assert_eq!(
            spt.lookup(0x1000),
            Some(PageState::Resident(PageLocation::Swap(64)))
        );
        assert_eq!(spt.resident_count(), 1);
    }

    #[test]
    fn test_mark_invalid_is_idempotent() {
        let spt = SupplementalPageTable::new(1, PageDirHandle::new(0));
        spt.mark_resident(0x2000, PageLocation::Frame(0));

        spt.mark_invalid(0x2000);
        assert_eq!(spt.lookup(0x2000), Some(PageState::Invalid));
        spt.mark_invalid(0x2000);
        assert_eq!(spt.lookup(0x2000), Some(PageState::Invalid));

        // mark_invalid also creates entries lazily.
        spt.mark_invalid(0x3000);
        assert_eq!(spt.lookup(0x3000), Some(PageState::Invalid));
        assert_eq!(spt.resident_count(), 0);
    }

    #[test]
    fn test_remove_discards_entry() {
        let spt = SupplementalPageTable::new(1, PageDirHandle::new(0));
        spt.mark_resident(0x4000, PageLocation::Frame(2));
        spt.remove(0x4000);
        assert_eq!(spt.lookup(0x4000), None);
    }

    #[test]
    fn test_destroy_with_nothing_resident_releases_nothing() {
        let h = testing::harness(2, 64);
        let spt = h.system.create_aspace(1, PageDirHandle::new(0x1000));
        spt.mark_invalid(0x5000);
        spt.mark_invalid(0x6000);

        let frames_in_use = h.pool.in_use();
        let sectors_occupied = h.system.swap.occupied_sectors();
        spt.destroy(&h.system.frames, &h.system.swap);

        assert_eq!(h.pool.in_use(), frames_in_use);
        assert_eq!(h.system.swap.occupied_sectors(), sectors_occupied);
        assert_eq!(spt.lookup(0x5000), None);
    }
}
