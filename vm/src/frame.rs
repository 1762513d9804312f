use crate::aspace::{AddressSpaceId, AspaceRegistry};
use crate::error::VmError;
use crate::page::PageLocation;
use crate::pagedir::{PageDirHandle, PageDirOps};
use crate::palloc::{AllocFlags, PagePool};
use crate::swap::SwapStore;
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use alloc::vec::Vec;
use marrowos_shared::mem::{is_page_aligned, is_user_vaddr, PAGE_FRAME_SIZE};

/// Identity of a physical frame, as assigned by the page pool.
pub type FrameNumber = usize;

/// One resident physical frame and who owns it.
///
/// The page-directory handle and address-space id are plain identifiers; the
/// frame table owns the entry itself and nothing else.
#[derive(Clone, Copy, Debug)]
struct FrameEntry {
    frame: FrameNumber,
    pd: PageDirHandle,
    owner: AddressSpaceId,
    upage: usize,
    kpage: usize,
}

/// Resident frames in clock order, plus the hand cursor.
///
/// The ring is a plain vector walked modulo its length; the hand is an index
/// into it, pointing at the next eviction candidate.
struct Ring {
    entries: Vec<FrameEntry>,
    hand: usize,
}

impl Ring {
    /// Take the entry at `at` out of the ring, keeping the hand on the
    /// entry that followed it.
    fn remove(&mut self, at: usize) -> FrameEntry {
        let entry = self.entries.remove(at);
        if at < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        entry
    }
}

/// The table of resident physical frames and the clock eviction policy.
///
/// One mutex serializes every mutation, including the whole eviction scan
/// and its swap write, so a frame number is never handed to a new owner
/// before its previous owner's page entry reflects the eviction.
pub struct FrameTable {
    ring: Mutex<Ring>,
    pool: Arc<dyn PagePool>,
    page_dirs: Arc<dyn PageDirOps>,
    swap: Arc<SwapStore>,
    aspaces: Arc<AspaceRegistry>,
}

impl FrameTable {
    pub fn new(
        pool: Arc<dyn PagePool>,
        page_dirs: Arc<dyn PageDirOps>,
        swap: Arc<SwapStore>,
        aspaces: Arc<AspaceRegistry>,
    ) -> Self {
        Self {
            ring: Mutex::new(Ring {
                entries: Vec::new(),
                hand: 0,
            }),
            pool,
            page_dirs,
            swap,
            aspaces,
        }
    }

    /// Back `upage` in address space `aspace` with a physical frame, evicting
    /// if the pool is exhausted, and map it with the given writable bit.
    ///
    /// On success the page is mapped, its frame entry is in the ring, and the
    /// owning supplemental page table records it frame-resident; the kernel
    /// address of the frame is returned. Any failure after a frame was
    /// obtained unwinds fully, leaving no partial state behind.
    ///
    /// Panics if `aspace` is not registered.
    pub fn acquire(
        &self,
        aspace: AddressSpaceId,
        upage: usize,
        flags: AllocFlags,
        writable: bool,
    ) -> Result<usize, VmError> {
        debug_assert!(is_page_aligned(upage));
        if !is_user_vaddr(upage) {
            return Err(VmError::MapFailed);
        }
        let spt = self
            .aspaces
            .get(aspace)
            .expect("acquire for unregistered address space");
        let pd = spt.page_dir();

        let mut ring = self.ring.lock();

        let kpage = match self.pool.alloc_page(flags) {
            Some(kpage) => kpage,
            None => {
                let recycled = self.evict(&mut ring).map_err(|err| match err {
                    VmError::NoSpace | VmError::NoVictim => VmError::OutOfMemory,
                    other => other,
                })?;
                if flags.zeroed() {
                    // SAFETY: the recycled frame was just unmapped from its
                    // previous owner and belongs to nobody until we hand it
                    // out below.
                    unsafe {
                        core::ptr::write_bytes(recycled as *mut u8, 0, PAGE_FRAME_SIZE);
                    }
                }
                recycled
            }
        };

        if !self.page_dirs.set_page(pd, upage, kpage, writable) {
            self.pool.free_page(kpage);
            return Err(VmError::MapFailed);
        }

        let frame = self.pool.page_number(kpage);
        debug_assert!(
            ring.entries.iter().all(|entry| entry.frame != frame),
            "frame {} already has a ring entry",
            frame
        );
        let entry = FrameEntry {
            frame,
            pd,
            owner: aspace,
            upage,
            kpage,
        };
        if ring.entries.is_empty() {
            ring.entries.push(entry);
            ring.hand = 0;
        } else {
            // Insert just behind the hand so the newcomer is the last frame
            // the next clock scan reaches.
            let at = ring.hand;
            ring.entries.insert(at, entry);
            ring.hand += 1;
        }

        spt.mark_resident(upage, PageLocation::Frame(frame));
        log::trace!(
            "aspace {}: {:#x} -> frame {} at {:#x}",
            aspace,
            upage,
            frame,
            kpage
        );
        Ok(kpage)
    }

    /// Reclaim one resident frame with a second-chance scan and return its
    /// kernel address for reuse.
    ///
    /// A visited frame whose accessed bit is set gets the bit cleared and one
    /// reprieve; the first frame found with the bit clear is the victim. The
    /// scan is bounded at two laps, since the first lap clears every bit.
    /// The victim's contents go out to swap, its page entry flips to
    /// swap-resident, and its mapping is removed; if the swap device is full
    /// the eviction aborts with the victim still resident and mapped.
    fn evict(&self, ring: &mut Ring) -> Result<usize, VmError> {
        if ring.entries.is_empty() {
            return Err(VmError::NoVictim);
        }

        let len = ring.entries.len();
        let mut at = ring.hand;
        let mut victim = None;
        for _ in 0..2 * len {
            let entry = &ring.entries[at];
            if self.page_dirs.is_accessed(entry.pd, entry.upage) {
                self.page_dirs.set_accessed(entry.pd, entry.upage, false);
                at = (at + 1) % len;
            } else {
                victim = Some(at);
                break;
            }
        }
        let at = victim.ok_or(VmError::NoVictim)?;
        let entry = ring.entries[at];

        // No destination, no progress: bail before touching the victim.
        // SAFETY: `kpage` is the kernel mapping of a frame this entry owns,
        // and the frame-table lock keeps it alive across the write-out.
        let contents =
            unsafe { core::slice::from_raw_parts(entry.kpage as *const u8, PAGE_FRAME_SIZE) };
        let slot = self.swap.swap_out(contents)?;

        let spt = self
            .aspaces
            .get(entry.owner)
            .expect("evicting a frame of an unregistered address space");
        spt.mark_resident(entry.upage, PageLocation::Swap(slot));
        self.page_dirs.clear_page(entry.pd, entry.upage);

        // Advance the hand one step past the victim before taking it out of
        // the ring, so the next scan resumes in the right place.
        ring.hand = at;
        ring.remove(at);

        log::debug!(
            "evicted aspace {} page {:#x} from frame {} to slot {}",
            entry.owner,
            entry.upage,
            entry.frame,
            slot
        );
        Ok(entry.kpage)
    }

    /// Give frame `frame` back outside the eviction path, e.g. during
    /// address-space teardown.
    ///
    /// A frame number with no ring entry is a no-op, which makes the call
    /// idempotent. Otherwise the owning page entry is marked invalid first,
    /// so a teardown sweep running afterwards cannot release the same frame
    /// a second time.
    pub fn release(&self, frame: FrameNumber) {
        let mut ring = self.ring.lock();
        let Some(at) = ring.entries.iter().position(|entry| entry.frame == frame) else {
            return;
        };
        let entry = ring.entries[at];

        if let Some(spt) = self.aspaces.get(entry.owner) {
            spt.mark_invalid(entry.upage);
        }
        self.pool.free_page(entry.kpage);
        self.page_dirs.clear_page(entry.pd, entry.upage);
        ring.remove(at);

        log::trace!(
            "released frame {} ({:#x} of aspace {})",
            frame,
            entry.upage,
            entry.owner
        );
    }

    /// Number of frames currently resident.
    pub fn resident_count(&self) -> usize {
        self.ring.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageState;
    use crate::testing;
    use marrowos_shared::mem::OFFSET;

    const PD: PageDirHandle = PageDirHandle::new(0x1000);

    fn upage(n: usize) -> usize {
        0x8000 + n * PAGE_FRAME_SIZE
    }

    #[test]
    fn test_acquire_maps_and_records() {
        let h = testing::harness(2, 64);
        let spt = h.system.create_aspace(1, PD);

        let kpage = h
            .system
            .frames
            .acquire(1, upage(0), AllocFlags::DEFAULT, true)
            .expect("frame available");

        assert_eq!(h.pool.in_use(), 1);
        assert_eq!(h.system.frames.resident_count(), 1);
        assert_eq!(h.page_dirs.mapping(PD, upage(0)), Some((kpage, true)));
        let frame = h.pool.page_number(kpage);
        assert_eq!(
            spt.lookup(upage(0)),
            Some(PageState::Resident(PageLocation::Frame(frame)))
        );
    }

    #[test]
    fn test_acquire_rejects_kernel_vaddr() {
        let h = testing::harness(2, 64);
        h.system.create_aspace(1, PD);

        assert_eq!(
            h.system.frames.acquire(1, OFFSET, AllocFlags::DEFAULT, true),
            Err(VmError::MapFailed)
        );
        assert_eq!(h.pool.in_use(), 0);
    }

    #[test]
    fn test_map_failure_unwinds_fully() {
        let h = testing::harness(2, 64);
        let spt = h.system.create_aspace(1, PD);

        h.page_dirs.fail_next_map();
        assert_eq!(
            h.system
                .frames
                .acquire(1, upage(0), AllocFlags::DEFAULT, true),
            Err(VmError::MapFailed)
        );

        assert_eq!(h.pool.in_use(), 0);
        assert_eq!(h.system.frames.resident_count(), 0);
        assert_eq!(spt.lookup(upage(0)), None);
    }

    #[test]
    fn test_second_chance_spares_accessed_frame() {
        let h = testing::harness(2, 64);
        let spt = h.system.create_aspace(1, PD);

        h.system
            .frames
            .acquire(1, upage(0), AllocFlags::DEFAULT, true)
            .expect("frame available");
        h.system
            .frames
            .acquire(1, upage(1), AllocFlags::DEFAULT, true)
            .expect("frame available");

        // The scan visits page 0 first. Its accessed bit buys one reprieve,
        // so page 1 is the victim.
        h.page_dirs.touch(PD, upage(0));

        h.system
            .frames
            .acquire(1, upage(2), AllocFlags::DEFAULT, true)
            .expect("eviction frees a frame");

        assert!(matches!(
            spt.lookup(upage(1)),
            Some(PageState::Resident(PageLocation::Swap(_)))
        ));
        assert!(matches!(
            spt.lookup(upage(0)),
            Some(PageState::Resident(PageLocation::Frame(_)))
        ));
        assert!(h.page_dirs.mapping(PD, upage(1)).is_none());
        // The reprieve consumed the accessed bit.
        assert!(!h.page_dirs.accessed_bit(PD, upage(0)));
        assert_eq!(h.system.frames.resident_count(), 2);
        assert_eq!(h.pool.in_use(), 2);
    }

    #[test]
    fn test_eviction_aborts_when_swap_is_full() {
        // A swap device too small for even one page.
        let h = testing::harness(2, 4);
        let spt = h.system.create_aspace(1, PD);

        h.system
            .frames
            .acquire(1, upage(0), AllocFlags::DEFAULT, true)
            .expect("frame available");
        h.system
            .frames
            .acquire(1, upage(1), AllocFlags::DEFAULT, true)
            .expect("frame available");

        assert_eq!(
            h.system
                .frames
                .acquire(1, upage(2), AllocFlags::DEFAULT, true),
            Err(VmError::OutOfMemory)
        );

        // The victim candidate was left resident and mapped.
        assert_eq!(h.system.frames.resident_count(), 2);
        assert!(matches!(
            spt.lookup(upage(0)),
            Some(PageState::Resident(PageLocation::Frame(_)))
        ));
        assert!(matches!(
            spt.lookup(upage(1)),
            Some(PageState::Resident(PageLocation::Frame(_)))
        ));
        assert!(h.page_dirs.mapping(PD, upage(0)).is_some());
        assert!(h.page_dirs.mapping(PD, upage(1)).is_some());
        assert_eq!(h.system.swap.occupied_sectors(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let h = testing::harness(2, 64);
        let spt = h.system.create_aspace(1, PD);

        let kpage = h
            .system
            .frames
            .acquire(1, upage(0), AllocFlags::DEFAULT, true)
            .expect("frame available");
        let frame = h.pool.page_number(kpage);

        h.system.frames.release(frame);
        assert_eq!(h.pool.in_use(), 0);
        assert_eq!(h.system.frames.resident_count(), 0);
        assert_eq!(spt.lookup(upage(0)), Some(PageState::Invalid));
        assert!(h.page_dirs.mapping(PD, upage(0)).is_none());

        // Releasing again, or releasing a frame that never existed, is a
        // no-op.
        h.system.frames.release(frame);
        h.system.frames.release(12345);
        assert_eq!(h.pool.in_use(), 0);
    }

    #[test]
    fn test_hand_survives_removal_at_cursor() {
        let h = testing::harness(2, 64);
        let spt = h.system.create_aspace(1, PD);

        let kpage0 = h
            .system
            .frames
            .acquire(1, upage(0), AllocFlags::DEFAULT, true)
            .expect("frame available");
        h.system
            .frames
            .acquire(1, upage(1), AllocFlags::DEFAULT, true)
            .expect("frame available");

        // The hand currently points at page 0's entry; removing it forces
        // the cursor to move on.
        h.system.frames.release(h.pool.page_number(kpage0));

        h.system
            .frames
            .acquire(1, upage(2), AllocFlags::DEFAULT, true)
            .expect("pool has a free frame again");
        h.system
            .frames
            .acquire(1, upage(3), AllocFlags::DEFAULT, true)
            .expect("eviction frees a frame");

        // Page 1 was the oldest remaining frame and the scan found it first.
        assert!(matches!(
            spt.lookup(upage(1)),
            Some(PageState::Resident(PageLocation::Swap(_)))
        ));
        assert!(matches!(
            spt.lookup(upage(2)),
            Some(PageState::Resident(PageLocation::Frame(_)))
        ));
    }

    #[test]
    fn test_residency_never_exceeds_pool() {
        let h = testing::harness(3, 256);
        let spt = h.system.create_aspace(1, PD);

        for n in 0..6 {
            h.system
                .frames
                .acquire(1, upage(n), AllocFlags::DEFAULT, true)
                .expect("acquire always succeeds while swap has room");
            assert!(h.system.frames.resident_count() <= 3);
        }

        assert_eq!(h.system.frames.resident_count(), 3);
        assert_eq!(h.pool.in_use(), 3);

        // Every page is accounted for exactly once, and the three
        // frame-resident pages sit in three distinct frames.
        let mut frames = alloc::vec::Vec::new();
        let mut swapped = 0;
        for n in 0..6 {
            match spt.lookup(upage(n)).expect("entry exists") {
                PageState::Resident(PageLocation::Frame(frame)) => frames.push(frame),
                PageState::Resident(PageLocation::Swap(_)) => swapped += 1,
                PageState::Invalid => panic!("no page was invalidated"),
            }
        }
        frames.sort_unstable();
        frames.dedup();
        assert_eq!(frames.len(), 3);
        assert_eq!(swapped, 3);
    }
}
