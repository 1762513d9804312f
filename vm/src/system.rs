use crate::aspace::{AddressSpaceId, AspaceRegistry};
use crate::block::Block;
use crate::error::VmError;
use crate::frame::FrameTable;
use crate::page::{PageLocation, PageState, SupplementalPageTable};
use crate::pagedir::{PageDirHandle, PageDirOps};
use crate::palloc::{AllocFlags, PagePool};
use crate::swap::SwapStore;
use alloc::sync::Arc;
use marrowos_shared::mem::{page_base, PAGE_FRAME_SIZE};

/// The assembled virtual-memory subsystem.
///
/// Owns the address-space registry, the swap store, and the frame table,
/// wired to the collaborator implementations the embedding kernel provides.
pub struct MemorySystem {
    pub frames: FrameTable,
    pub swap: Arc<SwapStore>,
    pub aspaces: Arc<AspaceRegistry>,
}

impl MemorySystem {
    /// Assemble the subsystem over a physical page pool, the MMU primitives,
    /// and the block device backing swap.
    pub fn new(
        pool: Arc<dyn PagePool>,
        page_dirs: Arc<dyn PageDirOps>,
        swap_block: Block,
    ) -> Self {
        let aspaces = Arc::new(AspaceRegistry::new());
        let swap = Arc::new(SwapStore::new(swap_block));
        let frames = FrameTable::new(pool, page_dirs, Arc::clone(&swap), Arc::clone(&aspaces));
        Self {
            frames,
            swap,
            aspaces,
        }
    }

    /// Register address space `id` and hand back its supplemental page
    /// table.
    pub fn create_aspace(
        &self,
        id: AddressSpaceId,
        pd: PageDirHandle,
    ) -> Arc<SupplementalPageTable> {
        self.aspaces.register(id, pd)
    }

    /// Tear down address space `id`: sweep its supplemental page table,
    /// releasing every frame and swap slot it still owns, then drop the
    /// registration.
    ///
    /// Call exactly once, after no other thread can touch the address
    /// space's mappings. An unknown `id` is a no-op.
    pub fn destroy_aspace(&self, id: AddressSpaceId) {
        let Some(spt) = self.aspaces.get(id) else {
            return;
        };
        spt.destroy(&self.frames, &self.swap);
        self.aspaces.unregister(id);
        log::debug!("tore down address space {}", id);
    }

    /// Resolve a page fault at `vaddr` in address space `aspace`.
    ///
    /// Pages this subsystem has never heard of are reported as
    /// [`VmError::NotMapped`]; the caller decides what an unhandled fault
    /// means. A fault on a page that is already frame-resident is some other
    /// class of error (usually permissions) and comes back as
    /// [`VmError::AlreadyResident`]. A swap-resident page is reloaded:
    /// acquire a frame (possibly evicting) and read the slot's contents into
    /// it.
    pub fn fault_in(
        &self,
        aspace: AddressSpaceId,
        vaddr: usize,
        writable: bool,
    ) -> Result<usize, VmError> {
        let spt = self.aspaces.get(aspace).ok_or(VmError::NotMapped)?;
        let upage = page_base(vaddr);

        match spt.lookup(upage) {
            None | Some(PageState::Invalid) => Err(VmError::NotMapped),
            Some(PageState::Resident(PageLocation::Frame(_))) => Err(VmError::AlreadyResident),
            Some(PageState::Resident(PageLocation::Swap(slot))) => {
                let flags = AllocFlags::DEFAULT.with_user(true);
                let kpage = self.frames.acquire(aspace, upage, flags, writable)?;
                // SAFETY: `acquire` just mapped this frame for us; nothing
                // else writes it until we return.
                let page =
                    unsafe { core::slice::from_raw_parts_mut(kpage as *mut u8, PAGE_FRAME_SIZE) };
                self.swap.swap_in(slot, page)?;
                Ok(kpage)
            }
        }
    }
}
