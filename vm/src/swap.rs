// Sector counts fit in BlockSector on every supported device, so the
// usize <-> BlockSector conversions below cannot truncate.
#![allow(clippy::cast_possible_truncation)]

use crate::block::{Block, BlockManager, BlockRole, BlockSector, BLOCK_SECTOR_SIZE};
use crate::error::VmError;
use crate::sync::mutex::Mutex;
use marrowos_shared::bitmap::Bitmap;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// Number of contiguous sectors holding one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Identifies an occupied swap slot by the index of its first sector.
pub type SwapSlot = BlockSector;

struct SwapInner {
    block: Block,
    map: Bitmap,
}

/// The swap area: page-sized slots carved out of a block device.
///
/// One bit of occupancy state per sector; a slot is [`SECTORS_PER_PAGE`]
/// contiguous sectors that are either all free or all occupied. One mutex
/// covers the bitmap and the device together, so a slot allocation plus its
/// writes (or a verify plus its reads) is atomic with respect to every other
/// swap operation.
pub struct SwapStore {
    inner: Mutex<SwapInner>,
}

impl SwapStore {
    /// Builds a swap store over `block`, with every slot free.
    pub fn new(block: Block) -> Self {
        let map = Bitmap::new(block.sector_count() as usize);
        log::debug!(
            "swap store on \"{}\": {} sectors, {} page slots",
            block.name(),
            block.sector_count(),
            block.sector_count() as usize / SECTORS_PER_PAGE,
        );
        Self {
            inner: Mutex::new(SwapInner { block, map }),
        }
    }

    /// Discovers the `Swap`-role device in `manager` and takes ownership of
    /// it. Returns `None` if no swap device was registered.
    pub fn from_manager(manager: &mut BlockManager) -> Option<Self> {
        Some(Self::new(manager.take_by_role(BlockRole::Swap)?))
    }

    /// Writes one page of data out to a freshly allocated slot.
    ///
    /// Scans for a free run of sectors, marks it occupied, and writes `page`
    /// across it. Fails with [`VmError::NoSpace`], leaving the occupancy map
    /// untouched, if no sufficiently large free run exists.
    ///
    /// Panics if `page` is not exactly one page long.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, VmError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE, "swap_out of a non-page buffer");

        let mut inner = self.inner.lock();
        let SwapInner { block, map } = &mut *inner;

        let Some(base) = map.scan_and_flip(0, SECTORS_PER_PAGE, false) else {
            return Err(VmError::NoSpace);
        };
        let slot = base as SwapSlot;

        for i in 0..SECTORS_PER_PAGE {
            block.write(
                slot + i as BlockSector,
                &page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE],
            );
        }

        log::trace!("swapped page out to slot {}", slot);
        Ok(slot)
    }

    /// Reads the page stored in `slot` into `page` and releases the slot.
    ///
    /// The slot ceases to exist the instant the read completes; a later
    /// eviction of the same page must allocate a fresh slot. A slot whose
    /// run is not fully occupied signals a stale slot id or a double free:
    /// nothing is read and [`VmError::CorruptSlot`] is returned.
    ///
    /// Panics if `page` is not exactly one page long.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), VmError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE, "swap_in into a non-page buffer");

        let mut inner = self.inner.lock();
        let SwapInner { block, map } = &mut *inner;

        if !map.all(slot as usize, SECTORS_PER_PAGE) {
            log::error!("swap_in of slot {} which is not fully occupied", slot);
            return Err(VmError::CorruptSlot);
        }

        for i in 0..SECTORS_PER_PAGE {
            block.read(
                slot + i as BlockSector,
                &mut page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE],
            );
        }

        map.set_range(slot as usize, SECTORS_PER_PAGE, false);
        log::trace!("swapped page in from slot {}", slot);
        Ok(())
    }

    /// Releases `slot` without reading it back.
    ///
    /// Used when a swapped page's contents are being discarded, e.g. the
    /// owning process exited without ever reloading it.
    pub fn free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        inner.map.set_range(slot as usize, SECTORS_PER_PAGE, false);
        log::trace!("freed swap slot {}", slot);
    }

    /// Number of sectors currently holding live swapped data.
    pub fn occupied_sectors(&self) -> usize {
        self.inner.lock().map.count_set()
    }
}
