//! Hosted collaborator mocks shared by the unit tests: a bounded physical
//! page pool and a software page directory.

use crate::block::{Block, BlockRole, BlockSector, RamDisk};
use crate::frame::FrameNumber;
use crate::pagedir::{PageDirHandle, PageDirOps};
use crate::palloc::{AllocFlags, PagePool};
use crate::sync::mutex::Mutex;
use crate::system::MemorySystem;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use marrowos_shared::mem::PAGE_FRAME_SIZE;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// A page pool with a fixed number of real, page-aligned frames.
///
/// Exhausting it is how the tests force the frame table into eviction.
/// `free_page` panics on a double free, so "released exactly once" failures
/// surface as test panics rather than silent corruption.
pub struct TestPool {
    pages: Vec<usize>,
    used: Mutex<Vec<bool>>,
}

impl TestPool {
    fn page_layout() -> Layout {
        Layout::from_size_align(PAGE_FRAME_SIZE, PAGE_FRAME_SIZE).expect("static layout is valid")
    }

    pub fn new(capacity: usize) -> Self {
        let pages = (0..capacity)
            .map(|_| {
                // SAFETY: the layout has non-zero size.
                let page = unsafe { alloc_zeroed(Self::page_layout()) };
                assert!(!page.is_null(), "host allocation failed");
                page as usize
            })
            .collect();
        Self {
            pages,
            used: Mutex::new(vec![false; capacity]),
        }
    }

    /// Number of pages currently handed out.
    pub fn in_use(&self) -> usize {
        self.used.lock().iter().filter(|&&used| used).count()
    }

    fn index_of(&self, kpage: usize) -> usize {
        self.pages
            .iter()
            .position(|&page| page == kpage)
            .expect("kpage does not belong to this pool")
    }
}

impl PagePool for TestPool {
    fn alloc_page(&self, flags: AllocFlags) -> Option<usize> {
        let mut used = self.used.lock();
        let at = used.iter().position(|&used| !used)?;
        used[at] = true;
        let kpage = self.pages[at];
        if flags.zeroed() {
            // SAFETY: the page belongs to the pool and was just marked used.
            unsafe { core::ptr::write_bytes(kpage as *mut u8, 0, PAGE_FRAME_SIZE) };
        }
        Some(kpage)
    }

    fn free_page(&self, kpage: usize) {
        let at = self.index_of(kpage);
        let mut used = self.used.lock();
        assert!(used[at], "double free of page {:#x}", kpage);
        used[at] = false;
    }

    fn page_number(&self, kpage: usize) -> FrameNumber {
        self.index_of(kpage)
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        for &page in &self.pages {
            // SAFETY: allocated in `new` with the same layout.
            unsafe { dealloc(page as *mut u8, Self::page_layout()) };
        }
    }
}

#[derive(Clone, Copy)]
struct Mapping {
    kpage: usize,
    writable: bool,
    accessed: bool,
}

/// A software page directory: mappings and accessed bits in a map, with an
/// optional injected failure for the next `set_page`.
#[derive(Default)]
pub struct TestPageDirs {
    maps: Mutex<BTreeMap<(usize, usize), Mapping>>,
    fail_next_map: Mutex<bool>,
}

impl TestPageDirs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `set_page` call report failure.
    pub fn fail_next_map(&self) {
        *self.fail_next_map.lock() = true;
    }

    /// The (kpage, writable) mapping installed for `upage`, if any.
    pub fn mapping(&self, pd: PageDirHandle, upage: usize) -> Option<(usize, bool)> {
        self.maps
            .lock()
            .get(&(pd.raw(), upage))
            .map(|mapping| (mapping.kpage, mapping.writable))
    }

    /// Simulate the MMU setting the accessed bit on a memory reference.
    pub fn touch(&self, pd: PageDirHandle, upage: usize) {
        if let Some(mapping) = self.maps.lock().get_mut(&(pd.raw(), upage)) {
            mapping.accessed = true;
        }
    }

    /// The current accessed bit, false for unmapped pages.
    pub fn accessed_bit(&self, pd: PageDirHandle, upage: usize) -> bool {
        self.maps
            .lock()
            .get(&(pd.raw(), upage))
            .is_some_and(|mapping| mapping.accessed)
    }
}

impl PageDirOps for TestPageDirs {
    fn set_page(&self, pd: PageDirHandle, upage: usize, kpage: usize, writable: bool) -> bool {
        {
            let mut fail = self.fail_next_map.lock();
            if *fail {
                *fail = false;
                return false;
            }
        }
        self.maps.lock().insert(
            (pd.raw(), upage),
            Mapping {
                kpage,
                writable,
                accessed: false,
            },
        );
        true
    }

    fn clear_page(&self, pd: PageDirHandle, upage: usize) {
        self.maps.lock().remove(&(pd.raw(), upage));
    }

    fn is_accessed(&self, pd: PageDirHandle, upage: usize) -> bool {
        self.accessed_bit(pd, upage)
    }

    fn set_accessed(&self, pd: PageDirHandle, upage: usize, accessed: bool) {
        if let Some(mapping) = self.maps.lock().get_mut(&(pd.raw(), upage)) {
            mapping.accessed = accessed;
        }
    }
}

/// A complete memory system over mock collaborators, with handles kept on
/// the mocks for assertions.
pub struct Harness {
    pub system: MemorySystem,
    pub pool: Arc<TestPool>,
    pub page_dirs: Arc<TestPageDirs>,
}

/// Build a harness with `frames` physical frames and a `swap_sectors`-sector
/// swap device.
pub fn harness(frames: usize, swap_sectors: BlockSector) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = Arc::new(TestPool::new(frames));
    let page_dirs = Arc::new(TestPageDirs::new());
    let block = Block::new("swap", BlockRole::Swap, Box::new(RamDisk::new(swap_sectors)));
    let system = MemorySystem::new(
        Arc::clone(&pool) as Arc<dyn PagePool>,
        Arc::clone(&page_dirs) as Arc<dyn PageDirOps>,
        block,
    );
    Harness {
        system,
        pool,
        page_dirs,
    }
}

/// Fill the page at `kpage` with a pattern derived from `seed`.
pub fn fill_page(kpage: usize, seed: u8) {
    // SAFETY: `kpage` names a live page handed out by the harness pool.
    let page = unsafe { core::slice::from_raw_parts_mut(kpage as *mut u8, PAGE_FRAME_SIZE) };
    for (at, byte) in page.iter_mut().enumerate() {
        *byte = (at as u8).wrapping_mul(17).wrapping_add(seed);
    }
}

/// Snapshot the contents of the page at `kpage`.
pub fn page_contents(kpage: usize) -> Vec<u8> {
    // SAFETY: `kpage` names a live page handed out by the harness pool.
    unsafe { core::slice::from_raw_parts(kpage as *const u8, PAGE_FRAME_SIZE) }.to_vec()
}
