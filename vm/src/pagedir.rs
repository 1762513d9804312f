use core::fmt;

/// Opaque token naming one address space's page directory.
///
/// The frame table records this per resident frame instead of a live
/// reference; only the [`PageDirOps`] implementation knows how to resolve it
/// back to real hardware tables.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageDirHandle(usize);

impl PageDirHandle {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for PageDirHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageDirHandle({:#x})", self.0)
    }
}

/// MMU primitives the frame table drives.
///
/// Every method may be called while the frame-table lock is held, so
/// implementations must not call back into the frame table and must not
/// block on anything that does.
pub trait PageDirOps: Send + Sync {
    /// Map user page `upage` to kernel address `kpage` in `pd` with the given
    /// writable bit. Returns false if the mapping could not be installed.
    fn set_page(&self, pd: PageDirHandle, upage: usize, kpage: usize, writable: bool) -> bool;

    /// Remove any mapping for `upage` from `pd`.
    fn clear_page(&self, pd: PageDirHandle, upage: usize);

    /// The hardware accessed bit for `upage` in `pd`.
    fn is_accessed(&self, pd: PageDirHandle, upage: usize) -> bool;

    /// Overwrite the hardware accessed bit for `upage` in `pd`.
    fn set_accessed(&self, pd: PageDirHandle, upage: usize, accessed: bool);
}
