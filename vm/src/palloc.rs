use crate::frame::FrameNumber;
use bitbybit::bitfield;

/// Request flags for a physical page allocation.
// zeroed: hand the page back zero-filled.
// user: the frame backs a user page rather than kernel data.
#[bitfield(u8, default = 0)]
pub struct AllocFlags {
    #[bit(0, rw)]
    zeroed: bool,
    #[bit(1, rw)]
    user: bool,
}

/// The physical page allocator underneath the frame table.
///
/// `alloc_page` and `free_page` may be called while the frame-table lock is
/// held; implementations must not call back into the frame table.
pub trait PagePool: Send + Sync {
    /// Allocate one physical frame and return its kernel-mapped address, or
    /// `None` if the pool is exhausted.
    fn alloc_page(&self, flags: AllocFlags) -> Option<usize>;

    /// Return the frame holding `kpage` to the pool.
    fn free_page(&self, kpage: usize);

    /// The frame number of the frame holding `kpage`.
    ///
    /// Frame numbers are dense, stable, and unique per physical frame; the
    /// frame table uses them as the public identity of a resident frame.
    fn page_number(&self, kpage: usize) -> FrameNumber;
}
