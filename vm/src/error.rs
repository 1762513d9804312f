use core::error::Error;
use core::fmt::{Display, Formatter};

/// Error type for virtual-memory operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free physical frame and eviction could not produce one
    OutOfMemory,
    /// The swap device has no free run of sectors large enough for a page
    NoSpace,
    /// The page-directory mapping call failed, or the virtual address cannot
    /// be mapped at all
    MapFailed,
    /// The frame ring holds nothing that can be evicted
    NoVictim,
    /// A swap slot was not fully and consistently occupied when read back.
    /// This indicates a stale slot id or a double free somewhere, not an
    /// expected runtime condition.
    CorruptSlot,
    /// The faulting page has no entry in the supplemental page table
    NotMapped,
    /// The faulting page is already resident, so the fault is some other
    /// class of error (e.g. a permission violation)
    AlreadyResident,
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of physical memory"),
            VmError::NoSpace => write!(f, "no space left on the swap device"),
            VmError::MapFailed => write!(f, "failed to map page into the page directory"),
            VmError::NoVictim => write!(f, "no evictable frame"),
            VmError::CorruptSlot => write!(f, "swap slot is not fully occupied"),
            VmError::NotMapped => write!(f, "page is unknown to the supplemental page table"),
            VmError::AlreadyResident => write!(f, "page is already resident"),
        }
    }
}

impl Error for VmError {}
