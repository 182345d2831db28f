//! Decides whether a fault happened in code that belongs to us, which is the
//! difference between hijacking the faulting thread and chaining back to
//! whoever was registered before us.

use crate::{image, kernel::Kernel, Error};
use exception_context::ThreadState;
use std::ops::Range;

/// The kinds of memory besides our own image that we consider ours
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Memory we generate code into
    ExecutableHeap,
    /// Address space reserved by our virtual memory allocator
    VirtualReservation,
    /// A file mapped by the module loader, including precompiled images
    MappedFile,
}

/// A region of memory registered as ours, `[start, end)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OwnedRegion {
    pub start: usize,
    pub end: usize,
    pub kind: RegionKind,
}

impl OwnedRegion {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The set of address ranges we own
pub struct Ownership {
    image: Range<usize>,
    regions: parking_lot::RwLock<Vec<OwnedRegion>>,
}

impl Ownership {
    /// Creates the set with only the specified image range
    pub fn new(image: Range<usize>) -> Self {
        Self {
            image,
            regions: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Creates the set with the image this crate is loaded into
    pub fn for_current_image() -> Result<Self, Error> {
        let image = image::current_image_range()?;
        log::debug!("image range {:#x}-{:#x}", image.start, image.end);
        Ok(Self::new(image))
    }

    #[inline]
    pub fn image(&self) -> Range<usize> {
        self.image.clone()
    }

    /// Registers an additional region as ours
    pub fn register(&self, start: usize, len: usize, kind: RegionKind) {
        log::debug!("registering {kind:?} region {start:#x}+{len:#x}");
        self.regions.write().push(OwnedRegion {
            start,
            end: start.saturating_add(len),
            kind,
        });
    }

    /// Removes the region starting at the address, returning it if it was
    /// registered
    pub fn unregister(&self, start: usize) -> Option<OwnedRegion> {
        let mut regions = self.regions.write();
        let index = regions.iter().position(|r| r.start == start)?;
        Some(regions.remove(index))
    }

    #[inline]
    pub fn in_image(&self, addr: usize) -> bool {
        self.image.contains(&addr)
    }

    /// The registered region containing the address, if any
    pub fn region_containing(&self, addr: usize) -> Option<OwnedRegion> {
        self.regions.read().iter().find(|r| r.contains(addr)).copied()
    }

    /// True if the address is in our image or any of our regions
    pub fn owns_address(&self, addr: usize) -> bool {
        self.in_image(addr) || self.region_containing(addr).is_some()
    }

    /// True if the thread faulted in code we own.
    ///
    /// On x86_64 a fault in a small leaf helper outside of our image still
    /// counts as ours if the helper was called from our image, found by
    /// following the frame pointer one frame up.
    pub fn is_owned(&self, kernel: &dyn Kernel, state: &ThreadState) -> bool {
        if self.owns_address(state.pc()) {
            return true;
        }

        if cfg!(target_arch = "x86_64") {
            // The frame pointer is whatever the faulting code left in it
            let fp = state.fp();
            if fp != 0 {
                let ret_addr = fp.checked_add(std::mem::size_of::<usize>());
                if let Some(Ok(caller)) = ret_addr.map(|addr| kernel.read_word(addr)) {
                    return self.in_image(caller);
                }
            }
        }

        false
    }
}
