use core::ptr::NonNull;

bitflags::bitflags! {
    /// How the collector must treat a reported root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RootFlags: u32 {
        /// The slot may point into the middle of an object.
        const INTERIOR = 0x1;
        /// The referenced object must not move.
        const PINNED = 0x2;
    }
}

/// Receives the roots found during a stack walk.
pub trait GcRootSink {
    /// Report one slot holding a (possibly interior) object reference.
    fn report(&mut self, location: NonNull<usize>, flags: RootFlags);

    /// Report every pointer-aligned slot in `[lower, upper)` as a possible
    /// pinned interior reference.
    fn report_conservative_range(&mut self, lower: NonNull<usize>, upper: NonNull<usize>) {
        let mut slot = lower.as_ptr();
        while slot < upper.as_ptr() {
            // SAFETY: `slot` lies within a non-null range and is never null.
            let loc = unsafe { NonNull::new_unchecked(slot) };
            self.report(loc, RootFlags::INTERIOR | RootFlags::PINNED);
            slot = slot.wrapping_add(1);
        }
    }
}

impl<F> GcRootSink for F
where
    F: FnMut(NonNull<usize>, RootFlags),
{
    fn report(&mut self, location: NonNull<usize>, flags: RootFlags) {
        self(location, flags)
    }
}
