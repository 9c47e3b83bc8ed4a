use crate::arch::{PRESERVED_FLOAT_COUNT, PreservedFloat, Reg};
use core::fmt;
use core::ptr::NonNull;

/// Where each tracked register lives at the current unwind position.
///
/// Integer registers are tracked by the address of the stack slot (or
/// context field) holding them, so that GC roots held in registers can be
/// reported and updated in place. The stack pointer, instruction pointer and
/// preserved floating point state are tracked by value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    locations: [Option<NonNull<usize>>; Reg::COUNT],
    /// Stack pointer of the frame.
    pub sp: usize,
    /// Instruction pointer of the frame.
    pub ip: usize,
    /// Preserved floating point registers, by value.
    pub floats: [PreservedFloat; PRESERVED_FLOAT_COUNT],
}

impl Default for RegisterSet {
    fn default() -> Self {
        RegisterSet {
            locations: [None; Reg::COUNT],
            sp: 0,
            ip: 0,
            floats: [PreservedFloat::default(); PRESERVED_FLOAT_COUNT],
        }
    }
}

impl RegisterSet {
    /// Address currently holding `reg`, if known.
    pub fn location(&self, reg: Reg) -> Option<NonNull<usize>> {
        self.locations[reg.index()]
    }

    /// Record that `reg` is held at `loc`.
    pub fn set_location(&mut self, reg: Reg, loc: NonNull<usize>) {
        self.locations[reg.index()] = Some(loc);
    }

    /// Forget where `reg` is held.
    pub fn clear_location(&mut self, reg: Reg) {
        self.locations[reg.index()] = None;
    }

    /// Read the value of `reg`.
    ///
    /// # Safety
    ///
    /// The recorded location, if any, must still be readable.
    pub unsafe fn value(&self, reg: Reg) -> Option<usize> {
        // SAFETY: upheld by the caller.
        self.location(reg).map(|loc| unsafe { *loc.as_ptr() })
    }

    /// Read the frame pointer register, or zero if its location is unknown.
    ///
    /// # Safety
    ///
    /// Same as [`RegisterSet::value`].
    pub unsafe fn fp(&self) -> usize {
        unsafe { self.value(Reg::FP).unwrap_or(0) }
    }

    /// Stack pointer of the frame.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Instruction pointer of the frame.
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Set the stack pointer.
    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    /// Set the instruction pointer.
    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    /// Iterate over every register whose location is known.
    pub fn known_locations(&self) -> impl Iterator<Item = (Reg, NonNull<usize>)> + '_ {
        Reg::all()
            .iter()
            .filter_map(|reg| self.location(*reg).map(|loc| (*reg, loc)))
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RegisterSet");
        s.field("sp", &format_args!("{:#x}", self.sp));
        s.field("ip", &format_args!("{:#x}", self.ip));
        for (reg, loc) in self.known_locations() {
            s.field(reg.name(), &loc);
        }
        s.finish()
    }
}
