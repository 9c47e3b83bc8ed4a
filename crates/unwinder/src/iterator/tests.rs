use super::*;
use crate::arch::{FrameSlot, PInvokeTransitionFrame, SavedSlot, TRANSITION_FRAME_SAVE_ORDER, TransitionFrameFlags};
use crate::{GcRootSink, ThunkTable};

const W: usize = size_of::<usize>();

const THUNKS: ThunkTable = ThunkTable {
    universal_transition_return: 0x100,
    universal_transition_return_debug_step_tail_call: 0x108,
    throw_ex2: 0x200,
    throw_hw_ex2: 0x208,
    rethrow2: 0x210,
    call_catch_funclet2: 0x300,
    call_finally_funclet2: 0x308,
    call_filter_funclet2: 0x310,
};

const NATIVE_PC: usize = 0xdead_0000;

fn install_thunks() {
    let _ = env_logger::try_init();
    thunks::install(THUNKS).unwrap();
}

/// A method in the mock code space. Frames follow the usual frame pointer
/// chain: `[fp]` is the caller's fp, `[fp + W]` the return address and the
/// caller's SP is `fp + 2W`. Funclets keep their owner's fp at `[fp - W]`.
#[derive(Clone, Copy)]
struct Method {
    start: usize,
    end: usize,
    funclet: bool,
    reverse_pinvoke: Option<TransitionFrameRef>,
}

impl Method {
    fn new(start: usize) -> Method {
        Method {
            start,
            end: start + 0x100,
            funclet: false,
            reverse_pinvoke: None,
        }
    }
}

struct MockCodeManager {
    methods: Vec<Method>,
}

// SAFETY: the mock is immutable after construction; the raw frame pointers it
// holds are only dereferenced by the single test thread that owns the frames.
unsafe impl Sync for MockCodeManager {}

// SAFETY: only reads frames laid out by the tests below.
unsafe impl CodeManager for MockCodeManager {
    fn find_method_info(&self, pc: usize) -> Option<MethodInfo> {
        let (i, m) = self
            .methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.start <= pc && pc < m.end)?;
        Some(MethodInfo {
            start: m.start,
            opaque: [i, 0, 0, 0],
        })
    }

    unsafe fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        _flags: UnwindFlags,
        regs: &mut RegisterSet,
    ) -> Result<Option<TransitionFrameRef>, UnwindError> {
        let method = self.methods[info.opaque[0]];
        let fp = regs
            .location(Reg::FP)
            .map(|loc| unsafe { *loc.as_ptr() })
            .ok_or(UnwindError::UnwindFailed { pc: info.start })?;
        regs.set_location(Reg::FP, NonNull::new(fp as *mut usize).unwrap());
        regs.set_ip(unsafe { *((fp + W) as *const usize) });
        regs.set_sp(fp + 2 * W);
        Ok(method.reverse_pinvoke)
    }

    fn is_funclet(&self, info: &MethodInfo) -> bool {
        self.methods[info.opaque[0]].funclet
    }

    unsafe fn get_frame_pointer(&self, info: &MethodInfo, regs: &RegisterSet) -> usize {
        let fp = unsafe { regs.fp() };
        if self.is_funclet(info) {
            unsafe { *((fp - W) as *const usize) }
        } else {
            fp
        }
    }

    unsafe fn enum_gc_refs(
        &self,
        _info: &MethodInfo,
        _safe_point: usize,
        _regs: &RegisterSet,
        _sink: &mut dyn GcRootSink,
        _is_active_frame: bool,
    ) {
    }

    unsafe fn get_return_address_hijack_info(
        &self,
        _info: &MethodInfo,
        _regs: &RegisterSet,
    ) -> Option<(NonNull<usize>, GcRefKind)> {
        None
    }

    unsafe fn get_conservative_upper_bound_for_outgoing_args(
        &self,
        _info: &MethodInfo,
        regs: &RegisterSet,
    ) -> usize {
        regs.sp() + 4 * W
    }

    fn remap_hardware_fault_to_gc_safe_point(&self, _info: &MethodInfo, pc: usize) -> usize {
        pc
    }
}

struct MockRegistry {
    cm: &'static MockCodeManager,
}

impl MockRegistry {
    fn new(methods: Vec<Method>) -> MockRegistry {
        MockRegistry {
            cm: Box::leak(Box::new(MockCodeManager { methods })),
        }
    }
}

impl CodeRegistry for MockRegistry {
    fn is_managed(&self, pc: usize) -> bool {
        self.cm.find_method_info(pc).is_some()
    }

    fn code_manager_for_address(&self, pc: usize) -> Option<&'static dyn CodeManager> {
        if self.is_managed(pc) {
            Some(self.cm)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct MockThread {
    ex_info_head: Option<NonNull<ExInfo>>,
    interrupted: Option<NonNull<PalLimitedContext>>,
}

impl WalkableThread for MockThread {
    fn ex_info_head(&self) -> Option<NonNull<ExInfo>> {
        self.ex_info_head
    }

    fn interrupted_context(&self) -> Option<NonNull<PalLimitedContext>> {
        self.interrupted
    }

    fn transition_frame_for_stack_trace(&self) -> TransitionFrameRef {
        TransitionFrameRef::TopOfStack
    }

    fn is_hijacked(&self) -> bool {
        false
    }
}

/// Word-addressed scratch stack.
struct Stack {
    words: Vec<usize>,
}

impl Stack {
    fn new(words: usize) -> Stack {
        Stack {
            words: vec![0; words],
        }
    }

    fn addr(&self, index: usize) -> usize {
        self.words.as_ptr() as usize + index * W
    }

    fn write(&mut self, addr: usize, value: usize) {
        let index = (addr - self.addr(0)) / W;
        self.words[index] = value;
    }

    /// Lay out a frame-pointer frame at `fp`.
    fn frame(&mut self, fp: usize, caller_fp: usize, return_address: usize) {
        self.write(fp, caller_fp);
        self.write(fp + W, return_address);
    }
}

#[repr(C)]
struct TransitionFrame {
    header: PInvokeTransitionFrame,
    saved: [usize; 8],
}

impl TransitionFrame {
    fn new(rip: usize, fp: usize, sp: usize, extra: TransitionFrameFlags) -> Box<TransitionFrame> {
        let flags = TransitionFrameFlags::SAVE_SP | extra;
        let mut saved = [0; 8];
        let mut n = 0;
        for (flag, slot) in TRANSITION_FRAME_SAVE_ORDER {
            if flags.contains(*flag) {
                if *slot == SavedSlot::Sp {
                    saved[n] = sp;
                }
                n += 1;
            }
        }
        Box::new(TransitionFrame {
            header: PInvokeTransitionFrame {
                rip,
                frame_pointer: fp,
                thread: 0,
                flags: flags.bits(),
                preserved_regs: [],
            },
            saved,
        })
    }

    fn as_seed(&mut self) -> WalkSeed {
        WalkSeed::Frame(NonNull::from(&mut self.header))
    }
}

fn limited_context(ip: usize, sp: usize, fp: usize) -> Box<PalLimitedContext> {
    let mut ctx = Box::new(PalLimitedContext::default());
    ctx.set_ip(ip);
    ctx.set_sp(sp);
    ctx.set_fp(fp);
    ctx
}

fn collect_pcs(iter: &mut StackFrameIterator<'_>) -> Vec<usize> {
    let mut pcs = Vec::new();
    while iter.is_valid() {
        pcs.push(iter.control_pc());
        unsafe { iter.try_next() }.unwrap();
    }
    pcs
}

/// Three nested managed frames C -> B -> A, with A entered from native code.
fn three_frames(stack: &mut Stack) -> (MockRegistry, [usize; 3]) {
    let (fp_c, fp_b, fp_a) = (stack.addr(4), stack.addr(10), stack.addr(16));
    stack.frame(fp_c, fp_b, 0x2010);
    stack.frame(fp_b, fp_a, 0x1010);
    stack.frame(fp_a, 0, NATIVE_PC);

    let mut a = Method::new(0x1000);
    a.reverse_pinvoke = Some(TransitionFrameRef::TopOfStack);
    let registry = MockRegistry::new(vec![a, Method::new(0x2000), Method::new(0x3000)]);
    (registry, [fp_c, fp_b, fp_a])
}

#[test]
fn top_of_stack_seed_is_empty() {
    install_thunks();
    let registry = MockRegistry::new(vec![]);
    let thread = MockThread::default();
    let iter = unsafe { StackFrameIterator::new(&thread, &registry, WalkSeed::TopOfStack) };
    assert!(!iter.is_valid());
    assert!(!iter.has_stack_range_to_report_conservatively());
}

#[test]
fn walks_frame_pointer_chain_from_transition_frame() {
    install_thunks();
    let mut stack = Stack::new(32);
    let (registry, [fp_c, fp_b, fp_a]) = three_frames(&mut stack);
    let thread = MockThread::default();

    let mut frame = TransitionFrame::new(0x3010, fp_c, stack.addr(0), TransitionFrameFlags::empty());
    let mut iter = unsafe { StackFrameIterator::try_new(&thread, &registry, frame.as_seed()) }.unwrap();

    let mut seen = Vec::new();
    while iter.is_valid() {
        seen.push((iter.control_pc(), iter.frame_pointer()));
        unsafe { iter.try_next() }.unwrap();
    }
    assert_eq!(seen, [(0x3010, fp_c), (0x2010, fp_b), (0x1010, fp_a)]);
    assert_eq!(iter.previous_transition_frame(), Some(TransitionFrameRef::TopOfStack));
}

#[test]
fn interrupted_thread_without_context_is_fatal() {
    install_thunks();
    let registry = MockRegistry::new(vec![]);
    let thread = MockThread::default();
    let err = unsafe { StackFrameIterator::try_new(&thread, &registry, WalkSeed::InterruptedThread) }
        .err()
        .unwrap();
    assert_eq!(err, UnwindError::ThreadNotSuspended);
}

#[test]
fn interrupted_frame_is_active() {
    install_thunks();
    let mut stack = Stack::new(32);
    let (registry, [fp_c, ..]) = three_frames(&mut stack);
    let mut ctx = limited_context(0x3020, stack.addr(0), fp_c);
    let thread = MockThread {
        interrupted: Some(NonNull::from(&mut *ctx)),
        ..MockThread::default()
    };

    let mut iter =
        unsafe { StackFrameIterator::try_new(&thread, &registry, WalkSeed::InterruptedThread) }
            .unwrap();
    assert!(iter.is_active_stack_frame());
    assert_eq!(iter.control_pc(), 0x3020);
    unsafe { iter.try_next() }.unwrap();
    assert!(!iter.is_active_stack_frame());
    assert_eq!(iter.control_pc(), 0x2010);
}

#[test]
fn transition_frame_into_eh_thunk_is_fatal() {
    install_thunks();
    let registry = MockRegistry::new(vec![Method::new(0x3000)]);
    let thread = MockThread::default();
    let mut stack = Stack::new(8);
    let mut frame = TransitionFrame::new(
        THUNKS.throw_ex2,
        stack.addr(4),
        stack.addr(0),
        TransitionFrameFlags::empty(),
    );
    stack.frame(stack.addr(4), 0, NATIVE_PC);

    let err = unsafe { StackFrameIterator::try_new(&thread, &registry, frame.as_seed()) }
        .err()
        .unwrap();
    assert!(matches!(err, UnwindError::UnexpectedThunk(_)));
}

#[test]
fn unmanaged_limited_context_leaves_iterator_invalid() {
    install_thunks();
    let registry = MockRegistry::new(vec![Method::new(0x3000)]);
    let thread = MockThread::default();
    let mut ctx = limited_context(NATIVE_PC, 0x8000, 0x8010);
    let iter = unsafe {
        StackFrameIterator::from_limited_context(&thread, &registry, NonNull::from(&mut *ctx))
    };
    assert!(!iter.is_valid());
}

#[test]
fn eh_walk_adjusts_return_addresses_and_stops_at_native_frames() {
    install_thunks();
    let mut stack = Stack::new(32);
    let (fp_c, fp_b, fp_a) = (stack.addr(4), stack.addr(10), stack.addr(16));
    stack.frame(fp_c, fp_b, 0x2010);
    stack.frame(fp_b, fp_a, 0x1010);
    stack.frame(fp_a, 0, NATIVE_PC);

    let mut pinvoke = TransitionFrame::new(0, 0, 0, TransitionFrameFlags::empty());
    let mut a = Method::new(0x1000);
    a.reverse_pinvoke = Some(TransitionFrameRef::Frame(NonNull::from(&mut pinvoke.header)));
    let registry = MockRegistry::new(vec![a, Method::new(0x2000), Method::new(0x3000)]);
    let thread = MockThread::default();

    let mut ctx = limited_context(0x3010, stack.addr(0), fp_c);
    let mut iter =
        unsafe { StackFrameIterator::for_eh(&thread, &registry, NonNull::from(&mut *ctx), false) };

    let adjust = arch::RETURN_ADDRESS_ADJUSTMENT;
    let mut pcs = Vec::new();
    while !iter.unwound_reverse_pinvoke() {
        pcs.push(iter.control_pc());
        unsafe { iter.try_next() }.unwrap();
    }
    assert_eq!(pcs, [0x3010 - adjust, 0x2010 - adjust, 0x1010 - adjust]);

    // Positioned on the native caller; there is nothing left to unwind.
    assert!(iter.is_valid());
    assert!(iter.code_manager().is_none());
    assert_eq!(unsafe { iter.try_next() }, Err(UnwindError::NativeFrame));
}

#[test]
fn instruction_fault_is_not_adjusted() {
    install_thunks();
    let mut stack = Stack::new(32);
    let (registry, [fp_c, ..]) = three_frames(&mut stack);
    let thread = MockThread::default();

    let mut ctx = limited_context(0x3010, stack.addr(0), fp_c);
    let mut iter =
        unsafe { StackFrameIterator::for_eh(&thread, &registry, NonNull::from(&mut *ctx), true) };
    assert_eq!(iter.control_pc(), 0x3010);
    unsafe { iter.try_next() }.unwrap();
    assert_eq!(iter.control_pc(), 0x2010 - arch::RETURN_ADDRESS_ADJUSTMENT);
}

#[test]
fn eh_walk_across_throw_site_is_fatal() {
    install_thunks();
    let mut stack = Stack::new(32);
    let fp_c = stack.addr(4);
    stack.frame(fp_c, stack.addr(10), THUNKS.throw_ex2);
    let registry = MockRegistry::new(vec![Method::new(0x3000)]);
    let thread = MockThread::default();

    let mut ctx = limited_context(0x3010, stack.addr(0), fp_c);
    let mut iter =
        unsafe { StackFrameIterator::for_eh(&thread, &registry, NonNull::from(&mut *ctx), false) };
    let err = unsafe { iter.try_next() }.err().unwrap();
    assert!(matches!(err, UnwindError::UnexpectedThunk(_)));
}

#[test]
fn gc_walk_collapses_funclet_into_owner() {
    install_thunks();
    let mut stack = Stack::new(32);
    // F is a funclet of B called directly from B's body; both share B's fp.
    let (fp_f, fp_b, fp_a) = (stack.addr(4), stack.addr(10), stack.addr(16));
    stack.write(fp_f - W, fp_b);
    stack.frame(fp_f, fp_b, 0x2010);
    stack.frame(fp_b, fp_a, 0x1010);
    stack.frame(fp_a, 0, NATIVE_PC);

    let mut a = Method::new(0x1000);
    a.reverse_pinvoke = Some(TransitionFrameRef::TopOfStack);
    let mut f = Method::new(0x4000);
    f.funclet = true;
    let registry = MockRegistry::new(vec![a, Method::new(0x2000), f]);

    let mut ctx = limited_context(0x4010, stack.addr(0), fp_f);
    let thread = MockThread {
        interrupted: Some(NonNull::from(&mut *ctx)),
        ..MockThread::default()
    };
    let mut iter =
        unsafe { StackFrameIterator::try_new(&thread, &registry, WalkSeed::InterruptedThread) }
            .unwrap();
    assert_eq!(iter.frame_pointer(), fp_b);
    assert_eq!(collect_pcs(&mut iter), [0x4010, 0x1010]);
}

#[test]
fn gc_walk_collapses_nested_funclets_into_owner() {
    install_thunks();
    let mut stack = Stack::new(32);
    // G runs inside F and both are funclets of B; all three share B's fp.
    let (fp_g, fp_f, fp_b, fp_a) = (stack.addr(4), stack.addr(8), stack.addr(14), stack.addr(20));
    stack.write(fp_g - W, fp_b);
    stack.frame(fp_g, fp_f, 0x4010);
    stack.write(fp_f - W, fp_b);
    stack.frame(fp_f, fp_b, 0x2010);
    stack.frame(fp_b, fp_a, 0x1010);
    stack.frame(fp_a, 0, NATIVE_PC);

    let mut a = Method::new(0x1000);
    a.reverse_pinvoke = Some(TransitionFrameRef::TopOfStack);
    let mut f = Method::new(0x4000);
    f.funclet = true;
    let mut g = Method::new(0x5000);
    g.funclet = true;
    let registry = MockRegistry::new(vec![a, Method::new(0x2000), f, g]);

    let mut ctx = limited_context(0x5010, stack.addr(0), fp_g);
    let thread = MockThread {
        interrupted: Some(NonNull::from(&mut *ctx)),
        ..MockThread::default()
    };
    let mut iter =
        unsafe { StackFrameIterator::try_new(&thread, &registry, WalkSeed::InterruptedThread) }
            .unwrap();
    assert_eq!(iter.frame_pointer(), fp_b);
    // Neither the outer funclet nor the owner is yielded again.
    assert_eq!(collect_pcs(&mut iter), [0x5010, 0x1010]);
}

#[test]
fn collapse_target_mismatch_is_fatal() {
    install_thunks();
    let mut stack = Stack::new(32);
    let (fp_f, fp_b) = (stack.addr(4), stack.addr(10));
    stack.write(fp_f - W, 0x7770);
    stack.frame(fp_f, fp_b, 0x2010);
    stack.frame(fp_b, 0, NATIVE_PC);

    let mut f = Method::new(0x4000);
    f.funclet = true;
    let registry = MockRegistry::new(vec![Method::new(0x2000), f]);

    let mut ctx = limited_context(0x4010, stack.addr(0), fp_f);
    let thread = MockThread {
        interrupted: Some(NonNull::from(&mut *ctx)),
        ..MockThread::default()
    };
    let mut iter =
        unsafe { StackFrameIterator::try_new(&thread, &registry, WalkSeed::InterruptedThread) }
            .unwrap();
    assert_eq!(
        unsafe { iter.try_next() },
        Err(UnwindError::CollapseMismatch {
            expected: 0x7770,
            found: fp_b,
        })
    );
}

#[test]
fn funclet_returning_into_unknown_thunk_is_fatal() {
    install_thunks();
    let mut stack = Stack::new(32);
    let fp_f = stack.addr(4);
    stack.write(fp_f - W, 0x7770);
    stack.frame(fp_f, 0, THUNKS.universal_transition_return);

    let mut f = Method::new(0x4000);
    f.funclet = true;
    let registry = MockRegistry::new(vec![f]);
    let thread = MockThread::default();

    let mut ctx = limited_context(0x4010, stack.addr(0), fp_f);
    let mut iter = unsafe {
        StackFrameIterator::from_limited_context(&thread, &registry, NonNull::from(&mut *ctx))
    };
    let err = unsafe { iter.try_next() }.err().unwrap();
    assert!(matches!(err, UnwindError::UnexpectedThunk(_)));
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn universal_transition_publishes_conservative_range() {
    install_thunks();
    let layout = arch::universal_transition_frame().unwrap();
    let thunk_words = layout.size() / W;

    // C is called by the universal transition thunk, which was called by B.
    let mut stack = Stack::new(64 + thunk_words);
    let fp_c = stack.addr(4);
    let sp_thunk = fp_c + 2 * W;
    let sp_b = sp_thunk + layout.size();
    let fp_b = sp_b + 4 * W;
    let fp_a = fp_b + 6 * W;

    stack.frame(fp_c, fp_b, THUNKS.universal_transition_return);
    let ra = layout.offset_of(FrameSlot::ReturnAddress).unwrap();
    stack.write(sp_thunk + ra, 0x2010);
    if let Some(off) = layout.offset_of(FrameSlot::Reg(Reg::FP)) {
        stack.write(sp_thunk + off, fp_b);
    }
    stack.frame(fp_b, fp_a, 0x1010);
    stack.frame(fp_a, 0, NATIVE_PC);

    let mut a = Method::new(0x1000);
    a.reverse_pinvoke = Some(TransitionFrameRef::TopOfStack);
    let registry = MockRegistry::new(vec![a, Method::new(0x2000), Method::new(0x3000)]);
    let thread = MockThread::default();

    let mut frame = TransitionFrame::new(0x3010, fp_c, stack.addr(0), TransitionFrameFlags::empty());
    let mut iter = unsafe { StackFrameIterator::try_new(&thread, &registry, frame.as_seed()) }.unwrap();
    assert!(!iter.has_stack_range_to_report_conservatively());

    unsafe { iter.try_next() }.unwrap();
    assert_eq!(iter.control_pc(), 0x2010);
    assert_eq!(iter.register_set().sp(), sp_b);
    let (lower, upper) = iter.stack_range_to_report_conservatively().unwrap();
    let lb = layout.offset_of(FrameSlot::ConservativeLowerBound).unwrap();
    assert_eq!(lower.as_ptr() as usize, sp_thunk + lb);
    assert_eq!(upper.as_ptr() as usize, sp_b + 4 * W);

    unsafe { iter.try_next() }.unwrap();
    assert_eq!(iter.control_pc(), 0x1010);
    assert!(!iter.has_stack_range_to_report_conservatively());
}
