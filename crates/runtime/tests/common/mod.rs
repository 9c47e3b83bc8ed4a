#![allow(dead_code, reason = "each test binary uses a different subset")]

use mrt_frametable::{
    FrameTable, FrameTableCodeManager, MethodDesc, MethodKind, ReturnKind, SafePointDesc,
    StackBuilder, standard_thunk_table,
};
use mrt_runtime::{
    HijackTargets, Pal, PalError, PalThreadHandle, RuntimeConfig, RuntimeInstance, Thread,
};
use mrt_unwinder::arch::{SavedSlot, TRANSITION_FRAME_SAVE_ORDER};
use mrt_unwinder::{GcRootSink, PalLimitedContext, Reg, RootFlags, TransitionFrameFlags, thunks};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const W: usize = size_of::<usize>();

pub const TARGETS: HijackTargets = HijackTargets {
    scalar: 0x7d00_0010,
    object: 0x7d00_0020,
    byref: 0x7d00_0030,
};

pub const HANDLE: PalThreadHandle = PalThreadHandle(7);

/// `main` is entered from native code and calls `work`, which calls
/// `leaf`. `dispatch` stands in for the managed exception dispatcher and
/// `handler` is a catch funclet of `work`.
pub fn table() -> FrameTable {
    FrameTable::new([
        MethodDesc::new("main", 0x1000, 0x100)
            .with_kind(MethodKind::ReversePinvoke)
            .with_frame_size(24)
            .with_safe_point(SafePointDesc {
                offset: 0x10,
                slots: vec![-16],
                ..SafePointDesc::default()
            }),
        MethodDesc::new("work", 0x2000, 0x100)
            .with_frame_size(32)
            .with_returns(ReturnKind::Object)
            .with_outgoing_args(16)
            .with_safe_point(SafePointDesc {
                offset: 0x20,
                slots: vec![-16],
                interior_slots: vec![-24],
                ..SafePointDesc::default()
            })
            .with_safe_point(SafePointDesc {
                offset: 0x40,
                slots: vec![-32],
                ..SafePointDesc::default()
            }),
        MethodDesc::new("leaf", 0x3000, 0x100)
            .with_frame_size(16)
            .with_returns(ReturnKind::Byref),
        MethodDesc::new("handler", 0x4000, 0x100)
            .with_kind(MethodKind::Funclet)
            .with_frame_size(16)
            .with_safe_point(SafePointDesc {
                offset: 0x10,
                slots: vec![-16],
                ..SafePointDesc::default()
            }),
        MethodDesc::new("dispatch", 0x5000, 0x100)
            .with_frame_size(16)
            .with_safe_point(SafePointDesc {
                offset: 0x10,
                slots: vec![-16],
                ..SafePointDesc::default()
            }),
    ])
    .unwrap()
}

/// Stops "threads" by handing out a stored register context.
#[derive(Default)]
pub struct SimPal {
    contexts: Mutex<HashMap<PalThreadHandle, PalLimitedContext>>,
    pub calls: AtomicUsize,
}

impl SimPal {
    pub fn set_context(&self, handle: PalThreadHandle, ctx: PalLimitedContext) {
        self.contexts.lock().unwrap().insert(handle, ctx);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Pal for SimPal {
    fn hijack(
        &self,
        thread: PalThreadHandle,
        callback: &mut dyn FnMut(&mut PalLimitedContext),
    ) -> Result<(), PalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut ctx = self
            .contexts
            .lock()
            .unwrap()
            .get(&thread)
            .cloned()
            .ok_or(PalError::InvalidHandle(thread.0))?;
        callback(&mut ctx);
        Ok(())
    }
}

pub struct Fixture {
    pub code_manager: &'static FrameTableCodeManager,
    pub instance: RuntimeInstance,
    pub pal: SimPal,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_config(RuntimeConfig::new())
    }

    pub fn with_config(mut config: RuntimeConfig) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let _ = thunks::install(standard_thunk_table());
        config.suspend_backoff(Duration::from_micros(10), Duration::from_millis(1));
        let code_manager = FrameTableCodeManager::new(table()).leak();
        let instance = RuntimeInstance::new(config, TARGETS);
        instance.register_code_module(0x1000..0x6000, code_manager);
        Fixture {
            code_manager,
            instance,
            pal: SimPal::default(),
        }
    }

    pub fn builder(&self) -> StackBuilder<'static> {
        StackBuilder::new(self.code_manager.table(), 1024)
    }

    /// A thread owning `builder`'s stack, running managed code.
    pub fn running_thread(&self, builder: &StackBuilder<'_>) -> Thread {
        let stack = builder.stack();
        let thread = Thread::new(stack.low()..stack.high()).with_pal_handle(HANDLE);
        thread.reverse_pinvoke_enter(self.instance.thread_store());
        thread
    }

    /// Hijack `thread` the way the suspending thread would, from another OS
    /// thread.
    pub fn hijack(&self, thread: &Thread) -> bool {
        self.hijack_with(thread, &self.pal)
    }

    pub fn hijack_with(&self, thread: &Thread, pal: &(dyn Pal + Sync)) -> bool {
        std::thread::scope(|s| {
            s.spawn(|| thread.hijack(&self.instance, pal))
                .join()
                .unwrap()
        })
    }
}

/// Everything a scan reported, in order.
#[derive(Debug, Default)]
pub struct Roots {
    pub slots: Vec<(usize, RootFlags)>,
    pub ranges: Vec<(usize, usize)>,
}

impl GcRootSink for Roots {
    fn report(&mut self, location: NonNull<usize>, flags: RootFlags) {
        self.slots.push((location.as_ptr() as usize, flags));
    }

    fn report_conservative_range(&mut self, lower: NonNull<usize>, upper: NonNull<usize>) {
        self.ranges
            .push((lower.as_ptr() as usize, upper.as_ptr() as usize));
    }
}

/// The flag saving the return value register in a transition frame.
pub fn return_value_flag() -> TransitionFrameFlags {
    TRANSITION_FRAME_SAVE_ORDER
        .iter()
        .find(|(_, slot)| *slot == SavedSlot::Reg(Reg::RETURN_VALUE))
        .map(|(flag, _)| *flag)
        .unwrap()
}
