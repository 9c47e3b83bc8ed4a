//! The runtime instance: registered code modules, hijack trampolines and the
//! thread store.

use crate::config::RuntimeConfig;
use crate::sync::{ReadGuard, ReaderWriterLock};
use crate::thread_store::ThreadStore;
use core::ops::Range;
use mrt_unwinder::{CodeManager, CodeRegistry, GcRefKind};

/// A range of managed code and the code manager that understands it.
#[derive(Clone)]
pub struct CodeModule {
    pub range: Range<usize>,
    pub code_manager: &'static dyn CodeManager,
}

impl core::fmt::Debug for CodeModule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeModule")
            .field("range", &format_args!("{:#x}..{:#x}", self.range.start, self.range.end))
            .finish_non_exhaustive()
    }
}

/// The registered code modules. Lookups go through the instance's
/// reader/writer lock.
#[derive(Debug, Default)]
pub struct ModuleList {
    modules: Vec<CodeModule>,
}

impl ModuleList {
    pub fn iter(&self) -> impl Iterator<Item = &CodeModule> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn find(&self, pc: usize) -> Option<&CodeModule> {
        self.modules.iter().find(|m| m.range.contains(&pc))
    }
}

impl CodeRegistry for ModuleList {
    fn is_managed(&self, pc: usize) -> bool {
        self.find(pc).is_some()
    }

    fn code_manager_for_address(&self, pc: usize) -> Option<&'static dyn CodeManager> {
        self.find(pc).map(|m| m.code_manager)
    }
}

/// Entry points of the hijack trampolines, one per return-value kind.
///
/// A trampoline saves the return registers into a transition frame flagged
/// with the kind, then calls [`Thread::on_hijack_trip`](crate::Thread::on_hijack_trip).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HijackTargets {
    pub scalar: usize,
    pub object: usize,
    pub byref: usize,
}

impl HijackTargets {
    pub fn for_kind(&self, kind: GcRefKind) -> usize {
        match kind {
            GcRefKind::Scalar => self.scalar,
            GcRefKind::Object => self.object,
            GcRefKind::Byref => self.byref,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr == self.scalar || addr == self.object || addr == self.byref
    }
}

pub struct RuntimeInstance {
    config: RuntimeConfig,
    modules: ReaderWriterLock<ModuleList>,
    hijack_targets: HijackTargets,
    thread_store: ThreadStore,
}

impl RuntimeInstance {
    pub fn new(config: RuntimeConfig, hijack_targets: HijackTargets) -> RuntimeInstance {
        let thread_store = ThreadStore::new(&config);
        let modules = ReaderWriterLock::gc_aware(
            ModuleList::default(),
            config.get_rwlock_spin_count(),
            thread_store.trap_flag(),
        );
        RuntimeInstance {
            config,
            modules,
            hijack_targets,
            thread_store,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn hijack_targets(&self) -> &HijackTargets {
        &self.hijack_targets
    }

    pub fn thread_store(&self) -> &ThreadStore {
        &self.thread_store
    }

    /// Make the code in `range` walkable.
    pub fn register_code_module(&self, range: Range<usize>, code_manager: &'static dyn CodeManager) {
        log::debug!(
            "registering code module {:#x}..{:#x}",
            range.start,
            range.end
        );
        debug_assert!(
            !self
                .modules
                .read()
                .iter()
                .any(|m| m.range.start < range.end && range.start < m.range.end),
            "overlapping code modules"
        );
        self.modules.write().modules.push(CodeModule {
            range,
            code_manager,
        });
    }

    /// The module list, waiting for any writer.
    pub fn read_modules(&self) -> ReadGuard<'_, ModuleList> {
        self.modules.read()
    }

    /// The module list, unless a writer holds or waits for it.
    pub fn try_read_modules(&self) -> Option<ReadGuard<'_, ModuleList>> {
        self.modules.try_read()
    }
}

impl core::fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("config", &self.config)
            .field("modules", &self.modules)
            .field("hijack_targets", &self.hijack_targets)
            .finish_non_exhaustive()
    }
}
