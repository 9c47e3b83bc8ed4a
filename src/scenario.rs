//! Stack scenarios: a method table, a stack described outermost frame first,
//! and the way the walk is seeded.
//!
//! A scenario is simulated in-process on a synthetic stack. Walks of stacks
//! that contradict the method table end the process like any other unwinder
//! failure.

use anyhow::{Context, Result, bail};
use mrt_frametable::{
    FrameTable, FrameTableCodeManager, MethodDesc, StackBuilder, StackEntry, standard_thunk_table,
};
use mrt_runtime::{
    DispatchStep, HijackTargets, RuntimeConfig, RuntimeInstance, Thread, gc_scan_roots, sfi_init,
    sfi_next,
};
use mrt_unwinder::{
    ExInfoIter, ExKind, GcRootSink, NO_CLAUSE, PalLimitedContext, RootFlags, StackFrameIterator,
    thunks,
};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;

/// Trampoline addresses handed to the runtime. Scenarios never trip them.
pub const HIJACK_TARGETS: HijackTargets = HijackTargets {
    scalar: 0x7d00_0010,
    object: 0x7d00_0020,
    byref: 0x7d00_0030,
};

fn default_stack_words() -> usize {
    4096
}

/// Where a walk of the scenario's thread begins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Seed {
    /// The thread is blocked in the last `pinvoke` entry.
    #[default]
    Pinvoke,
    /// The thread was stopped in its innermost frame.
    Interrupted,
    /// Exception dispatch walk from the innermost `throw` entry.
    Exception,
}

/// A scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Scenario {
    #[serde(default = "default_stack_words")]
    pub stack_words: usize,
    #[serde(default)]
    pub seed: Seed,
    #[serde(default)]
    pub config: RuntimeConfig,
    pub methods: Vec<MethodDesc>,
    #[serde(default)]
    pub stack: Vec<StackEntry>,
}

impl Scenario {
    pub fn parse(text: &str) -> Result<Scenario> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Scenario> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario `{}`", path.display()))?;
        Scenario::parse(&text)
            .with_context(|| format!("failed to parse scenario `{}`", path.display()))
    }

    /// Lay out the stack and walk it.
    pub fn simulate(&self) -> Result<WalkReport> {
        thunks::install(standard_thunk_table()).context("failed to install thunk table")?;
        let table = FrameTable::new(self.methods.iter().cloned())?;
        let Some((start, end)) = table.code_range() else {
            bail!("scenario has no methods");
        };
        let code_manager = FrameTableCodeManager::new(table).leak();
        let instance = RuntimeInstance::new(self.config.clone(), HIJACK_TARGETS);
        instance.register_code_module(start..end, code_manager);

        let mut builder = StackBuilder::new(code_manager.table(), self.stack_words);
        let mut pinvoke = None;
        for entry in &self.stack {
            match entry {
                StackEntry::Pinvoke => pinvoke = Some(builder.pinvoke()?),
                _ => builder.apply(entry)?,
            }
        }

        let stack = builder.stack();
        let thread = Thread::new(stack.low()..stack.high());
        // SAFETY: the records live on the synthetic stack, which outlives
        // `thread`.
        let mut records: Vec<_> = unsafe { ExInfoIter::new(builder.ex_info_head()) }.collect();
        records.reverse();
        for record in records {
            unsafe { thread.push_ex_info(record) };
        }

        let mut report = WalkReport {
            seed: self.seed,
            stack_top: stack.high(),
            ..WalkReport::default()
        };
        let mut ctx = builder.context();
        match self.seed {
            Seed::Pinvoke => {
                let frame = pinvoke.context("seed `pinvoke` needs a `pinvoke` stack entry")?;
                unsafe { thread.pinvoke_enter(frame) };
                report.walk_frames(&thread, &instance, code_manager.table());
                report.scan_roots(&thread, &instance);
            }
            Seed::Interrupted => {
                unsafe { thread.set_interrupted_context(Some(NonNull::from(&mut ctx))) };
                report.walk_frames(&thread, &instance, code_manager.table());
                report.scan_roots(&thread, &instance);
                unsafe { thread.set_interrupted_context(None) };
            }
            Seed::Exception => {
                let head = builder
                    .ex_info_head()
                    .context("seed `exception` needs a `throw` stack entry")?;
                // SAFETY: as above.
                let (ex_context, kind) = unsafe { (head.as_ref().ex_context, head.as_ref().kind) };
                report.dispatch_frames(
                    &thread,
                    &instance,
                    code_manager.table(),
                    ex_context,
                    kind.contains(ExKind::HARDWARE_FAULT),
                );
            }
        }
        Ok(report)
    }
}

/// One frame a walk stopped at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FrameReport {
    /// `None` for native code.
    pub method: Option<String>,
    pub pc: usize,
    pub active: bool,
    pub unwound_reverse_pinvoke: bool,
    /// The clause of an older dispatch this frame superseded.
    pub superseded_clause: Option<u32>,
}

/// One reported root slot, by its distance below the top of the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RootReport {
    pub depth: usize,
    pub interior: bool,
    pub pinned: bool,
}

/// Everything a simulated walk saw.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WalkReport {
    pub seed: Seed,
    #[serde(skip)]
    stack_top: usize,
    pub frames: Vec<FrameReport>,
    pub roots: Vec<RootReport>,
    /// `(upper depth, lower depth)` of each conservatively reported range.
    pub conservative_ranges: Vec<(usize, usize)>,
}

impl WalkReport {
    fn method_name(table: &FrameTable, pc: usize) -> Option<String> {
        table.lookup(pc).map(|(_, m)| m.name.clone())
    }

    fn walk_frames(&mut self, thread: &Thread, instance: &RuntimeInstance, table: &FrameTable) {
        let Some(seed) = thread.walk_seed() else {
            return;
        };
        let modules = instance.read_modules();
        // SAFETY: the thread is this one and its stack is not running.
        let mut iter = unsafe { StackFrameIterator::new(thread, &*modules, seed) };
        while iter.is_valid() {
            let pc = iter.control_pc();
            self.frames.push(FrameReport {
                method: WalkReport::method_name(table, pc),
                pc,
                active: iter.is_active_stack_frame(),
                unwound_reverse_pinvoke: iter.unwound_reverse_pinvoke(),
                superseded_clause: None,
            });
            iter.next();
        }
    }

    fn dispatch_frames(
        &mut self,
        thread: &Thread,
        instance: &RuntimeInstance,
        table: &FrameTable,
        ex_context: NonNull<PalLimitedContext>,
        instruction_fault: bool,
    ) {
        let modules = instance.read_modules();
        // SAFETY: the context was captured at the throw site on this stack.
        let mut iter = unsafe { sfi_init(thread, &*modules, Some(ex_context), instruction_fault) };
        let mut step: Option<DispatchStep> = None;
        while iter.is_valid() {
            let pc = iter.control_pc();
            self.frames.push(FrameReport {
                method: WalkReport::method_name(table, pc),
                pc,
                active: iter.is_active_stack_frame(),
                unwound_reverse_pinvoke: step.is_some_and(|s| s.unwound_reverse_pinvoke),
                superseded_clause: step
                    .map(|s| s.ex_collide_clause)
                    .filter(|clause| *clause != NO_CLAUSE),
            });
            // Native frames end a dispatch walk.
            if iter.code_manager().is_none() {
                break;
            }
            step = Some(sfi_next(thread, &mut iter));
        }
    }

    fn scan_roots(&mut self, thread: &Thread, instance: &RuntimeInstance) {
        gc_scan_roots(thread, instance, self);
    }

    fn depth(&self, addr: usize) -> usize {
        self.stack_top.saturating_sub(addr)
    }
}

impl GcRootSink for WalkReport {
    fn report(&mut self, location: NonNull<usize>, flags: RootFlags) {
        let depth = self.depth(location.as_ptr() as usize);
        self.roots.push(RootReport {
            depth,
            interior: flags.contains(RootFlags::INTERIOR),
            pinned: flags.contains(RootFlags::PINNED),
        });
    }

    fn report_conservative_range(&mut self, lower: NonNull<usize>, upper: NonNull<usize>) {
        let range = (
            self.depth(upper.as_ptr() as usize),
            self.depth(lower.as_ptr() as usize),
        );
        self.conservative_ranges.push(range);
    }
}

impl fmt::Display for WalkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frames ({:?} seed):", self.seed)?;
        for (i, frame) in self.frames.iter().enumerate() {
            let name = frame.method.as_deref().unwrap_or("<native>");
            write!(f, "  #{i} {name} pc={:#x}", frame.pc)?;
            if frame.active {
                write!(f, " active")?;
            }
            if frame.unwound_reverse_pinvoke {
                write!(f, " from-native")?;
            }
            if let Some(clause) = frame.superseded_clause {
                write!(f, " superseded-clause={clause}")?;
            }
            writeln!(f)?;
        }
        if !self.roots.is_empty() {
            writeln!(f, "roots:")?;
            for root in &self.roots {
                write!(f, "  top-{:#x}", root.depth)?;
                if root.interior {
                    write!(f, " interior")?;
                }
                if root.pinned {
                    write!(f, " pinned")?;
                }
                writeln!(f)?;
            }
        }
        for (upper, lower) in &self.conservative_ranges {
            writeln!(f, "conservative: top-{upper:#x}..top-{lower:#x}")?;
        }
        Ok(())
    }
}
