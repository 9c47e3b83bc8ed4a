use criterion::{Criterion, criterion_group, criterion_main};
use mrt_frametable::{
    FrameTable, FrameTableCodeManager, MethodDesc, MethodKind, SafePointDesc, StackBuilder,
    standard_thunk_table,
};
use mrt_runtime::{RuntimeConfig, RuntimeInstance, Thread, gc_scan_roots};
use mrt_unwinder::{GcRootSink, RootFlags, StackFrameIterator, thunks};
use std::hint::black_box;
use std::ptr::NonNull;

criterion_main!(benches);
criterion_group!(benches, measure_walks);

const DEPTHS: [usize; 3] = [4, 32, 256];

struct CountRoots(usize);

impl GcRootSink for CountRoots {
    fn report(&mut self, _location: NonNull<usize>, _flags: RootFlags) {
        self.0 += 1;
    }
}

fn table() -> FrameTable {
    FrameTable::new([
        MethodDesc::new("main", 0x1000, 0x100)
            .with_kind(MethodKind::ReversePinvoke)
            .with_frame_size(16),
        MethodDesc::new("recurse", 0x2000, 0x100)
            .with_frame_size(32)
            .with_safe_point(SafePointDesc {
                offset: 0x20,
                slots: vec![-16, -24],
                ..SafePointDesc::default()
            }),
    ])
    .unwrap()
}

fn measure_walks(c: &mut Criterion) {
    let _ = thunks::install(standard_thunk_table());
    let code_manager = FrameTableCodeManager::new(table()).leak();
    let instance = RuntimeInstance::new(RuntimeConfig::new(), mrt_cli::scenario::HIJACK_TARGETS);
    instance.register_code_module(0x1000..0x2100, code_manager);

    let mut group = c.benchmark_group("walk");
    for depth in DEPTHS {
        let mut builder = StackBuilder::new(code_manager.table(), 64 * (depth + 8));
        builder.call("main", 0x10).unwrap();
        for _ in 0..depth {
            builder.call("recurse", 0x20).unwrap();
        }
        let frame = builder.pinvoke().unwrap();
        let stack = builder.stack();
        let thread = Thread::new(stack.low()..stack.high());
        unsafe { thread.pinvoke_enter(frame) };
        let seed = thread.walk_seed().unwrap();

        group.bench_function(format!("frames/{depth}"), |b| {
            let modules = instance.read_modules();
            b.iter(|| {
                let mut iter = unsafe { StackFrameIterator::new(&thread, &*modules, seed) };
                let mut frames = 0;
                while iter.is_valid() {
                    frames += 1;
                    iter.next();
                }
                black_box(frames)
            })
        });

        group.bench_function(format!("roots/{depth}"), |b| {
            b.iter(|| {
                let mut roots = CountRoots(0);
                gc_scan_roots(&thread, &instance, &mut roots);
                black_box(roots.0)
            })
        });
    }
    group.finish();
}
