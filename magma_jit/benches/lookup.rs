//! PC-lookup throughput over tables large enough to exercise the
//! binary-search path and small enough to stay in the linear scan.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use magma_jit::{JitCodeManager, JitOptions};

fn anchor() -> usize {
    anchor as usize
}

fn build_manager(methods: usize) -> (JitCodeManager, Vec<usize>) {
    let options = JitOptions::default().with_heap_size(4 * 1024 * 1024);
    let manager = JitCodeManager::new(anchor(), &options).expect("heap");

    let mut pcs = Vec::with_capacity(methods);
    for _ in 0..methods {
        let code = manager
            .heap()
            .alloc_code_with_header(256, 16)
            .expect("code");
        let pdata = manager.heap().alloc_pdata(8).expect("pdata");
        unsafe {
            std::ptr::write_bytes(pdata, 0, 8);
            pdata.add(2).write(2);
        }
        manager.publish_runtime_function(code, 256, pdata, None);
        pcs.push(code as usize + 128);
    }
    manager.update_runtime_function_table();
    (manager, pcs)
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("method_info_for_pc");
    for methods in [8usize, 64, 1024, 8192] {
        let (manager, pcs) = build_manager(methods);
        group.bench_with_input(BenchmarkId::from_parameter(methods), &pcs, |b, pcs| {
            let mut i = 0;
            b.iter(|| {
                let pc = pcs[i % pcs.len()];
                i = i.wrapping_add(1);
                black_box(manager.method_info_for_pc(black_box(pc)))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
