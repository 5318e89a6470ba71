use comet_mp::{gc_state::GcState, mutator::Mutator, Config, Pointer};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn bottom_up_tree(m: &Mutator, depth: u32) -> Pointer {
    let node = m.allocate(2, 0);
    if depth == 0 {
        return node;
    }
    m.push_root(node);
    let left = bottom_up_tree(m, depth - 1);
    m.push_root(left);
    let right = bottom_up_tree(m, depth - 1);
    let left = m.pop_root();
    let node = m.pop_root();
    unsafe {
        m.write_ref(node, 0, left);
        m.write_ref(node, 1, right);
    }
    node
}

fn item_check(m: &Mutator, node: Pointer) -> usize {
    let left = unsafe { m.read_ref(node, 0) };
    if left.is_null() {
        return 1;
    }
    let right = unsafe { m.read_ref(node, 1) };
    1 + item_check(m, left) + item_check(m, right)
}

pub fn bench_allocation(c: &mut Criterion) {
    let gc = GcState::new(Config::default());
    let m = gc.mutator(0).unwrap();

    c.bench_function("fast path (2 refs)", |b| {
        b.iter(|| criterion::black_box(m.allocate(2, 0)))
    });
    c.bench_function("byte vector (64 bytes)", |b| {
        b.iter(|| criterion::black_box(m.allocate_byte_vector(&[7; 64])))
    });

    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);
    for depth in [8u32, 12, 16].iter() {
        group.bench_with_input(BenchmarkId::new("minor cycle", depth), depth, |b, &depth| {
            b.iter(|| {
                let tree = bottom_up_tree(&m, depth);
                assert_eq!(item_check(&m, tree), (1 << (depth + 1)) - 1);
            })
        });
    }
    group.finish();

    c.bench_function("forced major", |b| b.iter(|| m.collect(0, true)));
}

criterion_group!(benches, bench_allocation);
criterion_main!(benches);
